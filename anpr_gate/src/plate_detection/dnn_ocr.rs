use super::CapabilityError;
use super::OcrCandidate;

use leptess::tesseract;
use leptess::tesseract::TessApi;
use log::debug;

use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use opencv::prelude::MatTraitConstManual;

use std::ffi::CString;

const PLATE_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
// Treat the image as a single text line.
const PAGE_SEG_SINGLE_LINE: &str = "7";

/// External OCR capability: reads text from one preprocessed image.
pub trait TextReader: Send {
    fn read(&mut self, image: &Mat) -> Result<Vec<OcrCandidate>, CapabilityError>;
}

pub struct TesseractReader {
    ocr: TessApi,
}

impl TesseractReader {
    pub fn new(data_path: &str, language: &str) -> Result<Self, CapabilityError> {
        let mut api = tesseract::TessApi::new(Some(data_path), language).map_err(|e| {
            CapabilityError::Ocr(format!(
                "cannot load language {language} from {data_path}: {e:?}"
            ))
        })?;
        set_variable(&mut api, "tessedit_char_whitelist", PLATE_ALPHABET)?;
        set_variable(&mut api, "tessedit_pageseg_mode", PAGE_SEG_SINGLE_LINE)?;

        Ok(Self { ocr: api })
    }
}

fn set_variable(api: &mut TessApi, name: &str, value: &str) -> Result<(), CapabilityError> {
    let name_cstr = CString::new(name).map_err(|e| CapabilityError::Ocr(e.to_string()))?;
    let value_cstr = CString::new(value).map_err(|e| CapabilityError::Ocr(e.to_string()))?;
    api.raw
        .set_variable(&name_cstr, &value_cstr)
        .map_err(|e| CapabilityError::Ocr(format!("cannot set {name}: {e:?}")))
}

// TessApi holds a raw pointer; the reader is only ever driven from the capture worker.
unsafe impl Send for TesseractReader {}

impl TextReader for TesseractReader {
    fn read(&mut self, image: &Mat) -> Result<Vec<OcrCandidate>, CapabilityError> {
        // Tesseract wants a tightly packed buffer.
        let contiguous;
        let image = if image.is_continuous() {
            image
        } else {
            contiguous = image.try_clone()?;
            &contiguous
        };

        let cols = image.cols();
        let rows = image.rows();
        let channels = image.channels();
        self.ocr
            .raw
            .set_image(image.data_bytes()?, cols, rows, channels, cols * channels)
            .map_err(|e| CapabilityError::Ocr(format!("cannot set image: {e:?}")))?;

        let text = self
            .ocr
            .get_utf8_text()
            .map_err(|e| CapabilityError::Ocr(e.to_string()))?;
        let confidence = self.ocr.mean_text_conf().clamp(0, 100) as f32 / 100.0;

        let text = text.trim();
        debug!("OCR {:?} ({:.2}) on {}x{}", text, confidence, cols, rows);
        if text.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![OcrCandidate::new(text, confidence)])
    }
}
