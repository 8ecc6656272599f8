use super::dnn_ocr::TextReader;
use super::plate_format::parse_plate;
use super::CapabilityError;
use super::RecognizedPlate;

use log::debug;
use opencv::core::bitwise_not;
use opencv::core::Size;
use opencv::core::BORDER_DEFAULT;
use opencv::imgproc::adaptive_threshold;
use opencv::imgproc::bilateral_filter;
use opencv::imgproc::create_clahe;
use opencv::imgproc::cvt_color;
use opencv::imgproc::equalize_hist;
use opencv::imgproc::gaussian_blur;
use opencv::imgproc::resize;
use opencv::imgproc::threshold;
use opencv::imgproc::ADAPTIVE_THRESH_GAUSSIAN_C;
use opencv::imgproc::COLOR_BGR2GRAY;
use opencv::imgproc::INTER_CUBIC;
use opencv::imgproc::THRESH_BINARY;
use opencv::imgproc::THRESH_OTSU;
use opencv::prelude::*;

pub const DEFAULT_MIN_CROP_HEIGHT: i32 = 80;

/// Turns a plate crop into validated, canonical plate text.
///
/// The crop is upscaled when short, binarized three different ways and each variant is read
/// independently. Every candidate that fits the plate template competes on OCR confidence.
pub struct PlateRecognizer {
    ocr: Box<dyn TextReader>,
    min_crop_height: i32,
}

impl PlateRecognizer {
    pub fn new(ocr: Box<dyn TextReader>, min_crop_height: i32) -> Self {
        Self {
            ocr,
            min_crop_height,
        }
    }

    pub fn recognize(&mut self, crop: &Mat) -> Result<Option<RecognizedPlate>, CapabilityError> {
        let crop = upscale(crop, self.min_crop_height)?;
        let variants = preprocess(&crop)?;

        let mut best: Option<RecognizedPlate> = None;
        for (name, variant) in variants.iter() {
            let candidates = self.ocr.read(variant)?;
            for candidate in candidates {
                let Some(text) = parse_plate(&candidate.text) else {
                    debug!("{} variant: rejected {:?}", name, candidate.text);
                    continue;
                };
                let incumbent = best.as_ref().map_or(0.0, |b| b.confidence);
                if candidate.confidence > incumbent {
                    best = Some(RecognizedPlate {
                        text,
                        confidence: candidate.confidence,
                    });
                }
            }
        }
        Ok(best)
    }
}

/// Scales the crop up to `min_height` rows, keeping the aspect ratio.
fn upscale(crop: &Mat, min_height: i32) -> opencv::Result<Mat> {
    let rows = crop.rows();
    if rows >= min_height || rows == 0 {
        return crop.try_clone();
    }

    let scale = min_height as f64 / rows as f64;
    let size = Size::new(
        (crop.cols() as f64 * scale) as i32,
        (rows as f64 * scale) as i32,
    );
    let mut resized = Mat::default();
    resize(crop, &mut resized, size, 0.0, 0.0, INTER_CUBIC)?;
    Ok(resized)
}

fn to_gray(image: &Mat) -> opencv::Result<Mat> {
    if image.channels() == 1 {
        return image.try_clone();
    }
    let mut gray = Mat::default();
    cvt_color(image, &mut gray, COLOR_BGR2GRAY, 0)?;
    Ok(gray)
}

/// The three binarizations handed to OCR, in a fixed order.
fn preprocess(crop: &Mat) -> opencv::Result<[(&'static str, Mat); 3]> {
    let gray = to_gray(crop)?;

    // equalize, blur, adaptive threshold
    let mut equalized = Mat::default();
    equalize_hist(&gray, &mut equalized)?;
    let mut blurred = Mat::default();
    gaussian_blur(
        &equalized,
        &mut blurred,
        Size::new(3, 3),
        0.0,
        0.0,
        BORDER_DEFAULT,
    )?;
    let mut adaptive = Mat::default();
    adaptive_threshold(
        &blurred,
        &mut adaptive,
        255.0,
        ADAPTIVE_THRESH_GAUSSIAN_C,
        THRESH_BINARY,
        11,
        2.0,
    )?;

    // CLAHE, bilateral, Otsu
    let mut clahe = create_clahe(2.0, Size::new(8, 8))?;
    let mut contrasted = Mat::default();
    clahe.apply(&gray, &mut contrasted)?;
    let mut smoothed = Mat::default();
    bilateral_filter(&contrasted, &mut smoothed, 7, 50.0, 50.0, BORDER_DEFAULT)?;
    let mut otsu = Mat::default();
    threshold(
        &smoothed,
        &mut otsu,
        0.0,
        255.0,
        THRESH_BINARY | THRESH_OTSU,
    )?;

    let mut inverted = Mat::default();
    bitwise_not(&adaptive, &mut inverted, &Mat::default())?;

    Ok([
        ("adaptive", adaptive),
        ("otsu", otsu),
        ("inverted", inverted),
    ])
}
