pub mod bounding_box_render;
pub mod dnn_ocr;
pub mod object_detector;
pub mod overlay;
pub mod pipeline;
pub mod plate_format;
pub mod plate_reader;
pub mod stream;
pub mod video_reader;

use chrono::{DateTime, Utc};
use opencv::core::Rect;
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use thiserror::Error;

/// A captured camera image. Replaced wholesale on every read, never mutated in place.
pub struct Frame {
    pub image: Mat,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: Mat) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
        }
    }

    pub fn width(&self) -> i32 {
        self.image.cols()
    }

    pub fn height(&self) -> i32 {
        self.image.rows()
    }

    /// Deep copy, used to hand a frame to readers on other threads.
    pub fn try_clone(&self) -> opencv::Result<Frame> {
        Ok(Frame {
            image: self.image.try_clone()?,
            captured_at: self.captured_at,
        })
    }
}

/// Integer pixel rectangle in corner form plus the score of whoever produced it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32, confidence: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
        }
    }

    pub fn from_rect(rect: Rect, confidence: f32) -> Self {
        Self::new(
            rect.x,
            rect.y,
            rect.x + rect.width,
            rect.y + rect.height,
            confidence,
        )
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn to_rect(&self) -> Rect {
        Rect::new(self.x1, self.y1, self.width(), self.height())
    }

    /// True when `inner` lies fully inside this box, edges included.
    pub fn contains(&self, inner: &BoundingBox) -> bool {
        inner.x1 >= self.x1 && inner.y1 >= self.y1 && inner.x2 <= self.x2 && inner.y2 <= self.y2
    }

    /// Crop region for this box grown by `pad` pixels on every side and clamped to a
    /// `width` x `height` image. `None` when the unpadded box has no pixels inside the image.
    pub fn padded_crop(&self, pad: i32, width: i32, height: i32) -> Option<Rect> {
        let x1 = self.x1.clamp(0, width);
        let y1 = self.y1.clamp(0, height);
        let x2 = self.x2.clamp(0, width);
        let y2 = self.y2.clamp(0, height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        let x1 = (self.x1 - pad).max(0);
        let y1 = (self.y1 - pad).max(0);
        let x2 = (self.x2 + pad).min(width);
        let y2 = (self.y2 + pad).min(height);
        Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
    }
}

/// One box reported by an object detector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: i32,
}

/// Vehicle box that passed the class filter.
pub type VehicleCandidate = BoundingBox;

/// Plate box accepted by the containment filter, with the padded region handed to OCR.
#[derive(Clone, Copy, Debug)]
pub struct PlateCandidate {
    pub bbox: BoundingBox,
    pub crop: Rect,
}

/// Raw text read from one preprocessing variant.
#[derive(Clone, Debug, PartialEq)]
pub struct OcrCandidate {
    pub text: String,
    pub confidence: f32,
}

impl OcrCandidate {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Canonical plate text that passed format validation.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognizedPlate {
    pub text: String,
    pub confidence: f32,
}

/// The single accepted detection of a frame. `bbox.confidence` is the plate detector score,
/// `score` the OCR confidence.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionResult {
    pub text: String,
    pub score: f32,
    pub bbox: BoundingBox,
    pub captured_at: DateTime<Utc>,
}

impl DetectionResult {
    pub fn detector_confidence(&self) -> f32 {
        self.bbox.confidence
    }
}

/// Failure of an external capability (detector, OCR engine) or of the image operations
/// around it. Kept apart from "found nothing", which is an empty result.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("{model} inference failed: {source}")]
    Inference {
        model: &'static str,
        #[source]
        source: opencv::Error,
    },
    #[error("unexpected {model} output shape {shape:?}")]
    OutputShape {
        model: &'static str,
        shape: Vec<i32>,
    },
    #[error("ocr engine failed: {0}")]
    Ocr(String),
    #[error("image operation failed: {0}")]
    Image(#[from] opencv::Error),
}
