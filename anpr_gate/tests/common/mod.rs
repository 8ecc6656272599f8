#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anpr_gate::access::{AccessResolver, StaticRegistry, VehicleRecord};
use anpr_gate::events::EventDistributor;
use anpr_gate::plate_detection::dnn_ocr::TextReader;
use anpr_gate::plate_detection::object_detector::ObjectDetector;
use anpr_gate::plate_detection::pipeline::{DetectionPipeline, PipelineSettings};
use anpr_gate::plate_detection::plate_reader::{PlateRecognizer, DEFAULT_MIN_CROP_HEIGHT};
use anpr_gate::plate_detection::video_reader::{CaptureCandidate, CaptureDevice, DeviceOpener};
use anpr_gate::plate_detection::{BoundingBox, CapabilityError, Detection, Frame, OcrCandidate};
use anpr_gate::state::GateState;
use opencv::core::{Scalar, CV_8UC3};
use opencv::prelude::*;

pub const CAR: i32 = 2;

pub fn detection(x1: i32, y1: i32, x2: i32, y2: i32, class_id: i32) -> Detection {
    Detection {
        bbox: BoundingBox::new(x1, y1, x2, y2, 0.8),
        class_id,
    }
}

pub fn image() -> Mat {
    Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(90.0)).unwrap()
}

pub fn frame() -> Frame {
    Frame::new(image())
}

/// Returns the same boxes for every frame and counts calls.
pub struct FixedDetector {
    pub boxes: Vec<Detection>,
    pub calls: Arc<AtomicUsize>,
}

impl ObjectDetector for FixedDetector {
    fn detect(&mut self, _frame: &Mat) -> Result<Vec<Detection>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.boxes.clone())
    }
}

/// Reads the same text from every image.
pub struct ScriptedOcr {
    pub text: String,
    pub confidence: f32,
}

impl TextReader for ScriptedOcr {
    fn read(&mut self, _image: &Mat) -> Result<Vec<OcrCandidate>, CapabilityError> {
        Ok(vec![OcrCandidate::new(self.text.clone(), self.confidence)])
    }
}

pub fn registry() -> StaticRegistry {
    StaticRegistry::new(vec![
        VehicleRecord {
            plate: "AB123CD".to_string(),
            allowed: true,
            reason: None,
            owner: Some("Ana Lopez".to_string()),
            phone: Some("555-0101".to_string()),
            email: None,
            department: Some("4B".to_string()),
        },
        VehicleRecord {
            plate: "ZZ999ZZ".to_string(),
            allowed: false,
            reason: None,
            owner: Some("Luis Perez".to_string()),
            phone: None,
            email: None,
            department: None,
        },
    ])
}

pub struct Gate {
    pub state: Arc<GateState>,
    pub distributor: EventDistributor,
    pub detector_calls: Arc<AtomicUsize>,
}

/// A pipeline over a car at (10,10)-(200,200) and a plate at (50,50)-(150,90) reading `text`.
pub fn pipeline(text: &str, confidence: f32) -> (DetectionPipeline, Gate) {
    let state = Arc::new(GateState::default());
    let distributor = EventDistributor::new(std::time::Duration::from_millis(20));
    let detector_calls = Arc::new(AtomicUsize::new(0));

    let pipeline = DetectionPipeline::new(
        Box::new(FixedDetector {
            boxes: vec![detection(10, 10, 200, 200, CAR)],
            calls: detector_calls.clone(),
        }),
        Box::new(FixedDetector {
            boxes: vec![detection(50, 50, 150, 90, 0)],
            calls: detector_calls.clone(),
        }),
        PlateRecognizer::new(
            Box::new(ScriptedOcr {
                text: text.to_string(),
                confidence,
            }),
            DEFAULT_MIN_CROP_HEIGHT,
        ),
        AccessResolver::new(Box::new(registry())),
        distributor.publisher(),
        state.clone(),
        PipelineSettings::default(),
    );
    (
        pipeline,
        Gate {
            state,
            distributor,
            detector_calls,
        },
    )
}

/// Yields a frame on every read until released.
pub struct FakeCamera {
    pub reads: Arc<AtomicUsize>,
}

impl CaptureDevice for FakeCamera {
    fn read(&mut self, frame: &mut Mat) -> opencv::Result<bool> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        *frame = image();
        std::thread::sleep(std::time::Duration::from_millis(5));
        Ok(true)
    }

    fn release(&mut self) -> opencv::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeOpener {
    pub reads: Arc<AtomicUsize>,
}

impl DeviceOpener for FakeOpener {
    fn open(&self, _candidate: &CaptureCandidate) -> opencv::Result<Option<Box<dyn CaptureDevice>>> {
        Ok(Some(Box::new(FakeCamera {
            reads: self.reads.clone(),
        })))
    }
}

pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    false
}
