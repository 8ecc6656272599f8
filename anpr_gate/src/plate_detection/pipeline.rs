use super::object_detector::ObjectDetector;
use super::overlay::OverlayEntry;
use super::plate_reader::PlateRecognizer;
use super::CapabilityError;
use super::DetectionResult;
use super::Frame;
use super::PlateCandidate;
use super::VehicleCandidate;

use crate::access::AccessResolver;
use crate::events::DetectionEvent;
use crate::events::EventPublisher;
use crate::metrics;
use crate::state::AcceptedAt;
use crate::state::GateState;

use chrono::Utc;
use log::{debug, info, warn};
use opencv::prelude::*;
use thiserror::Error;

use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3);
pub const DEFAULT_OCR_THRESHOLD: f32 = 0.4;
pub const DEFAULT_PLATE_PADDING: i32 = 4;

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub cooldown: Duration,
    pub ocr_threshold: f32,
    pub plate_padding: i32,
    pub vehicle_classes: Vec<i32>,
    pub log_detections: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            ocr_threshold: DEFAULT_OCR_THRESHOLD,
            plate_padding: DEFAULT_PLATE_PADDING,
            vehicle_classes: super::object_detector::VEHICLE_CLASSES.to_vec(),
            log_detections: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("vehicle detection: {0}")]
    VehicleDetector(#[source] CapabilityError),
    #[error("plate detection: {0}")]
    PlateDetector(#[source] CapabilityError),
    #[error("plate crop: {0}")]
    Crop(#[source] opencv::Error),
    #[error("plate recognition: {0}")]
    Recognizer(#[source] CapabilityError),
}

impl PipelineError {
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::VehicleDetector(_) => "vehicle_detector",
            PipelineError::PlateDetector(_) => "plate_detector",
            PipelineError::Crop(_) => "crop",
            PipelineError::Recognizer(_) => "ocr",
        }
    }
}

/// What happened to one frame.
#[derive(Debug)]
pub enum FrameOutcome {
    /// A detection was accepted less than a cooldown ago; nothing was run.
    CoolingDown,
    /// No plate produced valid text.
    NoDetection,
    /// The best valid text scored under the OCR threshold.
    BelowThreshold { text: String, score: f32 },
    Accepted(DetectionResult),
    /// An external capability failed. Treated like `NoDetection` by the caller.
    Failed(PipelineError),
}

/// Turns frames into at most one accepted plate each and acts on acceptance.
///
/// Runs synchronously on the capture worker. All external calls are fallible values; none of
/// their failures leave this type.
pub struct DetectionPipeline {
    vehicle_detector: Box<dyn ObjectDetector>,
    plate_detector: Box<dyn ObjectDetector>,
    recognizer: PlateRecognizer,
    resolver: AccessResolver,
    publisher: EventPublisher,
    state: Arc<GateState>,
    settings: PipelineSettings,
}

impl DetectionPipeline {
    pub fn new(
        vehicle_detector: Box<dyn ObjectDetector>,
        plate_detector: Box<dyn ObjectDetector>,
        recognizer: PlateRecognizer,
        resolver: AccessResolver,
        publisher: EventPublisher,
        state: Arc<GateState>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            vehicle_detector,
            plate_detector,
            recognizer,
            resolver,
            publisher,
            state,
            settings,
        }
    }

    pub fn process(&mut self, frame: &Frame) -> FrameOutcome {
        self.process_at(frame, Instant::now())
    }

    pub fn process_at(&mut self, frame: &Frame, now: Instant) -> FrameOutcome {
        if self.cooling_down(now) {
            metrics::FRAMES_SKIPPED_COOLDOWN.inc();
            return FrameOutcome::CoolingDown;
        }

        let timer = metrics::PIPELINE_SECONDS.start_timer();
        let outcome = match self.find_best(frame) {
            Err(e) => {
                metrics::CAPABILITY_FAILURES
                    .with_label_values(&[e.stage()])
                    .inc();
                warn!("Frame analysis failed: {}", e);
                FrameOutcome::Failed(e)
            }
            Ok(None) => FrameOutcome::NoDetection,
            Ok(Some(best)) if best.score < self.settings.ocr_threshold => {
                metrics::DETECTIONS_BELOW_THRESHOLD.inc();
                debug!("{} below threshold ({:.2})", best.text, best.score);
                FrameOutcome::BelowThreshold {
                    text: best.text,
                    score: best.score,
                }
            }
            Ok(Some(best)) => {
                self.accept(&best, now);
                FrameOutcome::Accepted(best)
            }
        };
        timer.observe_duration();
        outcome
    }

    fn cooling_down(&self, now: Instant) -> bool {
        match self.state.last_accepted() {
            Some(last) => now.saturating_duration_since(last.instant) < self.settings.cooldown,
            None => false,
        }
    }

    fn vehicles(&mut self, frame: &Frame) -> Result<Vec<VehicleCandidate>, PipelineError> {
        let detections = self
            .vehicle_detector
            .detect(&frame.image)
            .map_err(PipelineError::VehicleDetector)?;
        Ok(detections
            .into_iter()
            .filter(|d| self.settings.vehicle_classes.contains(&d.class_id))
            .map(|d| d.bbox)
            .collect())
    }

    /// Plate boxes that have pixels in the frame and, when any vehicle was seen, lie inside one.
    fn plates(
        &mut self,
        frame: &Frame,
        vehicles: &[VehicleCandidate],
    ) -> Result<Vec<PlateCandidate>, PipelineError> {
        let detections = self
            .plate_detector
            .detect(&frame.image)
            .map_err(PipelineError::PlateDetector)?;

        let (width, height) = (frame.width(), frame.height());
        Ok(detections
            .into_iter()
            .filter_map(|d| {
                let crop = d
                    .bbox
                    .padded_crop(self.settings.plate_padding, width, height)?;
                let inside_vehicle = vehicles.iter().any(|v| v.contains(&d.bbox));
                if !vehicles.is_empty() && !inside_vehicle {
                    debug!("Plate {:?} is outside every vehicle", d.bbox);
                    return None;
                }
                Some(PlateCandidate { bbox: d.bbox, crop })
            })
            .collect())
    }

    /// Best valid plate text in the frame, regardless of threshold. Ties keep the first plate.
    fn find_best(&mut self, frame: &Frame) -> Result<Option<DetectionResult>, PipelineError> {
        let vehicles = self.vehicles(frame)?;
        let plates = self.plates(frame, &vehicles)?;

        let mut best: Option<DetectionResult> = None;
        for plate in plates {
            let crop = Mat::roi(&frame.image, plate.crop)
                .and_then(|roi| roi.try_clone())
                .map_err(PipelineError::Crop)?;
            let Some(recognized) = self
                .recognizer
                .recognize(&crop)
                .map_err(PipelineError::Recognizer)?
            else {
                continue;
            };

            let incumbent = best.as_ref().map_or(0.0, |b| b.score);
            if recognized.confidence > incumbent {
                best = Some(DetectionResult {
                    text: recognized.text,
                    score: recognized.confidence,
                    bbox: plate.bbox,
                    captured_at: frame.captured_at,
                });
            }
        }
        Ok(best)
    }

    fn accept(&mut self, detection: &DetectionResult, now: Instant) {
        metrics::DETECTIONS_ACCEPTED.inc();
        self.state.mark_accepted(AcceptedAt {
            instant: now,
            wall: Utc::now(),
        });
        self.state.overlay.write(OverlayEntry {
            text: detection.text.clone(),
            bbox: detection.bbox,
            timestamp: now,
        });

        let Some(decision) = self.resolver.resolve(detection) else {
            info!("Plate {} detected ({:.2}), not registered", detection.text, detection.score);
            return;
        };
        if self.settings.log_detections {
            info!(
                "DETECTION: {} - {}",
                decision.plate,
                if decision.access_granted {
                    "GRANTED"
                } else {
                    "DENIED"
                }
            );
        }
        let event = DetectionEvent {
            decision,
            timestamp: detection.captured_at,
        };
        if !self.publisher.publish(event) {
            warn!("Event distributor is gone, dropping detection {}", detection.text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{StaticRegistry, VehicleRecord};
    use crate::plate_detection::dnn_ocr::TextReader;
    use crate::plate_detection::plate_reader::DEFAULT_MIN_CROP_HEIGHT;
    use crate::plate_detection::{BoundingBox, Detection, OcrCandidate};
    use crossbeam::channel::{unbounded, Receiver};
    use opencv::core::{Scalar, CV_8UC3};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedDetector {
        boxes: Vec<Detection>,
        calls: Arc<AtomicUsize>,
    }

    impl ObjectDetector for FixedDetector {
        fn detect(&mut self, _frame: &Mat) -> Result<Vec<Detection>, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.boxes.clone())
        }
    }

    struct FailingDetector;

    impl ObjectDetector for FailingDetector {
        fn detect(&mut self, _frame: &Mat) -> Result<Vec<Detection>, CapabilityError> {
            Err(CapabilityError::Ocr("model crashed".to_string()))
        }
    }

    struct FailingOcr {
        calls: Arc<AtomicUsize>,
    }

    impl TextReader for FailingOcr {
        fn read(&mut self, _image: &Mat) -> Result<Vec<OcrCandidate>, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::Ocr("tesseract lost its data".to_string()))
        }
    }

    /// Returns the same batch for the first variant of every crop, nothing for the others.
    struct PerCropOcr {
        batch: Vec<OcrCandidate>,
        calls: Arc<Mutex<usize>>,
    }

    impl TextReader for PerCropOcr {
        fn read(&mut self, _image: &Mat) -> Result<Vec<OcrCandidate>, CapabilityError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls % 3 == 1 {
                Ok(self.batch.clone())
            } else {
                Ok(vec![])
            }
        }
    }

    struct Harness {
        pipeline: DetectionPipeline,
        state: Arc<GateState>,
        events: Receiver<DetectionEvent>,
        detector_calls: Arc<AtomicUsize>,
        ocr_calls: Arc<Mutex<usize>>,
    }

    fn detection(x1: i32, y1: i32, x2: i32, y2: i32, class_id: i32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2, 0.8),
            class_id,
        }
    }

    fn harness(vehicles: Vec<Detection>, plates: Vec<Detection>, ocr: Vec<OcrCandidate>) -> Harness {
        let detector_calls = Arc::new(AtomicUsize::new(0));
        let ocr_calls = Arc::new(Mutex::new(0));
        let state = Arc::new(GateState::default());
        let (tx, events) = unbounded();
        let registry = StaticRegistry::new(vec![VehicleRecord {
            plate: "AB123CD".to_string(),
            allowed: true,
            reason: None,
            owner: Some("Ana".to_string()),
            phone: None,
            email: None,
            department: None,
        }]);

        let pipeline = DetectionPipeline::new(
            Box::new(FixedDetector {
                boxes: vehicles,
                calls: detector_calls.clone(),
            }),
            Box::new(FixedDetector {
                boxes: plates,
                calls: detector_calls.clone(),
            }),
            PlateRecognizer::new(
                Box::new(PerCropOcr {
                    batch: ocr,
                    calls: ocr_calls.clone(),
                }),
                DEFAULT_MIN_CROP_HEIGHT,
            ),
            AccessResolver::new(Box::new(registry)),
            EventPublisher::new(tx),
            state.clone(),
            PipelineSettings::default(),
        );
        Harness {
            pipeline,
            state,
            events,
            detector_calls,
            ocr_calls,
        }
    }

    fn frame() -> Frame {
        Frame::new(Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(90.0)).unwrap())
    }

    fn plate_ocr(score: f32) -> Vec<OcrCandidate> {
        vec![
            OcrCandidate::new("AB123CD", score),
            OcrCandidate::new("AB128CD", 0.3),
        ]
    }

    #[test]
    fn plate_inside_vehicle_is_accepted() {
        let mut h = harness(
            vec![detection(10, 10, 200, 200, 2)],
            vec![detection(50, 50, 150, 90, 0)],
            plate_ocr(0.6),
        );
        match h.pipeline.process(&frame()) {
            FrameOutcome::Accepted(result) => {
                assert_eq!(result.text, "AB123CD");
                assert_eq!(result.score, 0.6);
                assert_eq!(result.bbox, BoundingBox::new(50, 50, 150, 90, 0.8));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(h.state.last_accepted().is_some());
        assert_eq!(h.events.try_recv().unwrap().decision.plate, "AB123CD");
    }

    #[test]
    fn plate_outside_every_vehicle_is_rejected() {
        let mut h = harness(
            vec![detection(160, 100, 300, 230, 2)],
            vec![detection(50, 50, 150, 90, 0)],
            plate_ocr(0.6),
        );
        assert!(matches!(
            h.pipeline.process(&frame()),
            FrameOutcome::NoDetection
        ));
        assert_eq!(*h.ocr_calls.lock().unwrap(), 0);
    }

    #[test]
    fn without_vehicles_plates_are_accepted_unconditionally() {
        let mut h = harness(vec![], vec![detection(50, 50, 150, 90, 0)], plate_ocr(0.6));
        assert!(matches!(
            h.pipeline.process(&frame()),
            FrameOutcome::Accepted(_)
        ));
    }

    #[test]
    fn non_vehicle_classes_do_not_count_as_vehicles() {
        // A person (class 0) box elsewhere must not trigger the containment filter.
        let mut h = harness(
            vec![detection(160, 100, 300, 230, 0)],
            vec![detection(50, 50, 150, 90, 0)],
            plate_ocr(0.6),
        );
        assert!(matches!(
            h.pipeline.process(&frame()),
            FrameOutcome::Accepted(_)
        ));
    }

    #[test]
    fn low_ocr_confidence_emits_nothing() {
        let mut h = harness(
            vec![detection(10, 10, 200, 200, 2)],
            vec![detection(50, 50, 150, 90, 0)],
            plate_ocr(0.35),
        );
        match h.pipeline.process(&frame()) {
            FrameOutcome::BelowThreshold { text, score } => {
                assert_eq!(text, "AB123CD");
                assert_eq!(score, 0.35);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(h.state.last_accepted().is_none());
        assert!(h.state.overlay.peek(DEFAULT_COOLDOWN).is_none());
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn cooldown_suppresses_all_work_and_emission() {
        let mut h = harness(
            vec![detection(10, 10, 200, 200, 2)],
            vec![detection(50, 50, 150, 90, 0)],
            plate_ocr(0.6),
        );
        let t0 = Instant::now();
        assert!(matches!(
            h.pipeline.process_at(&frame(), t0),
            FrameOutcome::Accepted(_)
        ));
        let overlay = h.state.overlay.peek_at(DEFAULT_COOLDOWN, t0).unwrap();
        let detector_calls = h.detector_calls.load(Ordering::SeqCst);
        let ocr_calls = *h.ocr_calls.lock().unwrap();

        let t1 = t0 + Duration::from_secs(1);
        assert!(matches!(
            h.pipeline.process_at(&frame(), t1),
            FrameOutcome::CoolingDown
        ));
        assert_eq!(h.detector_calls.load(Ordering::SeqCst), detector_calls);
        assert_eq!(*h.ocr_calls.lock().unwrap(), ocr_calls);
        assert_eq!(h.state.overlay.peek_at(DEFAULT_COOLDOWN, t1), Some(overlay));
        assert_eq!(h.events.try_iter().count(), 1);

        // The window is anchored to the accepted detection.
        let t3 = t0 + Duration::from_secs(3);
        assert!(matches!(
            h.pipeline.process_at(&frame(), t3),
            FrameOutcome::Accepted(_)
        ));
    }

    #[test]
    fn rejected_frames_do_not_start_a_cooldown() {
        let mut h = harness(vec![], vec![detection(50, 50, 150, 90, 0)], plate_ocr(0.2));
        let t0 = Instant::now();
        h.pipeline.process_at(&frame(), t0);
        h.pipeline.process_at(&frame(), t0 + Duration::from_millis(100));
        assert_eq!(h.detector_calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn strongest_plate_in_the_frame_wins() {
        // Two plates; OCR gives the same text to both, so the first one keeps the tie.
        let mut h = harness(
            vec![],
            vec![detection(50, 50, 150, 90, 0), detection(160, 120, 260, 160, 0)],
            plate_ocr(0.6),
        );
        match h.pipeline.process(&frame()) {
            FrameOutcome::Accepted(result) => assert_eq!(result.bbox.x1, 50),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn unregistered_plates_update_overlay_but_send_no_event() {
        let mut h = harness(
            vec![],
            vec![detection(50, 50, 150, 90, 0)],
            vec![OcrCandidate::new("ZZ999ZZ", 0.9)],
        );
        assert!(matches!(
            h.pipeline.process(&frame()),
            FrameOutcome::Accepted(_)
        ));
        assert_eq!(
            h.state.overlay.peek(DEFAULT_COOLDOWN).map(|e| e.text),
            Some("ZZ999ZZ".to_string())
        );
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn detector_failure_degrades_to_no_detection() {
        let mut h = harness(vec![], vec![detection(50, 50, 150, 90, 0)], plate_ocr(0.6));
        h.pipeline.vehicle_detector = Box::new(FailingDetector);
        match h.pipeline.process(&frame()) {
            FrameOutcome::Failed(e) => assert_eq!(e.stage(), "vehicle_detector"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(h.state.last_accepted().is_none());
    }

    #[test]
    fn plate_detector_failure_degrades_to_no_detection() {
        let mut h = harness(vec![], vec![detection(50, 50, 150, 90, 0)], plate_ocr(0.6));
        h.pipeline.plate_detector = Box::new(FailingDetector);
        let t0 = Instant::now();
        match h.pipeline.process_at(&frame(), t0) {
            FrameOutcome::Failed(e) => assert_eq!(e.stage(), "plate_detector"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(*h.ocr_calls.lock().unwrap(), 0);
        assert!(h.state.last_accepted().is_none());
        assert!(h.events.try_recv().is_err());

        // No cooldown was started, so the next frame runs the detectors again.
        let calls = h.detector_calls.load(Ordering::SeqCst);
        assert!(matches!(
            h.pipeline.process_at(&frame(), t0 + Duration::from_millis(100)),
            FrameOutcome::Failed(_)
        ));
        assert!(h.detector_calls.load(Ordering::SeqCst) > calls);
    }

    #[test]
    fn ocr_failure_degrades_to_no_detection() {
        let mut h = harness(
            vec![detection(10, 10, 200, 200, 2)],
            vec![detection(50, 50, 150, 90, 0)],
            plate_ocr(0.6),
        );
        let ocr_calls = Arc::new(AtomicUsize::new(0));
        h.pipeline.recognizer = PlateRecognizer::new(
            Box::new(FailingOcr {
                calls: ocr_calls.clone(),
            }),
            DEFAULT_MIN_CROP_HEIGHT,
        );
        let t0 = Instant::now();
        match h.pipeline.process_at(&frame(), t0) {
            FrameOutcome::Failed(e) => {
                assert_eq!(e.stage(), "ocr");
                assert!(matches!(e, PipelineError::Recognizer(_)));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(h.state.last_accepted().is_none());
        assert!(h.state.overlay.peek_at(DEFAULT_COOLDOWN, t0).is_none());
        assert!(h.events.try_recv().is_err());

        let calls = ocr_calls.load(Ordering::SeqCst);
        assert!(calls > 0);
        h.pipeline.process_at(&frame(), t0 + Duration::from_millis(100));
        assert!(ocr_calls.load(Ordering::SeqCst) > calls);
    }

    #[test]
    fn plates_outside_the_frame_are_skipped() {
        let mut h = harness(vec![], vec![detection(400, 300, 500, 340, 0)], plate_ocr(0.6));
        assert!(matches!(
            h.pipeline.process(&frame()),
            FrameOutcome::NoDetection
        ));
        assert_eq!(*h.ocr_calls.lock().unwrap(), 0);
    }
}
