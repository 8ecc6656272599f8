use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref FRAMES_CAPTURED: IntCounter = register_int_counter!(
        "anpr_frames_captured_total",
        "Frames read from the camera"
    )
    .expect("metric can be registered");
    pub static ref FRAME_READ_FAILURES: IntCounter = register_int_counter!(
        "anpr_frame_read_failures_total",
        "Failed camera reads"
    )
    .expect("metric can be registered");
    pub static ref FRAMES_SKIPPED_COOLDOWN: IntCounter = register_int_counter!(
        "anpr_frames_skipped_cooldown_total",
        "Frames not analysed because a detection was accepted recently"
    )
    .expect("metric can be registered");
    pub static ref DETECTIONS_ACCEPTED: IntCounter = register_int_counter!(
        "anpr_detections_accepted_total",
        "Plates accepted by the pipeline"
    )
    .expect("metric can be registered");
    pub static ref DETECTIONS_BELOW_THRESHOLD: IntCounter = register_int_counter!(
        "anpr_detections_below_threshold_total",
        "Valid plate text rejected for low OCR confidence"
    )
    .expect("metric can be registered");
    pub static ref CAPABILITY_FAILURES: IntCounterVec = register_int_counter_vec!(
        "anpr_capability_failures_total",
        "Detector, OCR or image failures by pipeline stage",
        &["stage"]
    )
    .expect("metric can be registered");
    pub static ref EVENTS_BROADCAST: IntCounter = register_int_counter!(
        "anpr_events_broadcast_total",
        "Detection events handed to subscribers"
    )
    .expect("metric can be registered");
    pub static ref SUBSCRIBERS: IntGauge =
        register_int_gauge!("anpr_subscribers", "Connected event subscribers")
            .expect("metric can be registered");
    pub static ref PIPELINE_SECONDS: Histogram = register_histogram!(
        "anpr_pipeline_seconds",
        "Time spent analysing one frame"
    )
    .expect("metric can be registered");
}

/// Text exposition of every registered metric.
pub fn render() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        log::warn!("Cannot encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
