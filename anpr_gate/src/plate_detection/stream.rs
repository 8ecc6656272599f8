use super::bounding_box_render::{draw_overlay, encode_jpeg};
use super::overlay::DEFAULT_OVERLAY_TTL;
use crate::state::GateState;

use log::warn;

use std::sync::Arc;
use std::time::Duration;

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const DEFAULT_JPEG_QUALITY: i32 = 80;

/// Wraps one encoded image as a multipart part.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY);
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// Produces the annotated MJPEG parts for viewers. Reads shared state only; never blocks the
/// capture worker beyond a frame copy.
#[derive(Clone)]
pub struct StreamCompositor {
    state: Arc<GateState>,
    overlay_ttl: Duration,
    jpeg_quality: i32,
}

impl StreamCompositor {
    pub fn new(state: Arc<GateState>) -> Self {
        Self {
            state,
            overlay_ttl: DEFAULT_OVERLAY_TTL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_overlay_ttl(mut self, ttl: Duration) -> Self {
        self.overlay_ttl = ttl;
        self
    }

    pub fn with_jpeg_quality(mut self, quality: i32) -> Self {
        self.jpeg_quality = quality;
        self
    }

    /// Next part: the current frame with the live overlay drawn on a copy, or an empty
    /// placeholder when there is no frame or it cannot be encoded.
    pub fn compose(&self) -> Vec<u8> {
        let Some(mut frame) = self.state.frames.snapshot() else {
            return multipart_part(&[]);
        };
        if let Some(entry) = self.state.overlay.peek(self.overlay_ttl) {
            if let Err(e) = draw_overlay(&mut frame.image, &entry) {
                warn!("Cannot draw overlay: {}", e);
            }
        }
        match encode_jpeg(&frame.image, self.jpeg_quality) {
            Ok(jpeg) => multipart_part(&jpeg),
            Err(e) => {
                warn!("Cannot encode stream frame: {}", e);
                multipart_part(&[])
            }
        }
    }

    /// Endless parts, one per call to `next`. Pacing is up to the consumer.
    pub fn frames(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        std::iter::repeat_with(move || self.compose())
    }
}
