//! State shared between the capture worker (sole writer) and the HTTP side (readers).

use crate::plate_detection::overlay::OverlayState;
use crate::plate_detection::Frame;

use chrono::{DateTime, Utc};
use crossbeam::atomic::AtomicCell;
use log::warn;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Latest captured frame. Replaced wholesale, readers get their own copy.
#[derive(Default)]
pub struct FrameSlot {
    current: Mutex<Option<Frame>>,
}

impl FrameSlot {
    pub fn publish(&self, frame: Frame) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(frame);
        }
    }

    pub fn snapshot(&self) -> Option<Frame> {
        let current = self.current.lock().ok()?;
        match current.as_ref().map(Frame::try_clone) {
            Some(Ok(frame)) => Some(frame),
            Some(Err(e)) => {
                warn!("Cannot copy current frame: {}", e);
                None
            }
            None => None,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
    }
}

/// When the last detection was accepted: monotonic for the cooldown, wall clock for status.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AcceptedAt {
    pub instant: Instant,
    pub wall: DateTime<Utc>,
}

#[derive(Default)]
pub struct GateState {
    pub frames: FrameSlot,
    pub overlay: OverlayState,
    last_accepted: AtomicCell<Option<AcceptedAt>>,
    running: AtomicBool,
}

impl GateState {
    pub fn last_accepted(&self) -> Option<AcceptedAt> {
        self.last_accepted.load()
    }

    pub fn mark_accepted(&self, at: AcceptedAt) {
        self.last_accepted.store(Some(at));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}
