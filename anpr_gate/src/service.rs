//! The camera service: one explicitly owned object that runs the capture worker.
//!
//! The worker opens the camera, then reads frames in a loop, publishing each one for viewers
//! and running the detection pipeline on it before the next read. `start` and `stop` are
//! idempotent and may be called repeatedly; the same pipeline (and its loaded models) is reused
//! across restarts.

use crate::metrics;
use crate::plate_detection::pipeline::{DetectionPipeline, FrameOutcome};
use crate::plate_detection::video_reader::{
    Backend, CameraSpec, DeviceOpener, FrameSource, FrameSourceError,
};
use crate::state::GateState;
use crate::utils::FpsLimiter;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_READ_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("cannot spawn capture worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("capture worker panicked, detection pipeline lost")]
    PipelineLost,
}

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub camera: CameraSpec,
    pub backends: Vec<Backend>,
    /// Zero means as fast as the camera and the pipeline allow.
    pub max_fps: u32,
    pub read_backoff: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub device_id: String,
    pub last_detection_timestamp: Option<DateTime<Utc>>,
}

pub struct CameraService {
    settings: CaptureSettings,
    opener: Arc<dyn DeviceOpener>,
    state: Arc<GateState>,
    pipeline: Arc<Mutex<DetectionPipeline>>,
    worker: Mutex<Option<Worker>>,
}

/// One capture run. Each run owns its stop flag so a restart never clears an older run's signal.
struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl CameraService {
    pub fn new(
        settings: CaptureSettings,
        opener: Arc<dyn DeviceOpener>,
        state: Arc<GateState>,
        pipeline: DetectionPipeline,
    ) -> Self {
        Self {
            settings,
            opener,
            state,
            pipeline: Arc::new(Mutex::new(pipeline)),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> Arc<GateState> {
        self.state.clone()
    }

    /// Launches the capture worker unless one is already running.
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut worker = self.worker.lock().map_err(|_| ServiceError::PipelineLost)?;
        if let Some(run) = worker.as_ref() {
            if !run.handle.is_finished() {
                debug!("Capture already running");
                return Ok(());
            }
        }
        // A worker that ended on its own (open failure) is reaped before relaunching.
        if let Some(run) = worker.take() {
            if run.handle.join().is_err() {
                return Err(ServiceError::PipelineLost);
            }
        }
        if self.pipeline.is_poisoned() {
            return Err(ServiceError::PipelineLost);
        }

        self.state.set_running(true);

        let stop = Arc::new(AtomicBool::new(false));
        let settings = self.settings.clone();
        let opener = self.opener.clone();
        let state = self.state.clone();
        let pipeline = self.pipeline.clone();
        let run_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || capture(settings, opener.as_ref(), state, pipeline, run_stop))
            .map_err(|e| {
                self.state.set_running(false);
                ServiceError::Spawn(e)
            })?;
        *worker = Some(Worker { stop, handle });
        info!("Capture started for camera {}", self.settings.camera.device_id());
        Ok(())
    }

    /// Signals the worker, waits for its current iteration to finish and for the camera to be
    /// released. Safe to call when not running.
    pub fn stop(&self) {
        let run = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        let Some(run) = run else {
            return;
        };

        run.stop.store(true, Ordering::SeqCst);
        if run.handle.join().is_err() {
            error!("Capture worker panicked");
        }

        // A start that slipped in during the join owns the running flag and the frame slot now.
        let Ok(worker) = self.worker.lock() else {
            return;
        };
        if worker.is_none() {
            self.state.set_running(false);
            self.state.frames.clear();
        }
        info!("Capture stopped");
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            running: self.state.is_running(),
            device_id: self.settings.camera.device_id(),
            last_detection_timestamp: self.state.last_accepted().map(|at| at.wall),
        }
    }
}

impl Drop for CameraService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture(
    settings: CaptureSettings,
    opener: &dyn DeviceOpener,
    state: Arc<GateState>,
    pipeline: Arc<Mutex<DetectionPipeline>>,
    stop: Arc<AtomicBool>,
) {
    // Held for the whole run, so a newer run only opens the camera once this one released it.
    let Ok(mut pipeline) = pipeline.lock() else {
        error!("Detection pipeline unavailable");
        state.set_running(false);
        return;
    };
    let mut source = match FrameSource::open(&settings.camera, &settings.backends, opener) {
        Ok(source) => source,
        Err(e) => {
            error!("Capture not started: {}", e);
            state.set_running(false);
            return;
        }
    };

    let mut limiter = FpsLimiter::new(settings.max_fps);
    while !stop.load(Ordering::SeqCst) {
        limiter.wait();
        let frame = match source.read() {
            Ok(frame) => frame,
            Err(FrameSourceError::Released) => break,
            Err(e) => {
                metrics::FRAME_READ_FAILURES.inc();
                warn!("Frame read failed: {}, retrying in {:?}", e, settings.read_backoff);
                spin_sleep::sleep(settings.read_backoff);
                continue;
            }
        };
        metrics::FRAMES_CAPTURED.inc();

        match frame.try_clone() {
            Ok(copy) => state.frames.publish(copy),
            Err(e) => warn!("Cannot publish frame: {}", e),
        }
        match pipeline.process(&frame) {
            FrameOutcome::Accepted(result) => {
                debug!("Accepted {} ({:.2})", result.text, result.score)
            }
            outcome => debug!("Frame outcome: {:?}", outcome),
        }
    }

    source.release();
}
