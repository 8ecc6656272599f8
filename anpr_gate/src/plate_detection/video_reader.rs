use super::Frame;

use log::{debug, info, warn};
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use opencv::prelude::VideoCaptureTrait;
use opencv::prelude::VideoCaptureTraitConst;
use opencv::videoio;
use opencv::videoio::VideoCapture;
use thiserror::Error;

use std::fmt;

/// Indices probed after the requested one.
const FALLBACK_INDICES: std::ops::Range<i32> = 0..4;

/// Which camera to open: an explicit URL wins, otherwise a device index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraSpec {
    pub url: Option<String>,
    pub index: i32,
}

impl CameraSpec {
    /// Identifier reported in status queries.
    pub fn device_id(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => self.index.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backend {
    pub id: i32,
    pub name: &'static str,
}

/// Platform-preferred capture APIs first, OpenCV's automatic choice last.
pub fn platform_backends() -> Vec<Backend> {
    let mut backends = vec![];
    if cfg!(target_os = "windows") {
        backends.push(Backend {
            id: videoio::CAP_DSHOW,
            name: "CAP_DSHOW",
        });
        backends.push(Backend {
            id: videoio::CAP_MSMF,
            name: "CAP_MSMF",
        });
    } else if cfg!(target_os = "linux") {
        backends.push(Backend {
            id: videoio::CAP_V4L2,
            name: "CAP_V4L2",
        });
    } else if cfg!(target_os = "macos") {
        backends.push(Backend {
            id: videoio::CAP_AVFOUNDATION,
            name: "CAP_AVFOUNDATION",
        });
    }
    backends.push(Backend {
        id: videoio::CAP_ANY,
        name: "default",
    });
    backends
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureCandidate {
    Url(String),
    Device { index: i32, backend: Backend },
}

impl fmt::Display for CaptureCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureCandidate::Url(url) => write!(f, "url {}", url),
            CaptureCandidate::Device { index, backend } => {
                write!(f, "index {} with backend {}", index, backend.name)
            }
        }
    }
}

/// Every way of opening the camera, in the order they are tried: the URL, then the requested
/// index followed by indices 0..4 without repeats, each with every backend.
pub fn capture_candidates(spec: &CameraSpec, backends: &[Backend]) -> Vec<CaptureCandidate> {
    let mut candidates = vec![];
    if let Some(url) = &spec.url {
        candidates.push(CaptureCandidate::Url(url.clone()));
    }

    let mut indices = vec![spec.index];
    indices.extend(FALLBACK_INDICES.filter(|i| *i != spec.index));

    for index in indices {
        for backend in backends {
            candidates.push(CaptureCandidate::Device {
                index,
                backend: *backend,
            });
        }
    }
    candidates
}

#[derive(Debug, Error)]
pub enum FrameSourceError {
    #[error("no camera could be opened, tried: {}", .tried.join("; "))]
    NoDevice { tried: Vec<String> },
    #[error("camera returned no frame")]
    ReadFailed,
    #[error("camera returned an empty frame")]
    EmptyFrame,
    #[error("camera already released")]
    Released,
    #[error("camera backend error: {0}")]
    Backend(#[from] opencv::Error),
}

/// An opened capture device.
pub trait CaptureDevice: Send {
    /// Grabs the next image into `image`. `Ok(false)` when no frame was available.
    fn read(&mut self, image: &mut Mat) -> opencv::Result<bool>;
    fn release(&mut self) -> opencv::Result<()>;
}

/// Opens capture devices. `Ok(None)` means the candidate is not usable.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, candidate: &CaptureCandidate) -> opencv::Result<Option<Box<dyn CaptureDevice>>>;
}

pub struct OpenCvDevice {
    capture: VideoCapture,
}

impl CaptureDevice for OpenCvDevice {
    fn read(&mut self, image: &mut Mat) -> opencv::Result<bool> {
        self.capture.read(image)
    }

    fn release(&mut self) -> opencv::Result<()> {
        self.capture.release()
    }
}

unsafe impl Send for OpenCvDevice {}

#[derive(Default)]
pub struct OpenCvOpener {}

impl DeviceOpener for OpenCvOpener {
    fn open(&self, candidate: &CaptureCandidate) -> opencv::Result<Option<Box<dyn CaptureDevice>>> {
        let mut capture = match candidate {
            CaptureCandidate::Url(url) => VideoCapture::from_file(url, videoio::CAP_ANY)?,
            CaptureCandidate::Device { index, backend } => VideoCapture::new(*index, backend.id)?,
        };

        if capture.is_opened()? {
            Ok(Some(Box::new(OpenCvDevice { capture })))
        } else {
            capture.release()?;
            Ok(None)
        }
    }
}

/// The camera, once opened. Produces a fresh [`Frame`] per read.
pub struct FrameSource {
    device: Option<Box<dyn CaptureDevice>>,
    opened: CaptureCandidate,
}

impl FrameSource {
    /// Tries every candidate in order; the first that opens wins. Exhausting the list is a
    /// hard failure and is not retried here.
    pub fn open(
        spec: &CameraSpec,
        backends: &[Backend],
        opener: &dyn DeviceOpener,
    ) -> Result<Self, FrameSourceError> {
        let candidates = capture_candidates(spec, backends);
        for candidate in candidates.iter() {
            match opener.open(candidate) {
                Ok(Some(device)) => {
                    info!("Camera opened: {}", candidate);
                    return Ok(Self {
                        device: Some(device),
                        opened: candidate.clone(),
                    });
                }
                Ok(None) => debug!("Camera not available: {}", candidate),
                Err(e) => debug!("Camera probe {} failed: {}", candidate, e),
            }
        }

        Err(FrameSourceError::NoDevice {
            tried: candidates.iter().map(|c| c.to_string()).collect(),
        })
    }

    pub fn opened(&self) -> &CaptureCandidate {
        &self.opened
    }

    pub fn read(&mut self) -> Result<Frame, FrameSourceError> {
        let device = self.device.as_mut().ok_or(FrameSourceError::Released)?;
        let mut image = Mat::default();
        if !device.read(&mut image)? {
            return Err(FrameSourceError::ReadFailed);
        }
        if image.empty() {
            return Err(FrameSourceError::EmptyFrame);
        }
        Ok(Frame::new(image))
    }

    /// Releases the device. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(mut device) = self.device.take() {
            match device.release() {
                Ok(()) => info!("Camera released: {}", self.opened),
                Err(e) => warn!("Releasing camera {} failed: {}", self.opened, e),
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.release();
    }
}
