//! Gate configuration: an optional TOML file resolved against defaults, then environment
//! overrides, then validation.

use crate::access::{StaticRegistry, VehicleRecord};
use crate::plate_detection::object_detector::{YoloLayout, YoloSettings, VEHICLE_CLASSES};
use crate::plate_detection::pipeline::{
    PipelineSettings, DEFAULT_COOLDOWN, DEFAULT_OCR_THRESHOLD, DEFAULT_PLATE_PADDING,
};
use crate::plate_detection::plate_reader::DEFAULT_MIN_CROP_HEIGHT;
use crate::plate_detection::stream::DEFAULT_JPEG_QUALITY;
use crate::plate_detection::video_reader::{platform_backends, CameraSpec};
use crate::service::{CaptureSettings, DEFAULT_READ_BACKOFF};

use serde::Deserialize;
use thiserror::Error;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
const DEFAULT_VEHICLE_MODEL: &str = "models/yolov8n.onnx";
const DEFAULT_PLATE_MODEL: &str = "models/plate.onnx";
const DEFAULT_INPUT_SIZE: i32 = 640;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.25;
const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
const DEFAULT_TESSDATA: &str = "models";
const DEFAULT_LANGUAGE: &str = "eng";
const DEFAULT_OVERLAY_TTL_SECS: f64 = 3.0;
const DEFAULT_STREAM_FPS: u32 = 15;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct GateConfigFile {
    camera: Option<CameraConfigFile>,
    detection: Option<DetectionConfigFile>,
    models: Option<ModelsConfigFile>,
    overlay: Option<OverlayConfigFile>,
    stream: Option<StreamConfigFile>,
    server: Option<ServerConfigFile>,
    vehicles: Option<Vec<VehicleRecord>>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    index: Option<i32>,
    max_fps: Option<u32>,
    read_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    cooldown_secs: Option<f64>,
    ocr_threshold: Option<f32>,
    min_crop_height: Option<i32>,
    plate_padding: Option<i32>,
    vehicle_classes: Option<Vec<i32>>,
    log_detections: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelsConfigFile {
    vehicle_model: Option<String>,
    plate_model: Option<String>,
    layout: Option<String>,
    input_size: Option<i32>,
    score_threshold: Option<f32>,
    nms_threshold: Option<f32>,
    use_gpu: Option<bool>,
    tessdata: Option<String>,
    language: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OverlayConfigFile {
    ttl_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    fps: Option<u32>,
    jpeg_quality: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    listen: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub url: Option<String>,
    pub index: i32,
    pub max_fps: u32,
    pub read_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub cooldown_secs: f64,
    pub ocr_threshold: f32,
    pub min_crop_height: i32,
    pub plate_padding: i32,
    pub vehicle_classes: Vec<i32>,
    pub log_detections: bool,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub vehicle_model: String,
    pub plate_model: String,
    pub layout: String,
    pub input_size: i32,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub use_gpu: bool,
    pub tessdata: String,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub fps: u32,
    pub jpeg_quality: i32,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub camera: CameraSettings,
    pub detection: DetectionSettings,
    pub models: ModelSettings,
    pub overlay_ttl_secs: f64,
    pub stream: StreamSettings,
    pub listen: String,
    /// Start capturing at boot instead of waiting for an operator.
    pub autostart: bool,
    pub vehicles: Vec<VehicleRecord>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::from_file(GateConfigFile::default())
    }
}

impl GateConfig {
    /// Reads `path` if given, applies process environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => read_config_file(path)?,
            None => GateConfigFile::default(),
        };
        let mut cfg = Self::from_file(file);
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses TOML text without looking at the environment.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg = Self::from_file(toml::from_str(text)?);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GateConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let models = file.models.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();

        Self {
            camera: CameraSettings {
                url: camera.url,
                index: camera.index.unwrap_or(0),
                max_fps: camera.max_fps.unwrap_or(0),
                read_backoff: camera
                    .read_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_READ_BACKOFF),
            },
            detection: DetectionSettings {
                cooldown_secs: detection
                    .cooldown_secs
                    .unwrap_or(DEFAULT_COOLDOWN.as_secs_f64()),
                ocr_threshold: detection.ocr_threshold.unwrap_or(DEFAULT_OCR_THRESHOLD),
                min_crop_height: detection
                    .min_crop_height
                    .unwrap_or(DEFAULT_MIN_CROP_HEIGHT),
                plate_padding: detection.plate_padding.unwrap_or(DEFAULT_PLATE_PADDING),
                vehicle_classes: detection
                    .vehicle_classes
                    .unwrap_or_else(|| VEHICLE_CLASSES.to_vec()),
                log_detections: detection.log_detections.unwrap_or(false),
            },
            models: ModelSettings {
                vehicle_model: models
                    .vehicle_model
                    .unwrap_or_else(|| DEFAULT_VEHICLE_MODEL.to_string()),
                plate_model: models
                    .plate_model
                    .unwrap_or_else(|| DEFAULT_PLATE_MODEL.to_string()),
                layout: models.layout.unwrap_or_else(|| "v8".to_string()),
                input_size: models.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
                score_threshold: models.score_threshold.unwrap_or(DEFAULT_SCORE_THRESHOLD),
                nms_threshold: models.nms_threshold.unwrap_or(DEFAULT_NMS_THRESHOLD),
                use_gpu: models.use_gpu.unwrap_or(false),
                tessdata: models
                    .tessdata
                    .unwrap_or_else(|| DEFAULT_TESSDATA.to_string()),
                language: models
                    .language
                    .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            },
            overlay_ttl_secs: file
                .overlay
                .and_then(|overlay| overlay.ttl_secs)
                .unwrap_or(DEFAULT_OVERLAY_TTL_SECS),
            stream: StreamSettings {
                fps: stream.fps.unwrap_or(DEFAULT_STREAM_FPS),
                jpeg_quality: stream.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            listen: file
                .server
                .and_then(|server| server.listen)
                .unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
            autostart: false,
            vehicles: file.vehicles.unwrap_or_default(),
        }
    }

    /// Applies `CAMERA_URL`, `ENABLE_CAMERA` and `DETECTIONS_LOG` as returned by `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("CAMERA_URL") {
            if !url.trim().is_empty() {
                self.camera.url = Some(url.trim().to_string());
            }
        }
        if let Some(flag) = lookup("ENABLE_CAMERA") {
            self.autostart = parse_flag("ENABLE_CAMERA", &flag)?;
        }
        if let Some(flag) = lookup("DETECTIONS_LOG") {
            self.detection.log_detections = parse_flag("DETECTIONS_LOG", &flag)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.detection.ocr_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(
                "detection.ocr_threshold",
                format!("{} is outside [0, 1]", threshold),
            ));
        }
        check_seconds("detection.cooldown_secs", self.detection.cooldown_secs)?;
        check_seconds("overlay.ttl_secs", self.overlay_ttl_secs)?;
        if self.detection.min_crop_height <= 0 {
            return Err(invalid("detection.min_crop_height", "must be positive"));
        }
        if self.detection.plate_padding < 0 {
            return Err(invalid("detection.plate_padding", "must not be negative"));
        }
        if self.stream.fps == 0 {
            return Err(invalid("stream.fps", "must be positive"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(invalid(
                "stream.jpeg_quality",
                format!("{} is outside 1..=100", self.stream.jpeg_quality),
            ));
        }
        if self.models.input_size <= 0 {
            return Err(invalid("models.input_size", "must be positive"));
        }
        self.layout()?;
        self.listen_addr()?;
        Ok(())
    }

    pub fn layout(&self) -> Result<YoloLayout, ConfigError> {
        self.models
            .layout
            .parse()
            .map_err(|e: String| invalid("models.layout", e))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| invalid("server.listen", format!("{:?} is not an address", self.listen)))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.detection.cooldown_secs)
    }

    pub fn overlay_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.overlay_ttl_secs)
    }

    pub fn camera_spec(&self) -> CameraSpec {
        CameraSpec {
            url: self.camera.url.clone(),
            index: self.camera.index,
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            camera: self.camera_spec(),
            backends: platform_backends(),
            max_fps: self.camera.max_fps,
            read_backoff: self.camera.read_backoff,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            cooldown: self.cooldown(),
            ocr_threshold: self.detection.ocr_threshold,
            plate_padding: self.detection.plate_padding,
            vehicle_classes: self.detection.vehicle_classes.clone(),
            log_detections: self.detection.log_detections,
        }
    }

    fn yolo(&self, model_path: &str, classes: Option<Vec<i32>>) -> Result<YoloSettings, ConfigError> {
        Ok(YoloSettings {
            model_path: model_path.to_string(),
            layout: self.layout()?,
            input_size: self.models.input_size,
            score_threshold: self.models.score_threshold,
            nms_threshold: self.models.nms_threshold,
            use_gpu: self.models.use_gpu,
            classes,
        })
    }

    pub fn vehicle_model(&self) -> Result<YoloSettings, ConfigError> {
        self.yolo(
            &self.models.vehicle_model,
            Some(self.detection.vehicle_classes.clone()),
        )
    }

    pub fn plate_model(&self) -> Result<YoloSettings, ConfigError> {
        self.yolo(&self.models.plate_model, None)
    }

    pub fn registry(&self) -> StaticRegistry {
        StaticRegistry::new(self.vehicles.iter().cloned())
    }
}

fn read_config_file(path: &Path) -> Result<GateConfigFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

fn check_seconds(key: &'static str, value: f64) -> Result<(), ConfigError> {
    Duration::try_from_secs_f64(value)
        .map(|_| ())
        .map_err(|e| invalid(key, format!("{} is not a duration: {}", value, e)))
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid(key, format!("{:?} is not a boolean", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = GateConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.cooldown(), Duration::from_secs(3));
        assert_eq!(cfg.overlay_ttl(), Duration::from_secs(3));
        assert_eq!(cfg.detection.ocr_threshold, 0.4);
        assert_eq!(cfg.detection.min_crop_height, 80);
        assert_eq!(cfg.detection.plate_padding, 4);
        assert_eq!(cfg.detection.vehicle_classes, vec![2, 3, 5, 7]);
        assert_eq!(cfg.camera.index, 0);
        assert_eq!(cfg.camera.read_backoff, Duration::from_secs(1));
        assert_eq!(cfg.stream.fps, 15);
        assert_eq!(cfg.layout().unwrap(), YoloLayout::V8);
        assert_eq!(cfg.listen_addr().unwrap().port(), 8000);
        assert!(!cfg.autostart);
        assert!(cfg.registry().is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[camera]
url = "rtsp://gate/stream"
index = 2

[detection]
cooldown_secs = 5.0
ocr_threshold = 0.5

[models]
layout = "v5"

[server]
listen = "127.0.0.1:9000"

[[vehicles]]
plate = "AB123CD"
allowed = true
owner = "Ana"

[[vehicles]]
plate = "ZZ999ZZ"
allowed = false
reason = "fees overdue"
"#
        )
        .unwrap();

        let cfg = GateConfig::from_file(read_config_file(file.path()).unwrap());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.camera_spec().device_id(), "rtsp://gate/stream");
        assert_eq!(cfg.camera.index, 2);
        assert_eq!(cfg.cooldown(), Duration::from_secs(5));
        assert_eq!(cfg.pipeline_settings().ocr_threshold, 0.5);
        assert_eq!(cfg.plate_model().unwrap().layout, YoloLayout::V5);
        assert_eq!(
            cfg.vehicle_model().unwrap().classes,
            Some(vec![2, 3, 5, 7])
        );
        assert_eq!(cfg.listen_addr().unwrap().port(), 9000);
        assert_eq!(cfg.registry().len(), 2);
    }

    #[test]
    fn environment_overrides_camera_and_switches() {
        let mut cfg = GateConfig::default();
        cfg.apply_env(env(&[
            ("CAMERA_URL", "http://phone:4747/video"),
            ("ENABLE_CAMERA", "true"),
            ("DETECTIONS_LOG", "1"),
        ]))
        .unwrap();
        assert_eq!(cfg.camera.url.as_deref(), Some("http://phone:4747/video"));
        assert!(cfg.autostart);
        assert!(cfg.pipeline_settings().log_detections);

        let mut cfg = GateConfig::default();
        cfg.apply_env(env(&[("CAMERA_URL", "  ")])).unwrap();
        assert_eq!(cfg.camera.url, None);
        assert!(cfg.apply_env(env(&[("ENABLE_CAMERA", "maybe")])).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            "[detection]\nocr_threshold = 1.5",
            "[detection]\ncooldown_secs = -1.0",
            "[detection]\ncooldown_secs = 1e20",
            "[detection]\ncooldown_secs = nan",
            "[detection]\nmin_crop_height = 0",
            "[overlay]\nttl_secs = -2.0",
            "[overlay]\nttl_secs = inf",
            "[stream]\nfps = 0",
            "[stream]\njpeg_quality = 0",
            "[models]\nlayout = \"v3\"",
            "[server]\nlisten = \"not an address\"",
        ];
        for case in cases {
            match GateConfig::from_toml_str(case) {
                Err(ConfigError::Invalid { .. }) => {}
                other => panic!("{:?} accepted: {:?}", case, other.map(|_| ())),
            }
        }
    }

    #[test]
    fn unknown_sections_and_missing_files_are_errors() {
        assert!(matches!(
            GateConfig::from_toml_str("[camra]\nindex = 1"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            GateConfig::load(Some(Path::new("/nonexistent/anpr_gate.toml"))),
            Err(ConfigError::Read { .. })
        ));
    }
}
