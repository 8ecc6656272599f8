use super::BoundingBox;
use super::CapabilityError;
use super::Detection;

use log::debug;
use opencv::core::Rect;
use opencv::core::Scalar;
use opencv::core::Size;
use opencv::core::Vector;
use opencv::core::CV_32F;
use opencv::dnn;
use opencv::dnn::blob_from_image;
use opencv::dnn::nms_boxes;
use opencv::dnn::Net;
use opencv::dnn::DNN_BACKEND_CUDA;
use opencv::dnn::DNN_BACKEND_OPENCV;
use opencv::dnn::DNN_TARGET_CPU;
use opencv::dnn::DNN_TARGET_CUDA;
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use opencv::prelude::MatTraitConstManual;
use opencv::prelude::NetTrait;
use opencv::prelude::NetTraitConst;

use std::str::FromStr;

/// COCO ids for car, motorcycle, bus and truck.
pub const VEHICLE_CLASSES: [i32; 4] = [2, 3, 5, 7];

/// External object detection capability. Stateless per call from the caller's point of view.
pub trait ObjectDetector: Send {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>, CapabilityError>;
}

/// Output tensor layout of the exported YOLO model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum YoloLayout {
    /// `[1, anchors, 5 + classes]` with an objectness column.
    V5,
    /// `[1, 4 + classes, anchors]`, class scores only.
    V8,
}

impl FromStr for YoloLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v5" | "yolov5" => Ok(YoloLayout::V5),
            "v8" | "yolov8" => Ok(YoloLayout::V8),
            other => Err(format!("unknown YOLO layout {other:?}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct YoloSettings {
    pub model_path: String,
    pub layout: YoloLayout,
    pub input_size: i32,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub use_gpu: bool,
    /// Keep only these class ids; `None` keeps everything.
    pub classes: Option<Vec<i32>>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct RawBox {
    rect: Rect,
    score: f32,
    class_id: i32,
}

/// Scale from network input space back to image pixels.
#[derive(Clone, Copy, Debug)]
struct Scale {
    x: f32,
    y: f32,
}

fn to_rect(cx: f32, cy: f32, w: f32, h: f32, scale: Scale) -> Rect {
    let left = (cx - 0.5 * w) * scale.x;
    let top = (cy - 0.5 * h) * scale.y;
    Rect::new(
        left as i32,
        top as i32,
        (w * scale.x) as i32,
        (h * scale.y) as i32,
    )
}

fn best_class(scores: impl Iterator<Item = f32>) -> Option<(i32, f32)> {
    scores
        .enumerate()
        .fold(None, |best: Option<(i32, f32)>, (i, s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i as i32, s)),
        })
}

trait YoloProcessor: Send + Sync {
    fn post_process(
        &self,
        data: &[f32],
        shape: &[i32],
        scale: Scale,
        threshold: f32,
    ) -> Result<Vec<RawBox>, CapabilityError>;
}

struct YoloProcessorV5 {}

impl YoloProcessor for YoloProcessorV5 {
    fn post_process(
        &self,
        data: &[f32],
        shape: &[i32],
        scale: Scale,
        threshold: f32,
    ) -> Result<Vec<RawBox>, CapabilityError> {
        let (anchors, width) = match shape {
            [1, anchors, width] if *width > 5 => (*anchors as usize, *width as usize),
            _ => {
                return Err(CapabilityError::OutputShape {
                    model: "yolov5",
                    shape: shape.to_vec(),
                })
            }
        };

        let mut boxes = vec![];
        for row in data.chunks_exact(width).take(anchors) {
            let objectness = row[4];
            if objectness < threshold {
                continue;
            }
            if let Some((class_id, class_score)) = best_class(row[5..].iter().copied()) {
                let score = objectness * class_score;
                if score >= threshold {
                    boxes.push(RawBox {
                        rect: to_rect(row[0], row[1], row[2], row[3], scale),
                        score,
                        class_id,
                    });
                }
            }
        }
        Ok(boxes)
    }
}

struct YoloProcessorV8 {}

impl YoloProcessor for YoloProcessorV8 {
    fn post_process(
        &self,
        data: &[f32],
        shape: &[i32],
        scale: Scale,
        threshold: f32,
    ) -> Result<Vec<RawBox>, CapabilityError> {
        let (channels, anchors) = match shape {
            [1, channels, anchors] if *channels > 4 => (*channels as usize, *anchors as usize),
            _ => {
                return Err(CapabilityError::OutputShape {
                    model: "yolov8",
                    shape: shape.to_vec(),
                })
            }
        };
        if data.len() < channels * anchors {
            return Err(CapabilityError::OutputShape {
                model: "yolov8",
                shape: shape.to_vec(),
            });
        }

        // Channel-major: value (c, i) lives at c * anchors + i.
        let at = |c: usize, i: usize| data[c * anchors + i];
        let mut boxes = vec![];
        for i in 0..anchors {
            let scores = (4..channels).map(|c| at(c, i));
            if let Some((class_id, score)) = best_class(scores) {
                if score >= threshold {
                    boxes.push(RawBox {
                        rect: to_rect(at(0, i), at(1, i), at(2, i), at(3, i), scale),
                        score,
                        class_id,
                    });
                }
            }
        }
        Ok(boxes)
    }
}

pub struct YoloDetector {
    name: &'static str,
    classifier: Net,
    settings: YoloSettings,
    post_processor: &'static dyn YoloProcessor,
}

impl YoloDetector {
    pub fn load(name: &'static str, settings: YoloSettings) -> Result<Self, CapabilityError> {
        let mut classifier = dnn::read_net_from_onnx(&settings.model_path).map_err(|source| {
            CapabilityError::Inference {
                model: name,
                source,
            }
        })?;

        if settings.use_gpu {
            classifier.set_preferable_backend(DNN_BACKEND_CUDA)?;
            classifier.set_preferable_target(DNN_TARGET_CUDA)?;
        } else {
            classifier.set_preferable_backend(DNN_BACKEND_OPENCV)?;
            classifier.set_preferable_target(DNN_TARGET_CPU)?;
        }

        let post_processor: &'static dyn YoloProcessor = match settings.layout {
            YoloLayout::V5 => &YoloProcessorV5 {},
            YoloLayout::V8 => &YoloProcessorV8 {},
        };

        Ok(YoloDetector {
            name,
            classifier,
            settings,
            post_processor,
        })
    }

    pub fn vehicle_detector(settings: YoloSettings) -> Result<Self, CapabilityError> {
        Self::load("vehicle detector", settings)
    }

    pub fn plate_detector(settings: YoloSettings) -> Result<Self, CapabilityError> {
        Self::load("plate detector", settings)
    }

    fn forward(&mut self, image: &Mat) -> opencv::Result<Vector<Mat>> {
        let input_size = self.settings.input_size;
        let mut blob = blob_from_image(
            image,
            1.0 / 255.0,
            Size::new(input_size, input_size),
            Scalar::default(),
            true,
            false,
            CV_32F,
        )?;

        self.classifier
            .set_input(&mut blob, "", 1.0, Scalar::default())?;
        let output_names = self.classifier.get_unconnected_out_layers_names()?;
        let mut output_values = Vector::<Mat>::default();
        self.classifier.forward(&mut output_values, &output_names)?;
        Ok(output_values)
    }
}

// Net holds a raw pointer; the detector is only ever driven from the capture worker.
unsafe impl Send for YoloDetector {}

impl ObjectDetector for YoloDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>, CapabilityError> {
        let name = self.name;
        let outputs = self
            .forward(frame)
            .map_err(|source| CapabilityError::Inference { model: name, source })?;

        let scale = Scale {
            x: frame.cols() as f32 / self.settings.input_size as f32,
            y: frame.rows() as f32 / self.settings.input_size as f32,
        };

        let mut candidates = vec![];
        for output in outputs.iter() {
            let size = output.mat_size();
            let shape: Vec<i32> = size.to_vec();
            let data = output.data_typed::<f32>()?;
            candidates.extend(self.post_processor.post_process(
                data,
                &shape,
                scale,
                self.settings.score_threshold,
            )?);
        }

        if let Some(classes) = &self.settings.classes {
            candidates.retain(|c| classes.contains(&c.class_id));
        }

        let detections = suppress(
            &candidates,
            self.settings.score_threshold,
            self.settings.nms_threshold,
        )?;
        debug!("{}: {} boxes", name, detections.len());
        Ok(detections)
    }
}

fn suppress(
    candidates: &[RawBox],
    score_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Detection>, CapabilityError> {
    let boxes: Vector<Rect> = candidates.iter().map(|c| c.rect).collect();
    let confidences: Vector<f32> = candidates.iter().map(|c| c.score).collect();

    let mut indices = Vector::<i32>::default();
    nms_boxes(
        &boxes,
        &confidences,
        score_threshold,
        nms_threshold,
        &mut indices,
        1.0,
        0,
    )?;

    Ok(indices
        .iter()
        .filter_map(|i| candidates.get(i as usize))
        .map(|c| Detection {
            bbox: BoundingBox::from_rect(c.rect, c.score),
            class_id: c.class_id,
        })
        .collect())
}
