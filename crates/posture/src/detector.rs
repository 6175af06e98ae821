//! Object detection stage

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use frame_io::VideoFrame;
use image::imageops::{self, FilterType};
use inference_engine::{
    DeviceId, EngineConfig, EngineError, InferenceBackend, InferenceEngine, InferenceError,
};
use ndarray::Array3;
use tracing::debug;

use crate::config::DetectorConfig;
use crate::tract::TractModel;
use crate::types::{BoundingBox, Detection};

/// Detector engine: whole frame in, detections out
pub type Detector = InferenceEngine<Arc<VideoFrame>, Vec<Detection>>;

/// Prepared detector input and the factors mapping network pixels back to the frame
struct Prepared {
    tensor: Vec<f32>,
    scale_x: f32,
    scale_y: f32,
    frame_width: u32,
    frame_height: u32,
}

/// YOLOX-style detector running on tract
pub struct DetectorBackend {
    model: TractModel,
    config: DetectorConfig,
    input_width: u32,
    input_height: u32,
}

impl DetectorBackend {
    pub fn open(
        path: &Path,
        device_arch: &str,
        config: DetectorConfig,
    ) -> Result<Self, EngineError> {
        let model = TractModel::load(path, device_arch)?;
        let (input_height, input_width) = model
            .input_hw()
            .unwrap_or((config.input_height, config.input_width));
        Ok(Self {
            model,
            config,
            input_width,
            input_height,
        })
    }

    fn prepare(&self, frame: &VideoFrame) -> Result<Prepared, InferenceError> {
        let image = frame
            .to_rgb_image()
            .map_err(|e| InferenceError::InvalidInput(e.to_string()))?;
        let resized = imageops::resize(
            &image,
            self.input_width,
            self.input_height,
            FilterType::Triangle,
        );

        let (h, w) = (self.input_height as usize, self.input_width as usize);
        let mut tensor = Array3::<f32>::zeros((3, h, w));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }

        Ok(Prepared {
            tensor: tensor.iter().copied().collect(),
            scale_x: frame.width as f32 / self.input_width as f32,
            scale_y: frame.height as f32 / self.input_height as f32,
            frame_width: frame.width,
            frame_height: frame.height,
        })
    }
}

impl InferenceBackend for DetectorBackend {
    type Input = Arc<VideoFrame>;
    type Output = Vec<Detection>;

    fn infer(
        &mut self,
        batch: Vec<Arc<VideoFrame>>,
    ) -> Vec<Result<Vec<Detection>, InferenceError>> {
        let prepared: Vec<Result<Prepared, InferenceError>> =
            batch.iter().map(|frame| self.prepare(frame)).collect();
        let tensors = prepared
            .iter()
            .map(|p| p.as_ref().map(|p| p.tensor.clone()).map_err(Clone::clone))
            .collect();

        let item_shape = [3, self.input_height as usize, self.input_width as usize];
        let outputs = self.model.run_batched(tensors, &item_shape);

        prepared
            .into_iter()
            .zip(outputs)
            .map(|(prep, output)| {
                let prep = prep?;
                let output = output?;
                decode_detections(&output.data, &output.shape, &prep, &self.config)
            })
            .collect()
    }
}

fn decode_detections(
    data: &[f32],
    shape: &[usize],
    prep: &Prepared,
    config: &DetectorConfig,
) -> Result<Vec<Detection>, InferenceError> {
    let rows = decode_rows(data, shape, config)?;
    let detections = rows
        .into_iter()
        .map(|mut det| {
            det.bbox = BoundingBox {
                left: det.bbox.left * prep.scale_x,
                top: det.bbox.top * prep.scale_y,
                right: det.bbox.right * prep.scale_x,
                bottom: det.bbox.bottom * prep.scale_y,
            }
            .clamp_to(prep.frame_width, prep.frame_height);
            det
        })
        .collect::<Vec<_>>();
    Ok(non_max_suppression(detections, config.nms_threshold))
}

/// Threshold raw `[N, 5 + C]` rows into detections in network pixels
pub fn decode_rows(
    data: &[f32],
    shape: &[usize],
    config: &DetectorConfig,
) -> Result<Vec<Detection>, InferenceError> {
    if shape.len() != 2 || shape[1] < 6 || data.len() != shape[0] * shape[1] {
        return Err(InferenceError::InvalidInputShape {
            expected: "[N, 5 + classes]".into(),
            actual: format!("{:?}", shape),
        });
    }

    let width = shape[1];
    let mut detections = Vec::new();
    for row in data.chunks_exact(width) {
        let objectness = row[4];
        let (class_id, class_score) = row[5..]
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .unwrap_or((0, 0.0));

        let confidence = objectness * class_score;
        if !confidence.is_finite() || confidence < config.confidence_threshold {
            continue;
        }

        detections.push(Detection {
            class_id,
            label: config.label_for(class_id),
            bbox: BoundingBox::from_center(row[0], row[1], row[2], row[3]),
            confidence,
        });
    }

    debug!("Decoded {} candidate detections from {} rows", detections.len(), shape[0]);
    Ok(detections)
}

/// Per-class greedy NMS, result sorted by confidence descending
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Start a detector worker on `device`
pub async fn create_detector(
    artifact: &Path,
    device: DeviceId,
    engine: EngineConfig,
    device_arch: String,
    config: DetectorConfig,
) -> Result<Detector, EngineError> {
    Detector::create("detector", artifact, device, engine, move |path, _device| {
        DetectorBackend::open(path, &device_arch, config)
    })
    .await
}
