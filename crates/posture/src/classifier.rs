//! Posture classification stage

use std::path::Path;

use inference_engine::{
    DeviceId, EngineConfig, EngineError, InferenceBackend, InferenceEngine, InferenceError,
};

use crate::config::PostureConfig;
use crate::tract::TractModel;
use crate::types::{BoundingBox, PoseResult, PostureRequest, PostureResult};

/// Posture engine: keypoints and box in, state label out
pub type PostureClassifier = InferenceEngine<PostureRequest, PostureResult>;

/// Skeleton classifier running on tract
pub struct PostureBackend {
    model: TractModel,
    config: PostureConfig,
}

impl PostureBackend {
    pub fn open(
        path: &Path,
        device_arch: &str,
        config: PostureConfig,
    ) -> Result<Self, EngineError> {
        if config.state_labels.is_empty() {
            return Err(EngineError::InvalidConfig("posture state_labels is empty".into()));
        }
        Ok(Self {
            model: TractModel::load(path, device_arch)?,
            config,
        })
    }
}

impl InferenceBackend for PostureBackend {
    type Input = PostureRequest;
    type Output = PostureResult;

    fn infer(&mut self, batch: Vec<PostureRequest>) -> Vec<Result<PostureResult, InferenceError>> {
        // `[K, 3]` per item when the artifact pins the skeleton size
        let model_joints = self
            .model
            .item_shape(0)
            .filter(|shape| shape.len() == 2 && shape[1] == 3)
            .map(|shape| shape[0]);
        let (joints, tensors) = prepare_batch(&batch, model_joints);

        self.model
            .run_batched(tensors, &[joints, 3])
            .into_iter()
            .map(|output| decode_posture(&output?.data, &self.config))
            .collect()
    }
}

/// Normalised tensors for a batch and the skeleton size `K` they share.
///
/// `model_joints` wins when known. Otherwise the most common keypoint count
/// in the batch is used, ties going to the earliest request. Requests of any
/// other size fail on their own.
pub fn prepare_batch(
    batch: &[PostureRequest],
    model_joints: Option<usize>,
) -> (usize, Vec<Result<Vec<f32>, InferenceError>>) {
    let joints = model_joints.unwrap_or_else(|| most_common_len(batch));
    let tensors = batch
        .iter()
        .map(|request| {
            if request.pose.len() != joints {
                return Err(InferenceError::InvalidInputShape {
                    expected: format!("{} keypoints", joints),
                    actual: format!("{} keypoints", request.pose.len()),
                });
            }
            normalize_keypoints(&request.pose, &request.bbox)
        })
        .collect();
    (joints, tensors)
}

fn most_common_len(batch: &[PostureRequest]) -> usize {
    // (keypoint count, occurrences) in first-seen order
    let mut counts: Vec<(usize, usize)> = Vec::new();
    for request in batch {
        let len = request.pose.len();
        match counts.iter_mut().find(|(seen, _)| *seen == len) {
            Some((_, n)) => *n += 1,
            None => counts.push((len, 1)),
        }
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(usize, usize)>, (len, n)| match best {
            Some((_, best_n)) if best_n >= n => best,
            _ => Some((len, n)),
        })
        .map(|(len, _)| len)
        .unwrap_or(0)
}

/// Keypoints relative to the box as `[K, 3]` rows of `(x, y, score)`
pub fn normalize_keypoints(
    pose: &PoseResult,
    bbox: &BoundingBox,
) -> Result<Vec<f32>, InferenceError> {
    if pose.is_empty() {
        return Err(InferenceError::InvalidInput("pose has no keypoints".into()));
    }
    let (w, h) = (bbox.width(), bbox.height());
    if !(w > 0.0 && h > 0.0) {
        return Err(InferenceError::InvalidInput(format!(
            "box {:.1}x{:.1} cannot normalise keypoints",
            w, h
        )));
    }

    Ok(pose
        .keypoints
        .iter()
        .flat_map(|k| [(k.x - bbox.left) / w, (k.y - bbox.top) / h, k.score])
        .collect())
}

/// Pick the most likely state from the classifier output
pub fn decode_posture(
    values: &[f32],
    config: &PostureConfig,
) -> Result<PostureResult, InferenceError> {
    if values.is_empty() || values.len() > config.state_labels.len() {
        return Err(InferenceError::InvalidInputShape {
            expected: format!("1..={} state scores", config.state_labels.len()),
            actual: format!("{} scores", values.len()),
        });
    }

    let probabilities = if config.apply_softmax {
        softmax(values)
    } else {
        values.to_vec()
    };

    let (index, confidence) = probabilities
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, p)| {
            if p > best.1 {
                (i, p)
            } else {
                best
            }
        });

    if !confidence.is_finite() {
        return Err(InferenceError::InferenceFailed(
            "classifier produced non-finite scores".into(),
        ));
    }

    Ok(PostureResult {
        label: config.state_labels[index].clone(),
        confidence: confidence.clamp(0.0, 1.0),
    })
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Start a posture classifier worker on `device`
pub async fn create_posture_classifier(
    artifact: &Path,
    device: DeviceId,
    engine: EngineConfig,
    device_arch: String,
    config: PostureConfig,
) -> Result<PostureClassifier, EngineError> {
    PostureClassifier::create("posture", artifact, device, engine, move |path, _device| {
        PostureBackend::open(path, &device_arch, config)
    })
    .await
}
