//! Pose estimation stage

use std::path::Path;

use frame_io::PixelRect;
use image::imageops::{self, FilterType};
use inference_engine::{
    DeviceId, EngineConfig, EngineError, InferenceBackend, InferenceEngine, InferenceError,
};
use ndarray::Array3;

use crate::config::PoseConfig;
use crate::tract::TractModel;
use crate::types::{Keypoint, PoseRequest, PoseResult};

/// Pose engine: person crop in, keypoints in frame coordinates out
pub type PoseEstimator = InferenceEngine<PoseRequest, PoseResult>;

/// Heatmap pose network running on tract
pub struct PoseBackend {
    model: TractModel,
    config: PoseConfig,
    input_width: u32,
    input_height: u32,
}

impl PoseBackend {
    pub fn open(path: &Path, device_arch: &str, config: PoseConfig) -> Result<Self, EngineError> {
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

    fn prepare(&self, request: &PoseRequest) -> Result<Vec<f32>, InferenceError> {
        let image = request
            .region
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
                tensor[[c, y as usize, x as usize]] = pixel[c] as f32 / 255.0 - self.config.mean[c];
            }
        }
        Ok(tensor.iter().copied().collect())
    }
}

impl InferenceBackend for PoseBackend {
    type Input = PoseRequest;
    type Output = PoseResult;

    fn infer(&mut self, batch: Vec<PoseRequest>) -> Vec<Result<PoseResult, InferenceError>> {
        let tensors = batch.iter().map(|request| self.prepare(request)).collect();
        let item_shape = [3, self.input_height as usize, self.input_width as usize];
        let outputs = self.model.run_batched(tensors, &item_shape);

        batch
            .iter()
            .zip(outputs)
            .map(|(request, output)| {
                let output = output?;
                decode_heatmaps(&output.data, &output.shape, request.rect)
            })
            .collect()
    }
}

/// Per-joint argmax of `[K, H, W]` heatmaps, mapped into `rect`
pub fn decode_heatmaps(
    data: &[f32],
    shape: &[usize],
    rect: PixelRect,
) -> Result<PoseResult, InferenceError> {
    if shape.len() != 3
        || shape.iter().any(|&d| d == 0)
        || data.len() != shape.iter().product::<usize>()
    {
        return Err(InferenceError::InvalidInputShape {
            expected: "[K, H, W] heatmaps".into(),
            actual: format!("{:?}", shape),
        });
    }

    let (joints, height, width) = (shape[0], shape[1], shape[2]);
    let plane = height * width;
    let keypoints = data
        .chunks_exact(plane)
        .take(joints)
        .map(|heatmap| {
            let (peak, score) = heatmap
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                });
            let (hx, hy) = ((peak % width) as f32, (peak / width) as f32);

            Keypoint::new(
                rect.x as f32 + (hx + 0.5) / width as f32 * rect.width as f32,
                rect.y as f32 + (hy + 0.5) / height as f32 * rect.height as f32,
                if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 },
            )
        })
        .collect();

    Ok(PoseResult::new(keypoints))
}

/// Start a pose estimator worker on `device`
pub async fn create_pose_estimator(
    artifact: &Path,
    device: DeviceId,
    engine: EngineConfig,
    device_arch: String,
    config: PoseConfig,
) -> Result<PoseEstimator, EngineError> {
    PoseEstimator::create("pose", artifact, device, engine, move |path, _device| {
        PoseBackend::open(path, &device_arch, config)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heatmap_peaks_map_into_rect() {
        // Two joints on a 2x4 heatmap
        let mut data = vec![0.0f32; 16];
        data[6] = 0.8; // joint 0 at (x=2, y=1)
        data[8] = 1.7; // joint 1 at (x=0, y=0)
        let rect = PixelRect { x: 100, y: 50, width: 40, height: 20 };

        let pose = decode_heatmaps(&data, &[2, 2, 4], rect).unwrap();
        assert_eq!(pose.len(), 2);
        assert_eq!(pose.keypoints[0], Keypoint::new(125.0, 65.0, 0.8));
        assert_eq!(pose.keypoints[1], Keypoint::new(105.0, 55.0, 1.0));
    }

    #[test]
    fn test_heatmap_shape_mismatch() {
        let rect = PixelRect { x: 0, y: 0, width: 1, height: 1 };
        assert!(decode_heatmaps(&[0.0; 7], &[2, 2, 2], rect).is_err());
        assert!(decode_heatmaps(&[0.0; 4], &[4, 1], rect).is_err());
    }
}
