//! Detection, pose and posture result types

use frame_io::{PixelRect, VideoFrame};
use inference_engine::InferenceError;
use serde::{Deserialize, Serialize};

/// Axis-aligned box in frame pixels. Always `left <= right` and `top <= bottom`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    /// Validated constructor
    pub fn try_new(left: f32, top: f32, right: f32, bottom: f32) -> Result<Self, InferenceError> {
        if ![left, top, right, bottom].iter().all(|v| v.is_finite()) {
            return Err(InferenceError::InvalidInput(format!(
                "non-finite box ({}, {}, {}, {})",
                left, top, right, bottom
            )));
        }
        if left > right || top > bottom {
            return Err(InferenceError::InvalidInput(format!(
                "inverted box ({}, {}, {}, {})",
                left, top, right, bottom
            )));
        }
        Ok(Self { left, top, right, bottom })
    }

    /// Box from centre and size; negative sizes are folded
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        let (hw, hh) = (width.abs() / 2.0, height.abs() / 2.0);
        Self {
            left: cx - hw,
            top: cy - hh,
            right: cx + hw,
            bottom: cy + hh,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Intersection over union
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);
        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Restrict to `[0, width] x [0, height]`
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            left: self.left.clamp(0.0, w),
            top: self.top.clamp(0.0, h),
            right: self.right.clamp(0.0, w),
            bottom: self.bottom.clamp(0.0, h),
        }
    }

    /// Whole-pixel rectangle covering the box, clipped to the frame
    pub fn to_pixel_rect(
        &self,
        frame_width: u32,
        frame_height: u32,
    ) -> Result<PixelRect, InferenceError> {
        let valid = Self::try_new(self.left, self.top, self.right, self.bottom)?;
        let clamped = valid.clamp_to(frame_width, frame_height);

        let x0 = clamped.left.floor() as u32;
        let y0 = clamped.top.floor() as u32;
        let x1 = (clamped.right.ceil() as u32).min(frame_width);
        let y1 = (clamped.bottom.ceil() as u32).min(frame_height);

        if x1 <= x0 || y1 <= y0 {
            return Err(InferenceError::InvalidInput(format!(
                "box ({:.1}, {:.1}, {:.1}, {:.1}) has no area inside {}x{} frame",
                self.left, self.top, self.right, self.bottom, frame_width, frame_height
            )));
        }

        Ok(PixelRect {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }
}

/// One detector output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Body joint in frame pixels
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, score: f32) -> Self {
        Self { x, y, score }
    }
}

/// Ordered joints; length is the skeleton size of the pose model
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseResult {
    pub keypoints: Vec<Keypoint>,
}

impl PoseResult {
    pub fn new(keypoints: Vec<Keypoint>) -> Self {
        Self { keypoints }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Posture state with confidence in [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostureResult {
    pub label: String,
    pub confidence: f32,
}

/// Pose estimator payload: the cropped region plus where it came from
#[derive(Debug, Clone)]
pub struct PoseRequest {
    pub region: VideoFrame,
    /// Pixel rectangle of `region` inside the source frame
    pub rect: PixelRect,
    pub bbox: BoundingBox,
}

/// Posture classifier payload
#[derive(Debug, Clone)]
pub struct PostureRequest {
    pub pose: PoseResult,
    pub bbox: BoundingBox,
}

/// Per-person sub-step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Crop,
    Pose,
    Posture,
}

/// What happened to one retained detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PersonOutcome {
    Classified {
        pose: PoseResult,
        posture: PostureResult,
    },
    Failed {
        stage: Stage,
        reason: String,
        /// Keypoints already estimated when a later stage failed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pose: Option<PoseResult>,
    },
}

/// Aggregated result for one person in one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerPersonResult {
    pub bbox: BoundingBox,
    pub detection_confidence: f32,
    #[serde(flatten)]
    pub outcome: PersonOutcome,
}

impl PerPersonResult {
    pub fn posture(&self) -> Option<&PostureResult> {
        match &self.outcome {
            PersonOutcome::Classified { posture, .. } => Some(posture),
            PersonOutcome::Failed { .. } => None,
        }
    }

    pub fn pose(&self) -> Option<&PoseResult> {
        match &self.outcome {
            PersonOutcome::Classified { pose, .. } => Some(pose),
            PersonOutcome::Failed { pose, .. } => pose.as_ref(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, PersonOutcome::Failed { .. })
    }
}

/// Everything emitted for one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    pub index: u64,
    pub timestamp_ns: u64,
    pub people: Vec<PerPersonResult>,
}
