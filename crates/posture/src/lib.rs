//! Fall detection pipeline
//!
//! Per-frame posture analysis built from three device-pinned engines:
//! - Person detection on the whole frame
//! - Keypoint estimation on each detected person
//! - Posture classification from the keypoints
//!
//! Results are aggregated per person and emitted to frame sinks in frame order.

pub mod classifier;
pub mod config;
pub mod detector;
pub mod pipeline;
pub mod pose;
pub mod sink;
pub mod tract;
pub mod types;

pub use classifier::{create_posture_classifier, PostureBackend, PostureClassifier};
pub use config::{DetectorConfig, PipelineConfig, PoseConfig, PostureConfig};
pub use detector::{create_detector, Detector, DetectorBackend};
pub use pipeline::{PipelineOrchestrator, RunSummary};
pub use pose::{create_pose_estimator, PoseBackend, PoseEstimator};
pub use sink::{AnnotatedImageSink, FanoutSink, FrameSink, JsonLinesSink};
pub use tract::{host_arch, TractBuilder, TractModel};
pub use types::{
    BoundingBox, Detection, FrameResult, Keypoint, PerPersonResult, PersonOutcome, PoseRequest,
    PoseResult, PostureRequest, PostureResult, Stage,
};

use frame_io::FrameError;
use inference_engine::EngineError;
use thiserror::Error;

/// Frame-level pipeline errors. Per-person failures never surface here.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Detection failed for frame {index}: {source}")]
    Detection { index: u64, source: EngineError },

    #[error("Frame source failed: {0}")]
    Source(#[from] FrameError),

    #[error("Frame sink failed: {0}")]
    Sink(#[from] SinkError),
}

/// Frame sink error types
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Frame {index} emitted after frame {last}")]
    OutOfOrder { index: u64, last: u64 },

    #[error("Image encoding failed: {0}")]
    Image(String),

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
