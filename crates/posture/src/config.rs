//! Stage configuration

use serde::{Deserialize, Serialize};

/// Default class list of the bundled detector (COCO ordering)
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Network input width in pixels
    pub input_width: u32,
    /// Network input height in pixels
    pub input_height: u32,
    /// Minimum objectness x class score
    pub confidence_threshold: f32,
    /// IoU above which same-class boxes are suppressed
    pub nms_threshold: f32,
    /// Class names by class id
    pub class_labels: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: 640,
            input_height: 640,
            confidence_threshold: 0.4,
            nms_threshold: 0.5,
            class_labels: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DetectorConfig {
    pub fn label_for(&self, class_id: usize) -> String {
        self.class_labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class{}", class_id))
    }
}

/// Pose estimator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseConfig {
    pub input_width: u32,
    pub input_height: u32,
    /// Per-channel mean subtracted after scaling to [0, 1]
    pub mean: [f32; 3],
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            input_width: 192,
            input_height: 256,
            mean: [0.406, 0.457, 0.480],
        }
    }
}

/// Posture classifier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostureConfig {
    /// State names by output index
    pub state_labels: Vec<String>,
    /// Treat outputs as logits
    pub apply_softmax: bool,
}

impl Default for PostureConfig {
    fn default() -> Self {
        Self {
            state_labels: vec!["fall".into(), "stand".into(), "uncertain".into()],
            apply_softmax: true,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Only detections with this label reach pose estimation
    pub target_label: String,
    /// Frames processed concurrently by `run`
    pub max_in_flight: usize,
    /// Posture label highlighted by the annotated sink
    pub alert_label: String,
    /// Keypoints below this score are not drawn
    pub keypoint_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_label: "person".into(),
            max_in_flight: 1,
            alert_label: "fall".into(),
            keypoint_threshold: 0.3,
        }
    }
}

impl PipelineConfig {
    /// Overlap several frames across the stage workers
    pub fn pipelined(max_in_flight: usize) -> Self {
        Self {
            max_in_flight,
            ..Default::default()
        }
    }
}
