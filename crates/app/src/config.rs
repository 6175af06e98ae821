//! Layered application configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use artifact_compiler::ModelDescriptor;
use config::{Config, Environment, File, FileFormat};
use inference_engine::{DeviceId, EngineConfig};
use posture::{DetectorConfig, PipelineConfig, PoseConfig, PostureConfig};
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "FALLWATCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/fallwatch.toml";

/// One pipeline stage: what to compile, where to run it and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSettings<P> {
    pub model: ModelDescriptor,
    pub device: DeviceId,
    pub engine: EngineConfig,
    pub params: P,
}

impl<P: Default> StageSettings<P> {
    fn with_model(name: &str) -> Self {
        Self {
            model: ModelDescriptor::new(name, format!("models/{}.onnx", name)),
            device: DeviceId(0),
            engine: EngineConfig::default(),
            params: P::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Directory of still frames, read in file name order
    pub frames_dir: PathBuf,
    pub fps: f64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            frames_dir: PathBuf::from("frames"),
            fps: 25.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Annotated PNGs are written here when set
    pub annotated_dir: Option<PathBuf>,
    /// JSON lines results file
    pub results_path: Option<PathBuf>,
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where compiled artifacts are cached
    pub cache_dir: PathBuf,
    /// Artifact architecture label; the host CPU when unset
    pub device_arch: Option<String>,
    pub detector: StageSettings<DetectorConfig>,
    pub pose: StageSettings<PoseConfig>,
    pub posture: StageSettings<PostureConfig>,
    pub pipeline: PipelineConfig,
    pub input: InputConfig,
    pub output: OutputConfig,
    /// Prometheus scrape endpoint
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            device_arch: None,
            detector: StageSettings::with_model("detector"),
            pose: StageSettings::with_model("pose"),
            posture: StageSettings::with_model("posture"),
            pipeline: PipelineConfig::default(),
            input: InputConfig::default(),
            output: OutputConfig::default(),
            metrics_addr: None,
        }
    }
}

impl AppConfig {
    /// Defaults, then the TOML file if it exists, then `FALLWATCH__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::new(&path.to_string_lossy(), FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix("FALLWATCH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Models compiled at startup, in stage order
    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        vec![
            self.detector.model.clone(),
            self.pose.model.clone(),
            self.posture.model.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artifact_compiler::PrecisionMode;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.detector, AppConfig::default().detector);
        assert_eq!(config.pipeline.target_label, "person");
        assert_eq!(config.descriptors().len(), 3);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallwatch.toml");
        std::fs::write(
            &path,
            r#"
cache_dir = "/var/cache/fallwatch"

[detector.model]
name = "yolox_s"
source_path = "models/yolox_s.onnx"
max_batch_size = 4
input_shape_overrides = [{ input = 0, shape = [1, 3, 416, 416] }]

[detector.engine]
max_batch = 4
batch_window_ms = 5
backpressure = "reject"

[posture.params]
state_labels = ["fall", "stand", "sit", "uncertain"]

[output]
results_path = "out/results.jsonl"
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/fallwatch"));
        assert_eq!(config.detector.model.name, "yolox_s");
        assert_eq!(config.detector.model.max_batch_size, 4);
        assert_eq!(config.detector.model.precision, PrecisionMode::Fp32);
        assert_eq!(config.detector.model.input_shape_overrides[0].shape, vec![1, 3, 416, 416]);
        assert_eq!(config.detector.engine.max_batch, 4);
        assert_eq!(config.detector.engine.queue_capacity, 16);
        assert_eq!(config.posture.params.state_labels.len(), 4);
        assert_eq!(config.pose.model.name, "pose");
        assert_eq!(config.output.results_path, Some(PathBuf::from("out/results.jsonl")));
        assert!(config.output.annotated_dir.is_none());
    }
}
