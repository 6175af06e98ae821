//! Compilation targets and their cached artifacts

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Numeric precision the backend compiles for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionMode {
    #[default]
    Fp32,
    Fp16,
    Int8,
}

impl PrecisionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrecisionMode::Fp32 => "fp32",
            PrecisionMode::Fp16 => "fp16",
            PrecisionMode::Int8 => "int8",
        }
    }
}

/// Replacement shape for one model input
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeOverride {
    /// Input position in the model signature
    pub input: usize,
    /// Full shape, batch dimension first
    pub shape: Vec<usize>,
}

/// Identifies a compilation target. Equal descriptors are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Short model name, used as the artifact file stem
    pub name: String,
    /// Portable source model (ONNX)
    pub source_path: PathBuf,
    #[serde(default)]
    pub precision: PrecisionMode,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Kept sorted by input index, at most one entry per input
    #[serde(default, deserialize_with = "deserialize_overrides")]
    pub input_shape_overrides: Vec<ShapeOverride>,
    /// Keep the batch dimension symbolic instead of fixing it to `max_batch_size`
    #[serde(default)]
    pub dynamic_batch: bool,
}

fn default_max_batch_size() -> usize {
    1
}

fn deserialize_overrides<'de, D>(deserializer: D) -> Result<Vec<ShapeOverride>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut overrides = Vec::<ShapeOverride>::deserialize(deserializer)?;
    overrides.sort_by_key(|o| o.input);
    if let Some(pair) = overrides.windows(2).find(|w| w[0].input == w[1].input) {
        return Err(D::Error::custom(format!(
            "duplicate shape override for input {}",
            pair[0].input
        )));
    }
    Ok(overrides)
}

impl ModelDescriptor {
    /// FP32, batch 1, static batch, no overrides
    pub fn new(name: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source_path: source_path.into(),
            precision: PrecisionMode::Fp32,
            max_batch_size: default_max_batch_size(),
            input_shape_overrides: Vec::new(),
            dynamic_batch: false,
        }
    }

    pub fn with_precision(mut self, precision: PrecisionMode) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Set the shape of one input, replacing any earlier override for it
    pub fn with_input_shape(mut self, input: usize, shape: Vec<usize>) -> Self {
        match self
            .input_shape_overrides
            .iter_mut()
            .find(|o| o.input == input)
        {
            Some(existing) => existing.shape = shape,
            None => {
                self.input_shape_overrides.push(ShapeOverride { input, shape });
                self.input_shape_overrides.sort_by_key(|o| o.input);
            }
        }
        self
    }

    /// Check the name is a plain file stem and overrides are unique per input
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() || self.name == "." || self.name == ".." {
            return Err(format!("model name {:?} is not a usable file stem", self.name));
        }
        if self
            .name
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c == ':')
        {
            return Err(format!("model name {:?} contains a path separator", self.name));
        }

        let mut inputs: Vec<usize> = self.input_shape_overrides.iter().map(|o| o.input).collect();
        inputs.sort_unstable();
        if let Some(pair) = inputs.windows(2).find(|w| w[0] == w[1]) {
            return Err(format!("duplicate shape override for input {}", pair[0]));
        }
        Ok(())
    }

    /// SHA-256 of the canonical JSON of every field plus the target architecture.
    ///
    /// Overrides are ordered by input index first, so listing order does not
    /// change the artifact.
    pub fn fingerprint(&self, device_arch: &str) -> String {
        let mut overrides: Vec<(usize, &[usize])> = self
            .input_shape_overrides
            .iter()
            .map(|o| (o.input, o.shape.as_slice()))
            .collect();
        overrides.sort_by_key(|(input, _)| *input);

        // Keys come out sorted, or in this fixed order under `preserve_order`
        let canonical = serde_json::json!({
            "name": self.name,
            "source_path": self.source_path.to_string_lossy(),
            "precision": self.precision.as_str(),
            "max_batch_size": self.max_batch_size,
            "input_shape_overrides": overrides,
            "dynamic_batch": self.dynamic_batch,
            "device_arch": device_arch,
        });

        hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
    }

    /// `<name>.<precision>.<hash12>.<arch>.model`
    pub fn artifact_file_name(&self, device_arch: &str) -> String {
        let fingerprint = self.fingerprint(device_arch);
        format!(
            "{}.{}.{}.{}.model",
            self.name,
            self.precision.as_str(),
            &fingerprint[..12],
            device_arch
        )
    }
}

/// A device-optimized artifact known to exist on storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub path: PathBuf,
    pub descriptor: ModelDescriptor,
}

impl CompiledArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }
}
