//! tract-onnx model building and execution
//!
//! Artifacts are a postcard envelope around the validated ONNX bytes plus the
//! input facts that were resolved at build time. Loading re-applies those
//! facts and optimises the graph into a runnable plan on the worker thread.

use std::io::Cursor;
use std::path::Path;

use artifact_compiler::{ModelBuilder, ModelDescriptor, PrecisionMode};
use inference_engine::{EngineError, InferenceError};
use serde::{Deserialize, Serialize};
use tract_onnx::prelude::*;
use tracing::{debug, info};

const FORMAT_VERSION: u32 = 1;

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactEnvelope {
    format_version: u32,
    device_arch: String,
    model_name: String,
    /// `(input index, full shape)` applied before optimisation
    input_shapes: Vec<(usize, Vec<usize>)>,
    /// Fixed batch rows, `None` when the batch dimension is left to the model
    static_batch: Option<usize>,
    onnx: Vec<u8>,
}

/// CPU architecture label used in artifact names
pub fn host_arch() -> String {
    format!("cpu-{}", std::env::consts::ARCH)
}

fn optimise(onnx: &[u8], input_shapes: &[(usize, Vec<usize>)]) -> TractResult<TypedModel> {
    let mut model = tract_onnx::onnx().model_for_read(&mut Cursor::new(onnx))?;
    for (input, shape) in input_shapes {
        model = model.with_input_fact(*input, f32::fact(shape.clone()).into())?;
    }
    model.into_optimized()
}

/// `ModelBuilder` that validates ONNX sources with tract
pub struct TractBuilder {
    device_arch: String,
}

impl TractBuilder {
    pub fn new(device_arch: impl Into<String>) -> Self {
        Self {
            device_arch: device_arch.into(),
        }
    }
}

impl Default for TractBuilder {
    fn default() -> Self {
        Self::new(host_arch())
    }
}

impl ModelBuilder for TractBuilder {
    fn device_arch(&self) -> &str {
        &self.device_arch
    }

    fn build(&self, descriptor: &ModelDescriptor, source: &[u8]) -> Result<Vec<u8>, String> {
        if descriptor.precision != PrecisionMode::Fp32 {
            return Err(format!(
                "precision {} is not supported by the tract backend, use fp32",
                descriptor.precision.as_str()
            ));
        }
        if descriptor.max_batch_size == 0 {
            return Err("max_batch_size must be at least 1".into());
        }

        let mut input_shapes = Vec::with_capacity(descriptor.input_shape_overrides.len());
        for shape_override in &descriptor.input_shape_overrides {
            let mut shape = shape_override.shape.clone();
            if shape.is_empty() {
                return Err(format!("input {} override has no dimensions", shape_override.input));
            }
            if !descriptor.dynamic_batch {
                shape[0] = descriptor.max_batch_size;
            }
            input_shapes.push((shape_override.input, shape));
        }

        let static_batch = if descriptor.dynamic_batch {
            None
        } else {
            if descriptor.max_batch_size > 1 && input_shapes.is_empty() {
                return Err(format!(
                    "static batch of {} needs an input shape override",
                    descriptor.max_batch_size
                ));
            }
            Some(descriptor.max_batch_size)
        };

        let model = optimise(source, &input_shapes).map_err(|e| format!("{:#}", e))?;
        debug!(
            "Model {} optimised: {} nodes, {} inputs",
            descriptor.name,
            model.nodes().len(),
            model.inputs.len()
        );

        let envelope = ArtifactEnvelope {
            format_version: FORMAT_VERSION,
            device_arch: self.device_arch.clone(),
            model_name: descriptor.name.clone(),
            input_shapes,
            static_batch,
            onnx: source.to_vec(),
        };
        postcard::to_allocvec(&envelope).map_err(|e| format!("envelope encoding: {}", e))
    }
}

fn decode_envelope(bytes: &[u8], device_arch: &str) -> Result<ArtifactEnvelope, String> {
    let envelope: ArtifactEnvelope =
        postcard::from_bytes(bytes).map_err(|e| format!("corrupt artifact: {}", e))?;
    if envelope.format_version != FORMAT_VERSION {
        return Err(format!(
            "artifact format {} is not supported (expected {})",
            envelope.format_version, FORMAT_VERSION
        ));
    }
    if envelope.device_arch != device_arch {
        return Err(format!(
            "artifact built for {}, device is {}",
            envelope.device_arch, device_arch
        ));
    }
    Ok(envelope)
}

/// Per-item output with the batch dimension stripped
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutput {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// A runnable plan loaded from an artifact
pub struct TractModel {
    name: String,
    plan: Plan,
    input_shapes: Vec<(usize, Vec<usize>)>,
    static_batch: Option<usize>,
}

impl TractModel {
    /// Load an artifact built for `device_arch`
    pub fn load(path: &Path, device_arch: &str) -> Result<Self, EngineError> {
        let bytes = std::fs::read(path).map_err(|e| {
            EngineError::InitFailed(format!("reading {}: {}", path.display(), e))
        })?;
        let envelope = decode_envelope(&bytes, device_arch)
            .map_err(|e| EngineError::InitFailed(format!("{}: {}", path.display(), e)))?;

        let plan = optimise(&envelope.onnx, &envelope.input_shapes)
            .and_then(|model| model.into_runnable())
            .map_err(|e| EngineError::InitFailed(format!("{}: {:#}", envelope.model_name, e)))?;

        info!(
            "Loaded model {} (batch {:?}, inputs {:?})",
            envelope.model_name, envelope.static_batch, envelope.input_shapes
        );

        Ok(Self {
            name: envelope.model_name,
            plan,
            input_shapes: envelope.input_shapes,
            static_batch: envelope.static_batch,
        })
    }

    /// Resolved shape of `input` without its batch dimension
    pub fn item_shape(&self, input: usize) -> Option<&[usize]> {
        self.input_shapes
            .iter()
            .find(|(index, _)| *index == input)
            .and_then(|(_, shape)| shape.get(1..))
    }

    /// Resolved `(height, width)` of the first input when it is NCHW
    pub fn input_hw(&self) -> Option<(u32, u32)> {
        self.input_shapes
            .iter()
            .find(|(input, _)| *input == 0)
            .filter(|(_, shape)| shape.len() == 4)
            .map(|(_, shape)| (shape[2] as u32, shape[3] as u32))
    }

    /// Run prepared items, `item_shape` excluding the batch dimension.
    ///
    /// Items are stacked into as few plan runs as the batch size allows; a
    /// static batch is zero-padded. When a stacked run fails each of its
    /// items is retried alone so one bad item cannot fail its neighbours.
    pub fn run_batched(
        &self,
        items: Vec<Result<Vec<f32>, InferenceError>>,
        item_shape: &[usize],
    ) -> Vec<Result<ItemOutput, InferenceError>> {
        let mut results: Vec<Option<Result<ItemOutput, InferenceError>>> =
            (0..items.len()).map(|_| None).collect();
        let mut ready = Vec::with_capacity(items.len());
        for (slot, item) in items.into_iter().enumerate() {
            match item {
                Ok(data) => ready.push((slot, data)),
                Err(e) => results[slot] = Some(Err(e)),
            }
        }

        let rows = self.static_batch.unwrap_or(ready.len()).max(1);
        for group in ready.chunks(rows) {
            let inputs: Vec<&[f32]> = group.iter().map(|(_, data)| data.as_slice()).collect();
            match self.run_group(&inputs, item_shape) {
                Ok(outputs) => {
                    for ((slot, _), output) in group.iter().zip(outputs) {
                        results[*slot] = Some(Ok(output));
                    }
                }
                Err(e) if group.len() == 1 => results[group[0].0] = Some(Err(e)),
                Err(e) => {
                    debug!(
                        "Model {} batch of {} failed, isolating: {}",
                        self.name,
                        group.len(),
                        e
                    );
                    for (slot, data) in group {
                        let single = self
                            .run_group(&[data.as_slice()], item_shape)
                            .and_then(|mut outputs| {
                                outputs.pop().ok_or_else(|| {
                                    InferenceError::InferenceFailed("empty model output".into())
                                })
                            });
                        results[*slot] = Some(single);
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    Err(InferenceError::InferenceFailed("item not executed".into()))
                })
            })
            .collect()
    }

    fn run_group(
        &self,
        inputs: &[&[f32]],
        item_shape: &[usize],
    ) -> Result<Vec<ItemOutput>, InferenceError> {
        let per_item: usize = item_shape.iter().product();
        let rows = self.static_batch.unwrap_or(inputs.len()).max(inputs.len());

        let mut data = Vec::with_capacity(rows * per_item);
        for input in inputs {
            if input.len() != per_item {
                return Err(InferenceError::InvalidInputShape {
                    expected: format!("{:?} ({} values)", item_shape, per_item),
                    actual: format!("{} values", input.len()),
                });
            }
            data.extend_from_slice(input);
        }
        data.resize(rows * per_item, 0.0);

        let mut shape = Vec::with_capacity(item_shape.len() + 1);
        shape.push(rows);
        shape.extend_from_slice(item_shape);

        let tensor = Tensor::from_shape(&shape, &data)
            .map_err(|e| InferenceError::InvalidInput(format!("{:#}", e)))?;
        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| InferenceError::InferenceFailed(format!("{}: {:#}", self.name, e)))?;

        let output = outputs
            .first()
            .ok_or_else(|| InferenceError::InferenceFailed("model produced no outputs".into()))?;
        let out_shape = output.shape().to_vec();
        if out_shape.first() != Some(&rows) {
            return Err(InferenceError::InvalidInputShape {
                expected: format!("output batch of {}", rows),
                actual: format!("{:?}", out_shape),
            });
        }
        let values = output
            .as_slice::<f32>()
            .map_err(|e| InferenceError::InferenceFailed(format!("{:#}", e)))?;

        let stride = values.len() / rows;
        Ok((0..inputs.len())
            .map(|i| ItemOutput {
                shape: out_shape[1..].to_vec(),
                data: values[i * stride..(i + 1) * stride].to_vec(),
            })
            .collect())
    }
}
