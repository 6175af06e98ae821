//! Inference Engine
//!
//! Wraps a device-bound model backend in a dedicated worker and exposes it
//! through a non-blocking `submit` that returns an awaitable handle per item.
//! Each engine owns exactly one worker thread, and the backend is opened on
//! that thread so its device context never moves.

mod batcher;
mod config;
mod engine;

pub use config::{Backpressure, EngineConfig};
pub use engine::{InferenceEngine, Pending};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Errors reported by a backend for a single item
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("Inference failed: {0}")]
    InferenceFailed(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid input shape: expected {expected}, got {actual}")]
    InvalidInputShape { expected: String, actual: String },
}

/// Errors surfaced by an engine handle
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Engine initialisation failed: {0}")]
    InitFailed(String),
    #[error("Engine queue is full")]
    QueueFull,
    #[error("Engine is closed")]
    Closed,
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Accelerator a worker is pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A model bound to one device context.
///
/// Backends are created and driven on the engine's worker thread only, so
/// they need not be `Send`. `infer` must return exactly one result per input,
/// in input order.
pub trait InferenceBackend {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn infer(&mut self, batch: Vec<Self::Input>)
        -> Vec<Result<Self::Output, InferenceError>>;
}

/// Backend that handles items one at a time through a closure
pub struct PerItemBackend<I, O, F> {
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F> PerItemBackend<I, O, F>
where
    F: FnMut(I) -> Result<O, InferenceError>,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<I, O, F> InferenceBackend for PerItemBackend<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Result<O, InferenceError>,
{
    type Input = I;
    type Output = O;

    fn infer(&mut self, batch: Vec<I>) -> Vec<Result<O, InferenceError>> {
        batch.into_iter().map(&mut self.f).collect()
    }
}
