//! Model Artifact Compiler
//!
//! Turns a portable model description into a device-optimized artifact
//! exactly once and caches it on durable storage. Later runs find the
//! artifact by name and skip the build.

mod compiler;
mod descriptor;
mod store;

pub use compiler::{ArtifactCompiler, ModelBuilder};
pub use descriptor::{CompiledArtifact, ModelDescriptor, PrecisionMode, ShapeOverride};
pub use store::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};

use std::path::PathBuf;
use thiserror::Error;

/// Errors during artifact compilation
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Source model for '{name}' not found at {}", .path.display())]
    MissingSourceModel { name: String, path: PathBuf },
    #[error("Invalid descriptor '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },
    #[error("Backend build failed for '{name}': {diagnostics}")]
    BackendBuild { name: String, diagnostics: String },
    #[error("Artifact storage error: {0}")]
    Storage(#[from] std::io::Error),
}
