//! Frame I/O for the fall detection pipeline
//!
//! Provides the decoded frame type shared by every stage plus frame sources:
//! - Image sequences on disk (one decoded still per frame)
//! - In-memory frame lists for tests and tools

pub mod frame;
pub mod sequence;

pub use frame::{PixelRect, VideoFrame};
pub use sequence::{ImageSequenceSource, VecSource};

use thiserror::Error;

/// Frame source error types
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Failed to open source: {0}")]
    Open(String),

    #[error("Failed to decode frame {index}: {reason}")]
    Decode { index: u64, reason: String },

    #[error("Invalid frame geometry: {0}")]
    Geometry(String),
}

/// Stream-level metadata reported by a source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceInfo {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Nominal frame rate, informational only
    pub fps: f64,
}

/// Supplies decoded frames in increasing index order
pub trait FrameSource: Send {
    /// Stream metadata
    fn info(&self) -> SourceInfo;

    /// Next frame, or `None` once the stream is exhausted
    fn next_frame(&mut self) -> Result<Option<VideoFrame>, FrameError>;
}
