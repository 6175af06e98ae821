//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::EngineError;

/// What `submit` does when the queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backpressure {
    /// Wait for space; keeps upstream frame order intact
    #[default]
    Block,
    /// Fail with `QueueFull`
    Reject,
}

/// Queue and batching settings for one engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Items waiting to start, not counting the batch being executed
    pub queue_capacity: usize,
    /// Upper bound on items coalesced into one backend call
    pub max_batch: usize,
    /// How long the worker waits for a batch to fill after its first item (ms)
    pub batch_window_ms: u64,
    pub backpressure: Backpressure,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            max_batch: 1,
            batch_window_ms: 0,
            backpressure: Backpressure::Block,
        }
    }
}

impl EngineConfig {
    /// Coalescing config: up to `max_batch` items within `window_ms`
    pub fn batched(max_batch: usize, window_ms: u64) -> Self {
        Self {
            max_batch,
            batch_window_ms: window_ms,
            ..Default::default()
        }
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.queue_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_batch == 0 {
            return Err(EngineError::InvalidConfig(
                "max_batch must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unbatched_and_blocking() {
        let config = EngineConfig::default();
        assert_eq!(config.max_batch, 1);
        assert_eq!(config.batch_window(), Duration::ZERO);
        assert_eq!(config.backpressure, Backpressure::Block);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(EngineConfig::default().with_queue_capacity(0).validate().is_err());
        assert!(EngineConfig::batched(0, 5).validate().is_err());
    }
}
