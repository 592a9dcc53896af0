//! Tuning knobs for the concurrent trie.

use crate::error::{HotError, Result};

/// Runtime configuration of a [`HotRowex`](crate::HotRowex).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Values fetched per iterator refill.
    pub iterator_buffer_size: usize,
    /// Retired nodes a thread collects before it tries to advance the global epoch.
    pub epoch_advance_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iterator_buffer_size: 128,
            epoch_advance_threshold: 64,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.iterator_buffer_size == 0 {
            return Err(HotError::InvalidConfig("iterator_buffer_size must be positive"));
        }
        if self.epoch_advance_threshold == 0 {
            return Err(HotError::InvalidConfig("epoch_advance_threshold must be positive"));
        }
        Ok(())
    }
}
