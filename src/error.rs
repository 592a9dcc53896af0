//! Error type for checked operations and configuration.

use crate::child::MAX_VALUE_ID;
use crate::key::MAX_KEY_LEN;

/// Errors reported by the checked (`try_*`) operations and [`Config`](crate::Config) validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotError {
    /// The value's key is longer than [`MAX_KEY_LEN`].
    KeyTooLong { len: usize, max: usize },
    /// The value's identifier does not fit into a leaf pointer.
    ValueIdOutOfRange { id: u64 },
    /// A configuration field was rejected.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for HotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HotError::KeyTooLong { len, max } => {
                write!(f, "key of {} bytes exceeds the maximum of {} bytes", len, max)
            }
            HotError::ValueIdOutOfRange { id } => {
                write!(f, "value id {} exceeds the maximum of {}", id, MAX_VALUE_ID)
            }
            HotError::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for HotError {}

/// Result type for checked trie operations.
pub type Result<T> = std::result::Result<T, HotError>;

/// Rejects values whose key or id cannot be stored.
pub(crate) fn check_entry(key: &[u8], id: u64) -> Result<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(HotError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    if id > MAX_VALUE_ID {
        return Err(HotError::ValueIdOutOfRange { id });
    }
    Ok(())
}
