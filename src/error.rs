//! Error types for the tree map.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tree map operations.
///
/// None of these leave the map in a partially updated state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Insert errors
    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("Payload size mismatch: expected {expected} bytes, got {actual}")]
    PayloadSizeMismatch { expected: usize, actual: usize },

    #[error("Node pool exhausted")]
    PoolExhausted,

    // Block errors
    #[error("Block too small: {len} bytes (need at least {required})")]
    BlockTooSmall { len: usize, required: usize },

    #[error("Layout overflow: {slots} slots of {payload_size} payload bytes do not fit in memory")]
    LayoutOverflow { payload_size: usize, slots: usize },

    #[error("Block does not hold an initialized node pool")]
    NotInitialized,

    #[error("Stride mismatch: expected {expected} bytes, block uses {actual}")]
    StrideMismatch { expected: usize, actual: usize },

    #[error("Shrinking the node pool is not supported: {current} bytes -> {requested} bytes")]
    UnsupportedShrink { current: usize, requested: usize },

    #[error("Tree map corrupted: {0}")]
    Corrupted(String),
}
