//! Checkpoint resharding error types

use thiserror::Error;

/// Resharding result type
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Resharding error types
#[derive(Debug, Error)]
pub enum CheckpointError {
    // Layout preconditions
    #[error("Misaligned offset for {key}: global offset {offset} along axis {axis} is not a multiple of local size {local_size}")]
    MisalignedOffset {
        key: String,
        axis: usize,
        offset: usize,
        local_size: usize,
    },

    #[error("Unsupported fusion for {key}: {reason}")]
    UnsupportedFusion { key: String, reason: String },

    #[error("Flattened fragments cannot be merged by the gated transform ({key})")]
    UnsupportedFlattenedMerge { key: String },

    // Internal consistency
    #[error("Element count mismatch for {key}: split produced {produced} elements from {expected}")]
    ElementCountMismatch {
        key: String,
        expected: usize,
        produced: usize,
    },

    // Descriptor errors
    #[error("Invalid rank offset for {key}: {reason}")]
    InvalidRankOffset { key: String, reason: String },

    #[error("Invalid flattened range {start}..{stop} for {key} ({numel} local elements)")]
    InvalidFlattenedRange {
        key: String,
        start: usize,
        stop: usize,
        numel: usize,
    },

    #[error("Shape mismatch for {key}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Data type mismatch: expected {expected:?}, got {got:?}")]
    DtypeMismatch {
        expected: crate::tensor::DType,
        got: crate::tensor::DType,
    },

    #[error("Data length mismatch: shape {shape:?} needs {expected} bytes, got {got}")]
    DataLength {
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },

    #[error("Empty merge for {0}: no fragments were loaded")]
    EmptyMerge(String),

    // State dict errors
    #[error("Missing key: {0}")]
    MissingKey(String),

    #[error("Entry {0} is not in the expected state for this pass")]
    UnexpectedEntry(String),

    #[error("Sharding of {key} does not tile the global shape: {reason}")]
    InvalidTiling { key: String, reason: String },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("TOML error: {0}")]
    Toml(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    /// Check if this error is retryable
    ///
    /// Every resharding failure points at an unsupported layout or a logic
    /// defect, so the enclosing save or load has to abort.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Whether this error came from a violated layout precondition rather
    /// than from I/O or configuration.
    pub fn is_layout_error(&self) -> bool {
        matches!(
            self,
            CheckpointError::MisalignedOffset { .. }
                | CheckpointError::UnsupportedFusion { .. }
                | CheckpointError::UnsupportedFlattenedMerge { .. }
                | CheckpointError::ElementCountMismatch { .. }
                | CheckpointError::InvalidTiling { .. }
        )
    }
}
