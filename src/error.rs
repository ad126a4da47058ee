//! Error types for iocoll
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

use crate::codec::NumberSize;

/// Result type alias using IoCollError
pub type Result<T> = std::result::Result<T, IoCollError>;

/// Unified error type for iocoll operations
#[derive(Debug, Error)]
pub enum IoCollError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Storage Provider Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid chunk pointer: {0}")]
    InvalidPointer(u64),

    #[error("Index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: u64, len: u64 },

    // -------------------------------------------------------------------------
    // Encoding Errors
    // -------------------------------------------------------------------------
    /// Recoverable: the owning array migrates to wider fields and retries.
    #[error("Value needs {required:?} but field holds {available:?}")]
    WidthOverflow {
        required: NumberSize,
        available: NumberSize,
    },

    #[error("No number size can hold {0}")]
    NoWiderSize(u64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Structural Errors
    // -------------------------------------------------------------------------
    #[error("Corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl IoCollError {
    /// True for the width overflow that arrays recover from internally
    pub fn is_width_overflow(&self) -> bool {
        matches!(self, IoCollError::WidthOverflow { .. })
    }

    /// True for corruption found by a validation pass
    pub fn is_corruption(&self) -> bool {
        matches!(self, IoCollError::Corruption(_))
    }
}

impl From<bincode::Error> for IoCollError {
    fn from(e: bincode::Error) -> Self {
        IoCollError::Serialization(e.to_string())
    }
}
