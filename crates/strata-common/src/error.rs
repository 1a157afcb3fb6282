//! Error types for Strata.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in Strata operations.
#[derive(Debug, Error)]
pub enum StrataError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    // Pin/latch discipline errors
    #[error("Pin discipline violated on page {page_id}: {reason}")]
    PinViolation { page_id: PageId, reason: String },

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    // Index structural errors
    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: PageId, reason: String },

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Comparator mismatch: {0}")]
    ComparatorMismatch(String),

    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),

    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    #[error("Bulk load input out of order: {0}")]
    OutOfOrder(String),

    #[error("Invalid merge set: {0}")]
    InvalidMergeSet(String),

    // Unsupported operations
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // Lifecycle errors
    #[error("Index is closed")]
    IndexClosed,

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad classification of a [`StrataError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Page read/write failure. The operation was aborted, state is consistent.
    Io,
    /// Pin or latch misuse. A programming error.
    Discipline,
    /// Corrupt page, comparator mismatch, invalid predicate or tuple.
    Structural,
    /// Operation not supported by the target.
    Unsupported,
    /// Operation on a closed index.
    Lifecycle,
    /// Invalid configuration.
    Config,
    /// Anything else.
    Internal,
}

impl StrataError {
    /// Returns the error's classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StrataError::Io(_) | StrataError::IoError(_) => ErrorKind::Io,
            StrataError::PinViolation { .. } | StrataError::BufferPoolFull => {
                ErrorKind::Discipline
            }
            StrataError::PageCorrupted { .. }
            | StrataError::KeyTooLarge { .. }
            | StrataError::TypeMismatch { .. }
            | StrataError::ComparatorMismatch(_)
            | StrataError::InvalidPredicate(_)
            | StrataError::InvalidTuple(_)
            | StrataError::OutOfOrder(_)
            | StrataError::InvalidMergeSet(_) => ErrorKind::Structural,
            StrataError::Unsupported(_) => ErrorKind::Unsupported,
            StrataError::IndexClosed => ErrorKind::Lifecycle,
            StrataError::ConfigError(_) | StrataError::InvalidParameter { .. } => {
                ErrorKind::Config
            }
            StrataError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    ///
    /// Only I/O failures qualify; a full buffer pool clears once pins are released.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Io) || matches!(self, StrataError::BufferPoolFull)
    }
}
