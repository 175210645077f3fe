//! Error types for envsync
//!
//! One error enum covers engine failures, the resize/capacity signals the
//! retry protocol keys on, and the retry sentinel itself.

use thiserror::Error;

/// Result type alias using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

/// Unified error type for envsync operations
#[derive(Debug, Error)]
pub enum SyncError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Engine Signals
    // -------------------------------------------------------------------------
    /// Another process grew the memory map past the size this handle adopted.
    #[error("environment map resized by another process")]
    MapResized,

    /// The memory map has no room left for the write.
    #[error("environment map full")]
    MapFull,

    #[error("environment is not open")]
    NotOpen,

    #[error("environment is already open")]
    AlreadyOpen,

    #[error("write attempted in a read-only transaction")]
    ReadOnly,

    /// Overlapping transactions observed while engine locking is disabled.
    #[error("unsynchronized access: {0}")]
    LockConflict(String),

    // -------------------------------------------------------------------------
    // Retry Protocol
    // -------------------------------------------------------------------------
    /// Returned by a handler to make the caller redo the transaction attempt.
    #[error("retry failed transaction")]
    RetryTxn,

    // -------------------------------------------------------------------------
    // Persistence Errors
    // -------------------------------------------------------------------------
    #[error("Snapshot corruption detected: {0}")]
    Corrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    /// Error raised by a caller-supplied transaction body.
    #[error("transaction aborted: {0}")]
    Txn(Box<dyn std::error::Error + Send + Sync>),
}

impl SyncError {
    /// Wrap an arbitrary caller error raised inside a transaction body
    pub fn txn(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        SyncError::Txn(err.into())
    }

    pub fn is_map_resized(&self) -> bool {
        matches!(self, SyncError::MapResized)
    }

    pub fn is_map_full(&self) -> bool {
        matches!(self, SyncError::MapFull)
    }

    /// True for the retry sentinel
    pub fn is_retry(&self) -> bool {
        matches!(self, SyncError::RetryTxn)
    }
}
