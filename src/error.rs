//! Error types for EmberDB
//!
//! Provides a unified error type for all engine operations, plus the
//! stable numeric codes reported through [`crate::status::Status`].

use thiserror::Error;

/// Result type alias using EmberError
pub type Result<T> = std::result::Result<T, EmberError>;

/// Unified error type for EmberDB operations
#[derive(Debug, Error)]
pub enum EmberError {
    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Expected Query Outcomes
    // -------------------------------------------------------------------------
    #[error("Key not found")]
    NotFound,

    #[error("Key already exists")]
    KeyExists,

    #[error("Compare-and-swap conflict: stored value did not match")]
    Conflict,

    #[error("Cursor reached the end of the sequence")]
    EndOfSequence,

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    #[error("Transaction {0} was chosen as deadlock victim")]
    Deadlock(u64),

    #[error("Lock not granted before timeout")]
    LockTimeout,

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Invalid transaction state: {0}")]
    TxnState(String),

    #[error("Cursor used after its transaction ended")]
    InvalidCursor,

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Buffer cache exhausted: every frame is pinned")]
    OutOfMemory,

    #[error("Page corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    #[error("Environment must be recovered before further use: {0}")]
    RunRecovery(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EmberError {
    /// Stable numeric code for the binding layer (0 is reserved for success)
    pub fn code(&self) -> i32 {
        match self {
            EmberError::InvalidArgument(_) => -30_001,
            EmberError::Config(_) => -30_002,
            EmberError::NotFound => -30_003,
            EmberError::KeyExists => -30_004,
            EmberError::Conflict => -30_005,
            EmberError::EndOfSequence => -30_006,
            EmberError::Deadlock(_) => -30_007,
            EmberError::LockTimeout => -30_008,
            EmberError::CapacityExceeded(_) => -30_009,
            EmberError::TxnState(_) => -30_010,
            EmberError::InvalidCursor => -30_011,
            EmberError::Io(_) => -30_012,
            EmberError::OutOfMemory => -30_013,
            EmberError::Corruption(_) => -30_014,
            EmberError::WalCorruption(_) => -30_015,
            EmberError::RunRecovery(_) => -30_016,
            EmberError::Serialization(_) => -30_017,
        }
    }

    /// True for outcomes a caller is expected to handle as normal results
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            EmberError::NotFound
                | EmberError::KeyExists
                | EmberError::Conflict
                | EmberError::EndOfSequence
        )
    }

    /// True when the whole transaction should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmberError::Deadlock(_) | EmberError::LockTimeout)
    }
}

impl From<bincode::Error> for EmberError {
    fn from(err: bincode::Error) -> Self {
        EmberError::Serialization(err.to_string())
    }
}
