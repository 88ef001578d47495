//! Error types for session operations

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("session {id} is corrupt: {reason}")]
    CorruptSession { id: String, reason: String },

    #[error("target index {index} out of range for session of {len} targets")]
    InvalidTargetIndex { index: usize, len: usize },

    #[error("duplicate target index {0}")]
    DuplicateTargetIndex(usize),

    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("export failed: {0}")]
    Export(String),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
