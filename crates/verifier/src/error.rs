//! Error types for engine operations
//!
//! Only resource faults surface as `Err`. A target that cannot be reached or
//! whose credentials are rejected still produces a `LoginResult`.

/// Errors from engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("engine is stopped")]
    EngineClosed,

    #[error("no proxy available: {0}")]
    NoProxyAvailable(String),

    #[error("session error: {0}")]
    Session(#[from] scan_session::Error),

    #[error("result sink failed: {0}")]
    Sink(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// The closing checkpoint of a session run was not written. Results
    /// completed since the previous checkpoint exist only in memory.
    #[error("final checkpoint failed: {save}{}", batch_note(.batch))]
    FinalCheckpoint {
        save: Box<Error>,
        /// Fault that had already aborted the batch, if any
        batch: Option<Box<Error>>,
    },
}

fn batch_note(batch: &Option<Box<Error>>) -> String {
    batch
        .as_ref()
        .map(|e| format!(" (batch aborted: {e})"))
        .unwrap_or_default()
}

impl From<proxy_pool::Error> for Error {
    fn from(e: proxy_pool::Error) -> Self {
        Error::NoProxyAvailable(e.to_string())
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
