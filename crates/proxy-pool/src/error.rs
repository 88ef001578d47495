//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("duplicate proxy: {0}")]
    DuplicateProxy(String),

    #[error("no proxy available: {cooling} of {total} proxies cooling down")]
    NoProxyAvailable { total: usize, cooling: usize },

    #[error("invalid proxy {input:?}: {reason}")]
    InvalidProxy { input: String, reason: String },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
