//! Service-specific error types

use thiserror::Error;

/// Command-line errors. Runtime failures go through `anyhow` in `main`.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("missing value for {0}")]
    MissingValue(&'static str),

    #[error("unknown argument: {0}")]
    UnknownArgument(String),

    #[error("choose exactly one of --targets, --resume, --list or --export")]
    NoCommand,

    #[error("{0} cannot be combined with {1}")]
    Conflict(&'static str, &'static str),

    #[error("--export requires --output")]
    MissingOutput,

    #[error("invalid export format: {0}")]
    InvalidFormat(String),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
