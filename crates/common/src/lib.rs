//! Shared types for the weak-credential scanner
//!
//! Holds the records every other crate passes around: the `Target` under test,
//! the `LoginResult` produced for it, and the `ScanStats` tallies derived from
//! results. Also hosts the config error type and the `Secret` wrapper.

mod error;
mod models;
mod secret;

pub use error::{Error, Result};
pub use models::{LoginResult, LoginStatus, ScanStats, Target};
pub use secret::{Secret, mask};
