//! Durable scan progress
//!
//! A `ScanSession` holds the ordered targets of one scan together with the
//! results produced so far, addressed by position in the target list. The
//! `SessionStore` persists one JSON file per session and can reload it to
//! resume a scan where it stopped.
//!
//! Session flow:
//! 1. `SessionStore::create_session()` at scan start (duplicate indices rejected)
//! 2. The engine writes each result via `ScanSession::add_result()`
//! 3. `SessionStore::save_session()` checkpoints (temp file + rename)
//! 4. After a restart, `SessionStore::load_session()` + `remaining_targets()`
//! 5. `export::export_results()` writes CSV or JSON rows for reporting

pub mod error;
pub mod export;
pub mod session;
pub mod store;

pub use error::{Error, Result};
pub use export::{ExportFormat, export_results};
pub use session::{ScanSession, SessionConfig};
pub use store::{SessionStore, SessionSummary};
