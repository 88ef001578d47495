//! Result export for reporting
//!
//! One row per completed target in position order. Column order is fixed:
//! `index, target_index, url, username, password, status, success, message,
//! response_time, final_url, page_changed, timestamp`. `index` is the
//! 1-based row number.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::session::ScanSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(Error::Export(format!("unknown export format {other:?}"))),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        })
    }
}

#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    index: usize,
    target_index: usize,
    url: &'a str,
    username: &'a str,
    password: &'a str,
    status: &'static str,
    success: bool,
    message: &'a str,
    response_time: f64,
    final_url: &'a str,
    page_changed: bool,
    timestamp: String,
}

fn rows(session: &ScanSession) -> Vec<ExportRow<'_>> {
    session
        .targets
        .iter()
        .zip(&session.results)
        .filter_map(|(target, slot)| slot.as_ref().map(|result| (target, result)))
        .enumerate()
        .map(|(row, (target, result))| ExportRow {
            index: row + 1,
            target_index: target.index,
            url: &result.url,
            username: &target.username,
            password: &target.password,
            status: result.status.label(),
            success: result.success,
            message: &result.message,
            // millisecond precision is enough for reports
            response_time: (result.response_time * 1000.0).round() / 1000.0,
            final_url: &result.final_url,
            page_changed: result.page_changed,
            timestamp: result.timestamp.to_rfc3339(),
        })
        .collect()
}

fn render(session: &ScanSession, format: ExportFormat) -> Result<(Vec<u8>, usize)> {
    let rows = rows(session);
    let count = rows.len();
    let bytes = match format {
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            if rows.is_empty() {
                // serde only emits the header with the first record
                writer
                    .write_record([
                        "index",
                        "target_index",
                        "url",
                        "username",
                        "password",
                        "status",
                        "success",
                        "message",
                        "response_time",
                        "final_url",
                        "page_changed",
                        "timestamp",
                    ])
                    .map_err(|e| Error::Export(e.to_string()))?;
            }
            for row in &rows {
                writer
                    .serialize(row)
                    .map_err(|e| Error::Export(e.to_string()))?;
            }
            writer
                .into_inner()
                .map_err(|e| Error::Export(e.to_string()))?
        }
        ExportFormat::Json => {
            serde_json::to_vec_pretty(&rows).map_err(|e| Error::Export(e.to_string()))?
        }
    };
    Ok((bytes, count))
}

/// Write the completed results of `session` to `destination`.
///
/// Returns the number of rows written.
pub async fn export_results(
    session: &ScanSession,
    destination: &Path,
    format: ExportFormat,
) -> Result<usize> {
    let (bytes, count) = render(session, format)?;
    tokio::fs::write(destination, bytes)
        .await
        .map_err(|e| Error::Io(format!("writing export file: {e}")))?;
    info!(
        session_id = %session.session_id,
        rows = count,
        format = %format,
        path = %destination.display(),
        "results exported"
    );
    Ok(count)
}
