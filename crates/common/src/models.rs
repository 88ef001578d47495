//! Scan records: targets, login results and tallies

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One candidate credential pair against one login endpoint.
///
/// `index` is the position in the original batch and never changes once a
/// session has been created; results are addressed by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Additional form fields submitted alongside the credentials
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
    pub index: usize,
    /// File the target was imported from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

impl Target {
    pub fn new(
        index: usize,
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
            password: password.into(),
            extra: BTreeMap::new(),
            index,
            source_file: None,
        }
    }

    /// A target is attemptable only when url, username and password are all set.
    pub fn is_valid(&self) -> bool {
        !self.url.trim().is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Classification of a single login attempt.
///
/// `Pending` is the only non-terminal state; every finished attempt lands in
/// one of the other five.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStatus {
    Pending,
    Success,
    Failed,
    Error,
    Timeout,
    Ambiguous,
}

impl LoginStatus {
    /// Status label for logs, metrics and exports.
    pub fn label(&self) -> &'static str {
        match self {
            LoginStatus::Pending => "pending",
            LoginStatus::Success => "success",
            LoginStatus::Failed => "failed",
            LoginStatus::Error => "error",
            LoginStatus::Timeout => "timeout",
            LoginStatus::Ambiguous => "ambiguous",
        }
    }

    /// True when the attempt never got an answer from the target server.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, LoginStatus::Error | LoginStatus::Timeout)
    }
}

impl std::fmt::Display for LoginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Permanent record of one target's attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResult {
    pub status: LoginStatus,
    pub success: bool,
    pub message: String,
    /// Seconds from first dispatch to final answer, retries included
    pub response_time: f64,
    pub url: String,
    pub final_url: String,
    pub page_changed: bool,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl LoginResult {
    /// Result for an attempt that never produced an HTTP response.
    pub fn fault(
        status: LoginStatus,
        url: impl Into<String>,
        message: impl Into<String>,
        response_time: f64,
    ) -> Self {
        let url = url.into();
        Self {
            status,
            success: false,
            message: message.into(),
            response_time,
            final_url: url.clone(),
            url,
            page_changed: false,
            details: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a diagnostic entry.
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Running tallies over a set of results.
///
/// `error` and `timeout` count unreachable systems; `failed` counts rejected
/// credentials. The two are never merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub ambiguous: u64,
    pub error: u64,
    pub timeout: u64,
}

impl ScanStats {
    /// Count one result.
    pub fn record(&mut self, result: &LoginResult) {
        self.total += 1;
        *self.bucket(result.status) += 1;
    }

    /// Undo a previous `record` for the same result (used when overwriting).
    pub fn forget(&mut self, result: &LoginResult) {
        self.total = self.total.saturating_sub(1);
        let bucket = self.bucket(result.status);
        *bucket = bucket.saturating_sub(1);
    }

    fn bucket(&mut self, status: LoginStatus) -> &mut u64 {
        match status {
            LoginStatus::Success => &mut self.success,
            LoginStatus::Failed => &mut self.failed,
            LoginStatus::Ambiguous | LoginStatus::Pending => &mut self.ambiguous,
            LoginStatus::Error => &mut self.error,
            LoginStatus::Timeout => &mut self.timeout,
        }
    }
}
