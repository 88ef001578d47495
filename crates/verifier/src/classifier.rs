//! Response classification
//!
//! Pure function of an `AttemptOutcome` and the template's indicator lists.
//! Order of evaluation:
//! 1. Transport fault → `Timeout` or `Error`
//! 2. Failure indicators, first match → `Failed`
//! 3. Success indicators, first match → `Success`
//! 4. Nothing matched → `Ambiguous` (never counted as success)
//!
//! Failure indicators win over success indicators so that a login page that
//! happens to contain a "success" marker is still recognized as a rejection.

use common::LoginStatus;
use profile::{Indicator, RequestTemplate};

use crate::outcome::{AttemptOutcome, FaultKind};

/// Classification of one outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: LoginStatus,
    pub success: bool,
    pub message: String,
    /// Indicator that decided the verdict
    pub matched: Option<Indicator>,
    /// Final URL differs from the request URL, recorded whatever the status
    pub page_changed: bool,
}

pub fn classify(outcome: &AttemptOutcome, template: &RequestTemplate) -> Verdict {
    let page_changed = outcome.final_url != outcome.request_url;

    if let Some(fault) = &outcome.fault {
        let status = match fault.kind {
            FaultKind::Timeout => LoginStatus::Timeout,
            FaultKind::Connect | FaultKind::Status | FaultKind::Other => LoginStatus::Error,
        };
        return Verdict {
            status,
            success: false,
            message: fault.message.clone(),
            matched: None,
            page_changed: false,
        };
    }

    if let Some(indicator) = template
        .failure_indicators
        .iter()
        .find(|i| matches(i, outcome))
    {
        let mut message = format!("failure indicator matched: {indicator}");
        if let Some(server) = server_message(&outcome.body) {
            message.push_str(": ");
            message.push_str(&server);
        }
        return Verdict {
            status: LoginStatus::Failed,
            success: false,
            message,
            matched: Some(indicator.clone()),
            page_changed,
        };
    }

    if let Some(indicator) = template
        .success_indicators
        .iter()
        .find(|i| matches(i, outcome))
    {
        return Verdict {
            status: LoginStatus::Success,
            success: true,
            message: format!("success indicator matched: {indicator}"),
            matched: Some(indicator.clone()),
            page_changed,
        };
    }

    Verdict {
        status: LoginStatus::Ambiguous,
        success: false,
        message: match outcome.status {
            Some(code) => format!("no indicator matched (HTTP {code})"),
            None => "no indicator matched".into(),
        },
        matched: None,
        page_changed,
    }
}

fn matches(indicator: &Indicator, outcome: &AttemptOutcome) -> bool {
    match indicator {
        Indicator::StatusCode(code) => outcome.status == Some(*code),
        Indicator::BodyContains(needle) => outcome.body.contains(needle.as_str()),
        Indicator::BodyNotContains(needle) => !outcome.body.contains(needle.as_str()),
        Indicator::BodyLengthGt(n) => outcome.body.len() > *n,
        Indicator::HeaderContains { name, value } => {
            let name = name.to_ascii_lowercase();
            outcome
                .header_values(&name)
                .any(|v| v.contains(value.as_str()))
        }
        Indicator::FinalUrlChanged => outcome.final_url != outcome.request_url,
    }
}

/// Server-provided error text from a JSON body, if any.
fn server_message(body: &str) -> Option<String> {
    let trimmed = body.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    ["message", "Message", "msg"]
        .iter()
        .find_map(|key| value.get(key)?.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.chars().take(200).collect())
}
