//! Raw result of one HTTP exchange, before classification

use std::time::Duration;

/// Why an attempt never produced an HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Timeout,
    Connect,
    /// The server answered, but not with a usable status
    Status,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFault {
    pub kind: FaultKind,
    pub message: String,
}

impl TransportFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What came back from the target, or why nothing did.
///
/// `status` is `None` exactly when `fault` is set.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub request_url: String,
    pub status: Option<u16>,
    /// URL after redirects; equals `request_url` on faults
    pub final_url: String,
    /// Lowercased header names
    pub headers: Vec<(String, String)>,
    /// Body prefix, bounded by the transport
    pub body: String,
    pub elapsed: Duration,
    pub fault: Option<TransportFault>,
}

impl AttemptOutcome {
    pub fn response(
        request_url: impl Into<String>,
        status: u16,
        final_url: impl Into<String>,
        body: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            request_url: request_url.into(),
            status: Some(status),
            final_url: final_url.into(),
            headers: Vec::new(),
            body: body.into(),
            elapsed,
            fault: None,
        }
    }

    pub fn faulted(request_url: impl Into<String>, fault: TransportFault, elapsed: Duration) -> Self {
        let request_url = request_url.into();
        Self {
            final_url: request_url.clone(),
            request_url,
            status: None,
            headers: Vec::new(),
            body: String::new(),
            elapsed,
            fault: Some(fault),
        }
    }

    /// All values of a header, by lowercase name.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}
