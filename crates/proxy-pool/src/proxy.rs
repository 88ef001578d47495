//! Proxy endpoint description and parsing

use std::fmt;
use std::str::FromStr;

use common::Secret;

use crate::error::{Error, Result};

/// Transport spoken to the proxy itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
}

impl ProxyKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks5 => "socks5",
        }
    }
}

/// Proxy login. The password is kept as written in the proxy URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: Secret<String>,
}

/// One upstream proxy. Identity is (host, port, kind); credentials are not
/// part of it.
#[derive(Debug, Clone)]
pub struct ProxyInfo {
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
    pub kind: ProxyKind,
}

impl ProxyInfo {
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            kind,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: String) -> Self {
        self.credentials = Some(ProxyCredentials {
            username: username.into(),
            password: Secret::new(password),
        });
        self
    }

    /// `scheme://host:port` without credentials, safe for logs and metrics.
    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}", self.kind.scheme(), self.host, self.port)
    }

    /// Full proxy URL including credentials, for handing to the HTTP client.
    pub fn to_url(&self) -> String {
        match &self.credentials {
            Some(c) => format!(
                "{}://{}:{}@{}:{}",
                self.kind.scheme(),
                c.username,
                c.password.expose(),
                self.host,
                self.port
            ),
            None => self.endpoint(),
        }
    }

    /// Whether two entries address the same proxy.
    pub fn same_endpoint(&self, other: &ProxyInfo) -> bool {
        self.kind == other.kind
            && self.port == other.port
            && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl fmt::Display for ProxyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint())
    }
}

impl FromStr for ProxyInfo {
    type Err = Error;

    /// Parse `scheme://[user:pass@]host[:port]`. A bare `host:port` is HTTP.
    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let invalid = |reason: &str| Error::InvalidProxy {
            input: trimmed.to_string(),
            reason: reason.to_string(),
        };

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };
        let parsed = url::Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;

        let kind = match parsed.scheme() {
            "http" => ProxyKind::Http,
            "https" => ProxyKind::Https,
            "socks5" | "socks5h" => ProxyKind::Socks5,
            other => return Err(invalid(&format!("unsupported scheme {other}"))),
        };
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();
        // socks has no registered default port in `url`
        let port = parsed.port_or_known_default().unwrap_or(1080);

        let mut proxy = ProxyInfo::new(kind, host, port);
        if !parsed.username().is_empty() {
            let password = parsed.password().unwrap_or_default().to_string();
            proxy = proxy.with_credentials(parsed.username(), password);
        }
        Ok(proxy)
    }
}
