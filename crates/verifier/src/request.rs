//! Login request construction
//!
//! Fills a `RequestTemplate` with one target's credentials. The login URL is
//! the target URL itself when it names a path; a bare origin gets the
//! template's `login_endpoint` joined onto it.

use std::collections::BTreeMap;
use std::fmt;

use common::Target;
use profile::{BodyEncoding, HttpMethod, RequestTemplate};
use url::Url;

/// Why a target could not be turned into a request.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid target url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Parse a target URL, assuming `http://` when no scheme is given.
pub fn parse_target_url(raw: &str) -> Result<Url, BuildError> {
    let trimmed = raw.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let url = Url::parse(&candidate).map_err(|e| BuildError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(BuildError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    Ok(url)
}

/// Login URL for `target_url` under `login_endpoint`.
pub fn resolve_login_url(target_url: &str, login_endpoint: &str) -> Result<Url, BuildError> {
    let url = parse_target_url(target_url)?;
    if !url.path().is_empty() && url.path() != "/" {
        return Ok(url);
    }
    resolve_against(&url, login_endpoint, target_url)
}

/// Join `path` (relative or absolute) onto the origin of `base`.
pub fn resolve_against(base: &Url, path: &str, raw: &str) -> Result<Url, BuildError> {
    base.join(path).map_err(|e| BuildError::InvalidUrl {
        url: raw.to_string(),
        reason: format!("cannot join {path:?}: {e}"),
    })
}

/// A fully shaped login request.
///
/// Field values are kept structured until `body()` / `url()` renders them,
/// so captcha answers can be added after the template is applied.
#[derive(Clone)]
pub struct LoginRequest {
    pub method: HttpMethod,
    pub encoding: BodyEncoding,
    endpoint: Url,
    pub headers: BTreeMap<String, String>,
    pub fields: BTreeMap<String, String>,
    password_field: String,
}

impl LoginRequest {
    /// Apply `template` to `target`.
    ///
    /// Field precedence, lowest first: template fixed fields, target extras,
    /// then the username and password (password encoding applied).
    pub fn build(template: &RequestTemplate, target: &Target) -> Result<Self, BuildError> {
        let endpoint = resolve_login_url(&target.url, &template.login_endpoint)?;

        let mut fields = template.fields.clone();
        fields.extend(target.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        fields.insert(template.username_field.clone(), target.username.clone());
        fields.insert(
            template.password_field.clone(),
            template.password_encoding.apply(&target.password),
        );

        Ok(Self {
            method: template.method,
            encoding: template.body_encoding,
            endpoint,
            headers: template.headers.clone(),
            fields,
            password_field: template.password_field.clone(),
        })
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Login endpoint without any credential query.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// URL actually requested. GET carries the fields in the query string.
    pub fn url(&self) -> Url {
        let mut url = self.endpoint.clone();
        if self.method == HttpMethod::Get {
            url.query_pairs_mut().extend_pairs(self.fields.iter());
        }
        url
    }

    /// Content type and encoded body, or `None` for GET.
    pub fn body(&self) -> Option<(&'static str, Vec<u8>)> {
        if self.method == HttpMethod::Get {
            return None;
        }
        Some(match self.encoding {
            BodyEncoding::Json => {
                let object: serde_json::Map<String, serde_json::Value> = self
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect();
                (
                    "application/json",
                    serde_json::Value::Object(object).to_string().into_bytes(),
                )
            }
            BodyEncoding::Form => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(self.fields.iter())
                    .finish();
                ("application/x-www-form-urlencoded", encoded.into_bytes())
            }
        })
    }
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: BTreeMap<&str, &str> = self
            .fields
            .iter()
            .map(|(k, v)| {
                let shown = if *k == self.password_field {
                    "[REDACTED]"
                } else {
                    v.as_str()
                };
                (k.as_str(), shown)
            })
            .collect();
        f.debug_struct("LoginRequest")
            .field("method", &self.method)
            .field("endpoint", &self.endpoint.as_str())
            .field("encoding", &self.encoding)
            .field("fields", &fields)
            .finish()
    }
}
