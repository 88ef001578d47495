//! Request template and response indicators

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::encoding::PasswordEncoding;

/// HTTP method used for the login request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
}

/// How credentials are carried in a POST body. GET always uses the query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    #[default]
    Json,
    Form,
}

/// A single testable condition over an HTTP outcome.
///
/// Written in config as `{ type = "status_code", value = 200 }`,
/// `{ type = "body_contains", value = "Welcome" }`,
/// `{ type = "header_contains", value = { name = "set-cookie", value = "token=" } }`
/// or `{ type = "final_url_changed" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Indicator {
    StatusCode(u16),
    BodyContains(String),
    BodyNotContains(String),
    BodyLengthGt(usize),
    /// Some value of header `name` (case-insensitive) contains `value`
    HeaderContains { name: String, value: String },
    /// Final URL after redirects differs from the request URL
    FinalUrlChanged,
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Indicator::StatusCode(code) => write!(f, "status_code == {code}"),
            Indicator::BodyContains(s) => write!(f, "body_contains {s:?}"),
            Indicator::BodyNotContains(s) => write!(f, "body_not_contains {s:?}"),
            Indicator::BodyLengthGt(n) => write!(f, "body_length > {n}"),
            Indicator::HeaderContains { name, value } => {
                write!(f, "header {name} contains {value:?}")
            }
            Indicator::FinalUrlChanged => write!(f, "final_url_changed"),
        }
    }
}

/// Captcha challenge attached to a login form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptchaSpec {
    /// Path (or absolute URL) of the captcha image, resolved against the target origin
    pub image_path: String,
    /// Form field that receives the recognized text
    #[serde(default = "default_captcha_field")]
    pub field: String,
    /// Recognitions below this confidence are still submitted but flagged
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

fn default_captcha_field() -> String {
    "captcha".into()
}

fn default_min_confidence() -> f32 {
    0.6
}

/// Declarative shape of a login request and the rules for reading its answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTemplate {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_login_endpoint")]
    pub login_endpoint: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub body_encoding: BodyEncoding,
    #[serde(default = "default_username_field")]
    pub username_field: String,
    #[serde(default = "default_password_field")]
    pub password_field: String,
    #[serde(default)]
    pub password_encoding: PasswordEncoding,
    /// Fixed headers sent with every attempt
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Fixed body fields sent with every attempt
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Evaluated in order after failure indicators; first match wins
    #[serde(default)]
    pub success_indicators: Vec<Indicator>,
    /// Evaluated in order before success indicators; first match wins
    #[serde(default)]
    pub failure_indicators: Vec<Indicator>,
    #[serde(default)]
    pub captcha: Option<CaptchaSpec>,
}

fn default_login_endpoint() -> String {
    "/login".into()
}

fn default_username_field() -> String {
    "username".into()
}

fn default_password_field() -> String {
    "password".into()
}

impl Default for RequestTemplate {
    /// Generic fallback used when no catalog entry matches a URL.
    ///
    /// Only a redirect away from the login page counts as success; common
    /// rejection statuses and phrases count as failure.
    fn default() -> Self {
        Self {
            name: "generic".into(),
            login_endpoint: default_login_endpoint(),
            method: HttpMethod::Post,
            body_encoding: BodyEncoding::Json,
            username_field: default_username_field(),
            password_field: default_password_field(),
            password_encoding: PasswordEncoding::None,
            headers: BTreeMap::new(),
            fields: BTreeMap::new(),
            success_indicators: vec![Indicator::FinalUrlChanged],
            failure_indicators: vec![
                Indicator::StatusCode(401),
                Indicator::StatusCode(403),
                Indicator::BodyContains("error".into()),
                Indicator::BodyContains("failed".into()),
                Indicator::BodyContains("invalid".into()),
            ],
            captcha: None,
        }
    }
}
