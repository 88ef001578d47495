//! Login request profiles
//!
//! A `RequestTemplate` describes how one kind of system expects its login
//! request to look (endpoint, method, field names, password encoding) and how
//! to read the answer (ordered success and failure indicators). Systems differ
//! only in data: adding support for a new product means adding a catalog entry,
//! never a new type.
//!
//! The verification engine only sees the `ProfileSource` trait. `Catalog` is
//! the URL-pattern backed implementation loaded from configuration.

pub mod catalog;
pub mod encoding;
pub mod template;

pub use catalog::{Catalog, SystemProfile};
pub use encoding::PasswordEncoding;
pub use template::{BodyEncoding, CaptchaSpec, HttpMethod, Indicator, RequestTemplate};

use std::sync::Arc;

/// Errors from building a profile catalog.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid system profile {id}: {reason}")]
    InvalidProfile { id: String, reason: String },
}

/// Result alias for profile operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Lookup from a target URL to the request shape used against it.
///
/// Implementations must always answer: an unknown system gets a generic
/// template rather than an error.
pub trait ProfileSource: Send + Sync {
    fn profile(&self, url: &str) -> Arc<RequestTemplate>;
}

/// A single template applied to every URL.
impl ProfileSource for RequestTemplate {
    fn profile(&self, _url: &str) -> Arc<RequestTemplate> {
        Arc::new(self.clone())
    }
}
