//! Captcha recognition seam
//!
//! Recognition itself (OCR models and the like) lives outside this crate.
//! The engine only needs text plus a confidence score, and calls the solver
//! on the blocking pool because recognizers are CPU-bound.

/// Text read from a captcha image.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    /// 0.0 to 1.0
    pub confidence: f32,
}

pub trait CaptchaSolver: Send + Sync + 'static {
    /// `None` when nothing legible was found.
    fn recognize(&self, image: &[u8]) -> Option<Recognition>;
}

/// Captcha image plus the session cookies issued with it.
///
/// The login request must carry the same cookies, since the server ties the
/// expected answer to the session that fetched the image.
#[derive(Debug, Clone, Default)]
pub struct CaptchaImage {
    pub bytes: Vec<u8>,
    /// `name=value` pairs taken from `Set-Cookie`
    pub cookies: Vec<String>,
}

impl CaptchaImage {
    /// Value for a `Cookie` request header, if any cookies were issued.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            None
        } else {
            Some(self.cookies.join("; "))
        }
    }
}

/// Reduce `Set-Cookie` values to their `name=value` part.
pub(crate) fn cookie_pairs<'a>(set_cookie: impl Iterator<Item = &'a str>) -> Vec<String> {
    set_cookie
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .map(String::from)
        .collect()
}
