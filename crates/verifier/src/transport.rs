//! HTTP transport
//!
//! `Transport` is the engine's only path to the network, which keeps the
//! engine testable with scripted outcomes. `HttpTransport` is the reqwest
//! implementation: one client per proxy (built lazily and cached), redirects
//! followed so the final URL is observable, and response bodies read only up
//! to a fixed prefix. Bodies are decoded with the charset the server declares
//! (header, then `<meta>`), falling back to UTF-8 and then the Chinese legacy
//! encodings many appliance login pages still use.

use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use encoding_rs::{BIG5, Encoding, GB18030, UTF_8};
use proxy_pool::ProxyInfo;
use tracing::debug;

use crate::captcha::{CaptchaImage, cookie_pairs};
use crate::outcome::{AttemptOutcome, FaultKind, TransportFault};
use crate::request::LoginRequest;

/// Boxed future returned by `Transport` methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Network access used by the engine.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Perform a login request. Never fails: faults are part of the outcome.
    fn send<'a>(
        &'a self,
        request: &'a LoginRequest,
        proxy: Option<&'a ProxyInfo>,
        timeout: Duration,
    ) -> TransportFuture<'a, AttemptOutcome>;

    /// Download a captcha image together with the cookies issued with it.
    fn fetch_captcha<'a>(
        &'a self,
        url: &'a str,
        proxy: Option<&'a ProxyInfo>,
        timeout: Duration,
    ) -> TransportFuture<'a, Result<CaptchaImage, TransportFault>>;

    /// Release pooled connections. Called when the engine stops.
    fn shutdown(&self) {}
}

/// Client settings shared by every cached client.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub user_agent: String,
    /// Appliances commonly serve self-signed certificates, so this is off by default
    pub verify_tls: bool,
    /// Bytes of response body kept for classification
    pub max_body_bytes: usize,
    pub max_redirects: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .into(),
            verify_tls: false,
            max_body_bytes: 256 * 1024,
            max_redirects: 10,
        }
    }
}

/// reqwest-backed transport with a per-proxy client cache.
pub struct HttpTransport {
    settings: TransportSettings,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl HttpTransport {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Number of cached clients.
    pub fn cached_clients(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn client_for(&self, proxy: Option<&ProxyInfo>) -> Result<reqwest::Client, TransportFault> {
        let key = proxy.map(ProxyInfo::to_url).unwrap_or_default();
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(&self.settings.user_agent)
            .danger_accept_invalid_certs(!self.settings.verify_tls)
            .redirect(reqwest::redirect::Policy::limited(self.settings.max_redirects));
        builder = match proxy {
            Some(p) => {
                let upstream = reqwest::Proxy::all(p.to_url()).map_err(|e| {
                    TransportFault::new(FaultKind::Other, format!("invalid proxy {p}: {e}"))
                })?;
                builder.proxy(upstream)
            }
            None => builder.no_proxy(),
        };
        let client = builder.build().map_err(|e| {
            TransportFault::new(FaultKind::Other, format!("building HTTP client: {e}"))
        })?;

        debug!(
            proxy = %proxy.map(ProxyInfo::endpoint).unwrap_or_else(|| "direct".into()),
            "HTTP client created"
        );
        clients.insert(key, client.clone());
        Ok(client)
    }

    async fn exchange(
        &self,
        request: &LoginRequest,
        proxy: Option<&ProxyInfo>,
    ) -> Result<(u16, String, Vec<(String, String)>, String), TransportFault> {
        let client = self.client_for(proxy)?;
        let method = match request.method {
            profile::HttpMethod::Get => reqwest::Method::GET,
            profile::HttpMethod::Post => reqwest::Method::POST,
        };

        let mut builder = client.request(method, request.url());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((content_type, body)) = request.body() {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(body);
        }

        let mut response = builder.send().await.map_err(fault_from)?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = collect_headers(response.headers());
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let mut body = Vec::new();
        while body.len() < self.settings.max_body_bytes {
            match response.chunk().await.map_err(fault_from)? {
                Some(chunk) => body.extend_from_slice(&chunk),
                None => break,
            }
        }
        body.truncate(self.settings.max_body_bytes);

        Ok((
            status,
            final_url,
            headers,
            decode_body(&body, content_type.as_deref()),
        ))
    }

    async fn download(
        &self,
        url: &str,
        proxy: Option<&ProxyInfo>,
    ) -> Result<CaptchaImage, TransportFault> {
        let client = self.client_for(proxy)?;
        let response = client.get(url).send().await.map_err(fault_from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportFault::new(
                FaultKind::Status,
                format!("captcha fetch returned HTTP {}", status.as_u16()),
            ));
        }
        let cookies = cookie_pairs(
            response
                .headers()
                .get_all(reqwest::header::SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );
        let bytes = response.bytes().await.map_err(fault_from)?;
        Ok(CaptchaImage {
            bytes: bytes.to_vec(),
            cookies,
        })
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        request: &'a LoginRequest,
        proxy: Option<&'a ProxyInfo>,
        timeout: Duration,
    ) -> TransportFuture<'a, AttemptOutcome> {
        Box::pin(async move {
            let started = Instant::now();
            let request_url = request.url().to_string();
            match tokio::time::timeout(timeout, self.exchange(request, proxy)).await {
                Ok(Ok((status, final_url, headers, body))) => AttemptOutcome {
                    request_url,
                    status: Some(status),
                    final_url,
                    headers,
                    body,
                    elapsed: started.elapsed(),
                    fault: None,
                },
                Ok(Err(fault)) => AttemptOutcome::faulted(request_url, fault, started.elapsed()),
                Err(_) => AttemptOutcome::faulted(
                    request_url,
                    timeout_fault(timeout),
                    started.elapsed(),
                ),
            }
        })
    }

    fn fetch_captcha<'a>(
        &'a self,
        url: &'a str,
        proxy: Option<&'a ProxyInfo>,
        timeout: Duration,
    ) -> TransportFuture<'a, Result<CaptchaImage, TransportFault>> {
        Box::pin(async move {
            tokio::time::timeout(timeout, self.download(url, proxy))
                .await
                .unwrap_or_else(|_| Err(timeout_fault(timeout)))
        })
    }

    fn shutdown(&self) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let released = clients.len();
        clients.clear();
        debug!(released, "HTTP clients released");
    }
}

fn timeout_fault(timeout: Duration) -> TransportFault {
    TransportFault::new(
        FaultKind::Timeout,
        format!("timed out after {:.1}s", timeout.as_secs_f64()),
    )
}

fn fault_from(e: reqwest::Error) -> TransportFault {
    let kind = if e.is_timeout() {
        FaultKind::Timeout
    } else if e.is_connect() {
        FaultKind::Connect
    } else {
        FaultKind::Other
    };
    let mut message = e.to_string();
    if let Some(source) = std::error::Error::source(&e) {
        message.push_str(": ");
        message.push_str(&source.to_string());
    }
    TransportFault::new(kind, message)
}

/// Decode a (possibly truncated) body prefix to text.
///
/// A declared charset wins. Undeclared bodies are tried as UTF-8, then GB18030
/// (a superset of GBK and GB2312), then Big5, and finally decoded lossily.
pub(crate) fn decode_body(body: &[u8], content_type: Option<&str>) -> String {
    let declared = content_type
        .and_then(charset_param)
        .or_else(|| meta_charset(body))
        .and_then(|label| Encoding::for_label(label.trim().as_bytes()));
    if let Some(encoding) = declared {
        let (text, _, _) = encoding.decode(body);
        return text.into_owned();
    }

    [UTF_8, GB18030, BIG5]
        .into_iter()
        .find_map(|encoding| decode_strict(encoding, body))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

/// Decode without replacement, tolerating a multi-byte sequence cut off by
/// the body cap.
fn decode_strict(encoding: &'static Encoding, body: &[u8]) -> Option<String> {
    (0..4)
        .take_while(|cut| *cut <= body.len())
        .find_map(|cut| {
            encoding.decode_without_bom_handling_and_without_replacement(&body[..body.len() - cut])
        })
        .map(Cow::into_owned)
}

fn charset_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// `charset=` label from an HTML `<meta>` tag near the top of the body.
fn meta_charset(body: &[u8]) -> Option<&str> {
    let head = &body[..body.len().min(2048)];
    let at = head
        .windows(8)
        .position(|w| w.eq_ignore_ascii_case(b"charset="))?
        + 8;
    let rest = &head[at..];
    let rest = rest
        .strip_prefix(b"\"")
        .or_else(|| rest.strip_prefix(b"'"))
        .unwrap_or(rest);
    let len = rest
        .iter()
        .position(|b| !(b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_'))
        .unwrap_or(rest.len());
    std::str::from_utf8(&rest[..len]).ok().filter(|l| !l.is_empty())
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
