//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Every section is optional. The proxy list file can be swapped per run
//! with `WEAKPASS_PROXY_FILE` without editing the TOML.

use profile::{Catalog, RequestTemplate, SystemProfile};
use proxy_pool::{PoolConfig, ProxyInfo};
use scan_session::SessionConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use verifier::{BatchOptions, EngineConfig, ExhaustionPolicy, TransportSettings};

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub status: StatusConfig,
    /// Template for URLs no system profile matches
    #[serde(default)]
    pub generic: RequestTemplate,
    #[serde(default)]
    pub systems: Vec<SystemProfile>,
}

/// Attempt pacing and policy
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub max_concurrent: usize,
    pub delay_ms: u64,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Completions between session checkpoints; 0 saves only at the end
    pub checkpoint_every: usize,
    /// `abort` or `wait` when every proxy is cooling down
    pub on_exhausted: ExhaustionSetting,
    pub verify_tls: bool,
    pub user_agent: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            delay_ms: 500,
            timeout_secs: 10,
            max_retries: 2,
            retry_backoff_ms: 250,
            checkpoint_every: 10,
            on_exhausted: ExhaustionSetting::Abort,
            verify_tls: false,
            user_agent: None,
            max_body_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionSetting {
    #[default]
    Abort,
    Wait,
}

/// Proxy rotation settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    /// `scheme://[user:pass@]host:port` entries
    pub proxies: Vec<String>,
    /// One proxy per line; blank lines and `#` comments are skipped
    pub list_file: Option<PathBuf>,
    pub failure_threshold: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub direct_fallback: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxies: Vec::new(),
            list_file: None,
            failure_threshold: 3,
            backoff_base_secs: 30,
            backoff_max_secs: 300,
            direct_fallback: false,
        }
    }
}

/// Session storage
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub dir: PathBuf,
    /// Sessions untouched for this many days are removed at startup
    pub retention_days: Option<u64>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("sessions"),
            retention_days: None,
        }
    }
}

/// Optional status endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub listen_addr: Option<SocketAddr>,
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration text.
    pub fn parse(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;

        if let Ok(file) = std::env::var("WEAKPASS_PROXY_FILE") {
            config.proxy.list_file = Some(PathBuf::from(file));
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.scan.max_concurrent == 0 {
            return Err(common::Error::Config(
                "max_concurrent must be greater than 0".into(),
            ));
        }
        if self.scan.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.scan.max_body_bytes == 0 {
            return Err(common::Error::Config(
                "max_body_bytes must be greater than 0".into(),
            ));
        }
        if self.proxy.failure_threshold == 0 {
            return Err(common::Error::Config(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.proxy.backoff_base_secs > self.proxy.backoff_max_secs {
            return Err(common::Error::Config(format!(
                "backoff_base_secs ({}) must not exceed backoff_max_secs ({})",
                self.proxy.backoff_base_secs, self.proxy.backoff_max_secs
            )));
        }
        // Build once so profile mistakes surface at startup
        self.catalog()?;
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("weakpass-scan.toml")
    }

    pub fn catalog(&self) -> common::Result<Catalog> {
        Catalog::new(self.systems.clone(), self.generic.clone())
            .map_err(|e| common::Error::Config(e.to_string()))
    }

    /// Inline proxies followed by the list file's entries.
    pub fn load_proxies(&self) -> common::Result<Vec<ProxyInfo>> {
        let mut lines: Vec<String> = self.proxy.proxies.clone();
        if let Some(file) = &self.proxy.list_file {
            let contents = std::fs::read_to_string(file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read proxy list {}: {e}",
                    file.display()
                ))
            })?;
            lines.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(String::from),
            );
        }
        lines
            .iter()
            .map(|line| {
                line.parse::<ProxyInfo>()
                    .map_err(|e| common::Error::Config(e.to_string()))
            })
            .collect()
    }

    /// Settings recorded in a new session.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_concurrent: self.scan.max_concurrent,
            delay_ms: self.scan.delay_ms,
            timeout_secs: self.scan.timeout_secs,
            max_retries: self.scan.max_retries,
            use_proxy: self.proxy.enabled,
        }
    }

    /// Engine policy for a session. Pacing recorded in the session wins over
    /// the file so a resumed scan behaves like the original run.
    pub fn engine_config(&self, session: &SessionConfig) -> EngineConfig {
        EngineConfig {
            timeout: Duration::from_secs(session.timeout_secs.max(1)),
            max_retries: session.max_retries,
            retry_backoff: Duration::from_millis(self.scan.retry_backoff_ms),
            on_exhausted: match self.scan.on_exhausted {
                ExhaustionSetting::Abort => ExhaustionPolicy::Abort,
                ExhaustionSetting::Wait => ExhaustionPolicy::Wait,
            },
        }
    }

    pub fn batch_options(&self, session: &SessionConfig) -> BatchOptions {
        BatchOptions {
            max_concurrent: session.max_concurrent.max(1),
            delay: Duration::from_millis(session.delay_ms),
            checkpoint_every: self.scan.checkpoint_every,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            failure_threshold: self.proxy.failure_threshold,
            backoff_base: Duration::from_secs(self.proxy.backoff_base_secs),
            backoff_max: Duration::from_secs(self.proxy.backoff_max_secs),
            direct_fallback: self.proxy.direct_fallback,
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        let defaults = TransportSettings::default();
        TransportSettings {
            user_agent: self
                .scan
                .user_agent
                .clone()
                .unwrap_or(defaults.user_agent),
            verify_tls: self.scan.verify_tls,
            max_body_bytes: self.scan.max_body_bytes,
            max_redirects: defaults.max_redirects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profile::{PasswordEncoding, ProfileSource};
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn full_toml() -> &'static str {
        r#"
[scan]
max_concurrent = 8
delay_ms = 200
on_exhausted = "wait"

[proxy]
enabled = true
proxies = ["http://10.0.0.2:3128", "socks5://user:pw@10.0.0.3:1080"]
failure_threshold = 2

[session]
dir = "/var/lib/weakpass/sessions"
retention_days = 30

[status]
listen_addr = "127.0.0.1:9464"

[generic]
login_endpoint = "/auth"
success_indicators = [{ type = "final_url_changed" }]

[[systems]]
id = "acme-router"
patterns = ["/webui/", "acme"]
login_endpoint = "/webui/login"
body_encoding = "form"
password_encoding = "md5"
success_indicators = [{ type = "body_contains", value = "Welcome" }]
failure_indicators = [{ type = "status_code", value = 401 }]
"#
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("WEAKPASS_PROXY_FILE") };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, full_toml()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.scan.max_concurrent, 8);
        assert_eq!(config.scan.timeout_secs, 10);
        assert_eq!(config.scan.on_exhausted, ExhaustionSetting::Wait);
        assert_eq!(config.proxy.failure_threshold, 2);
        assert_eq!(config.session.retention_days, Some(30));
        assert_eq!(
            config.status.listen_addr,
            Some("127.0.0.1:9464".parse().unwrap())
        );
        assert_eq!(config.generic.login_endpoint, "/auth");
        assert_eq!(config.systems.len(), 1);
        assert_eq!(config.load_proxies().unwrap().len(), 2);

        let catalog = config.catalog().unwrap();
        let template = catalog.profile("https://10.1.1.1/webui/login");
        assert_eq!(template.name, "acme-router");
        assert_eq!(template.password_encoding, PasswordEncoding::Md5);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("WEAKPASS_PROXY_FILE") };
        let config = Config::parse("").unwrap();
        assert_eq!(config.scan.max_concurrent, 5);
        assert_eq!(config.scan.delay_ms, 500);
        assert_eq!(config.scan.checkpoint_every, 10);
        assert!(!config.proxy.enabled);
        assert_eq!(config.session.dir, PathBuf::from("sessions"));
        assert!(config.status.listen_addr.is_none());
        assert_eq!(config.generic, RequestTemplate::default());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let result = Config::parse("not valid {{{{ toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let err = Config::parse("[scan]\nmax_concurrent = 0\n").unwrap_err();
        assert!(
            err.to_string().contains("max_concurrent"),
            "error message should explain the issue, got: {err}"
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        assert!(Config::parse("[scan]\ntimeout_secs = 0\n").is_err());
    }

    #[test]
    fn test_zero_failure_threshold_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        assert!(Config::parse("[proxy]\nfailure_threshold = 0\n").is_err());
    }

    #[test]
    fn test_backoff_base_above_cap_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let err = Config::parse("[proxy]\nbackoff_base_secs = 600\n").unwrap_err();
        assert!(err.to_string().contains("backoff_base_secs"), "got: {err}");
    }

    #[test]
    fn test_duplicate_system_ids_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let toml_content = r#"
[[systems]]
id = "cam"
patterns = ["/cam"]

[[systems]]
id = "cam"
patterns = ["/camera"]
"#;
        let err = Config::parse(toml_content).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "got: {err}");
    }

    #[test]
    fn test_proxy_file_merged_with_inline_list() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("WEAKPASS_PROXY_FILE") };
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("proxies.txt");
        std::fs::write(&list, "# office egress\nhttp://10.0.0.9:8080\n\n10.0.0.10:3128\n").unwrap();

        let toml_content = format!(
            "[proxy]\nproxies = [\"http://10.0.0.2:3128\"]\nlist_file = \"{}\"\n",
            list.display()
        );
        let proxies = Config::parse(&toml_content).unwrap().load_proxies().unwrap();
        let endpoints: Vec<String> = proxies.iter().map(ProxyInfo::endpoint).collect();
        assert_eq!(
            endpoints,
            vec![
                "http://10.0.0.2:3128",
                "http://10.0.0.9:8080",
                "http://10.0.0.10:3128"
            ]
        );
    }

    #[test]
    fn test_proxy_file_env_overrides_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("from-env.txt");
        std::fs::write(&list, "socks5://10.0.0.50:1080\n").unwrap();

        unsafe { set_env("WEAKPASS_PROXY_FILE", list.to_str().unwrap()) };
        let config = Config::parse("[proxy]\nlist_file = \"/nonexistent/list.txt\"\n").unwrap();
        unsafe { remove_env("WEAKPASS_PROXY_FILE") };

        assert_eq!(config.proxy.list_file.as_deref(), Some(list.as_path()));
        let proxies = config.load_proxies().unwrap();
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].endpoint(), "socks5://10.0.0.50:1080");
    }

    #[test]
    fn test_missing_proxy_file_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("WEAKPASS_PROXY_FILE") };
        let config = Config::parse("[proxy]\nlist_file = \"/nonexistent/list.txt\"\n").unwrap();
        assert!(config.load_proxies().is_err());
    }

    #[test]
    fn test_invalid_proxy_entry_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("WEAKPASS_PROXY_FILE") };
        let config = Config::parse("[proxy]\nproxies = [\"ftp://10.0.0.2:21\"]\n").unwrap();
        assert!(config.load_proxies().is_err());
    }

    #[test]
    fn test_session_pacing_drives_engine_and_batch() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("WEAKPASS_PROXY_FILE") };
        let config = Config::parse(full_toml()).unwrap();
        let recorded = SessionConfig {
            max_concurrent: 2,
            delay_ms: 1500,
            timeout_secs: 4,
            max_retries: 0,
            use_proxy: false,
        };

        let engine = config.engine_config(&recorded);
        assert_eq!(engine.timeout, Duration::from_secs(4));
        assert_eq!(engine.max_retries, 0);
        assert_eq!(engine.on_exhausted, ExhaustionPolicy::Wait);

        let batch = config.batch_options(&recorded);
        assert_eq!(batch.max_concurrent, 2);
        assert_eq!(batch.delay, Duration::from_millis(1500));
        assert_eq!(batch.checkpoint_every, 10);

        let fresh = config.session_config();
        assert_eq!(fresh.max_concurrent, 8);
        assert!(fresh.use_proxy);
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("weakpass-scan.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
