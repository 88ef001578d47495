//! Pool state machine and round-robin proxy selection
//!
//! Each proxy carries a `ProxyHealth` record. Failures are counted per proxy;
//! reaching `failure_threshold` consecutive failures disables the proxy until
//! `disabled_until`. Cooldown expiry is noticed lazily by `acquire`, so no
//! background task is needed.
//!
//! Every piece of pool state sits behind a single mutex, and no caller holds
//! it across network I/O: `acquire` hands out a clone and `report` re-locks.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::proxy::ProxyInfo;

/// Circuit breaker and fallback settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// Cooldown after the first trip; doubles for each further consecutive trip
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Connect directly instead of failing when every proxy is cooling down
    pub direct_fallback: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(300),
            direct_fallback: false,
        }
    }
}

/// Health counters for one proxy.
#[derive(Debug, Clone, Default)]
pub struct ProxyHealth {
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub disabled_until: Option<Instant>,
    /// Trips since the last success; drives the backoff exponent
    pub disablements: u32,
}

impl ProxyHealth {
    fn cooling(&self, now: Instant) -> bool {
        self.disabled_until.is_some_and(|until| until > now)
    }

    /// Status label for health/logging.
    pub fn label(&self, now: Instant) -> &'static str {
        if self.cooling(now) {
            "cooling_down"
        } else if self.consecutive_failures > 0 {
            "degraded"
        } else {
            "available"
        }
    }
}

/// Point-in-time view of one proxy, for status reporting.
#[derive(Debug, Clone)]
pub struct ProxySnapshot {
    pub proxy: ProxyInfo,
    pub health: ProxyHealth,
}

struct PoolState {
    entries: Vec<(ProxyInfo, ProxyHealth)>,
    cursor: usize,
    enabled: bool,
}

/// Rotating proxy pool with a per-proxy circuit breaker.
pub struct ProxyPool {
    state: Mutex<PoolState>,
    config: PoolConfig,
}

impl ProxyPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            state: Mutex::new(PoolState {
                entries: Vec::new(),
                cursor: 0,
                enabled: true,
            }),
            config,
        }
    }

    /// Build a pool from an initial list, rejecting duplicates.
    pub async fn with_proxies(config: PoolConfig, proxies: Vec<ProxyInfo>) -> Result<Self> {
        let pool = Self::new(config);
        for proxy in proxies {
            pool.add(proxy).await?;
        }
        info!(proxies = pool.len().await, "proxy pool initialized");
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Register a proxy. Starts eligible with zeroed counters.
    pub async fn add(&self, proxy: ProxyInfo) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.entries.iter().any(|(p, _)| p.same_endpoint(&proxy)) {
            return Err(Error::DuplicateProxy(proxy.endpoint()));
        }
        debug!(proxy = %proxy, "proxy added to pool");
        state.entries.push((proxy, ProxyHealth::default()));
        Ok(())
    }

    /// Remove a proxy. Returns whether it was present.
    pub async fn remove(&self, proxy: &ProxyInfo) -> bool {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|(p, _)| !p.same_endpoint(proxy));
        let removed = state.entries.len() != before;
        if removed {
            info!(proxy = %proxy, "proxy removed from pool");
        }
        removed
    }

    /// A disabled pool hands out direct connections without touching counters.
    pub async fn set_enabled(&self, enabled: bool) {
        self.state.lock().await.enabled = enabled;
        info!(enabled, "proxy pool toggled");
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Select the next eligible proxy round-robin.
    ///
    /// Returns `Ok(None)` for a direct connection: the pool is empty or
    /// disabled, or every proxy is cooling down and `direct_fallback` is set.
    /// Returns `NoProxyAvailable` when every proxy is cooling down otherwise.
    pub async fn acquire(&self) -> Result<Option<ProxyInfo>> {
        let mut state = self.state.lock().await;
        let n = state.entries.len();
        if !state.enabled || n == 0 {
            return Ok(None);
        }

        let start = state.cursor % n;
        state.cursor = state.cursor.wrapping_add(1);
        let now = Instant::now();

        for offset in 0..n {
            let idx = (start + offset) % n;
            let (proxy, health) = &mut state.entries[idx];
            match health.disabled_until {
                Some(until) if until > now => continue,
                Some(_) => {
                    // Half-open: consecutive failures are kept, so one more
                    // failure trips again with the next backoff step
                    info!(proxy = %proxy, "cooldown expired, proxy eligible again");
                    health.disabled_until = None;
                }
                None => {}
            }
            return Ok(Some(proxy.clone()));
        }

        if self.config.direct_fallback {
            debug!(total = n, "all proxies cooling down, falling back to direct");
            return Ok(None);
        }
        warn!(total = n, "all proxies cooling down");
        Err(Error::NoProxyAvailable {
            total: n,
            cooling: n,
        })
    }

    /// Record the outcome of an attempt made through `proxy`.
    ///
    /// Unknown proxies (for example removed since acquisition) are ignored.
    pub async fn report(&self, proxy: &ProxyInfo, success: bool) {
        let mut state = self.state.lock().await;
        let Some((_, health)) = state
            .entries
            .iter_mut()
            .find(|(p, _)| p.same_endpoint(proxy))
        else {
            debug!(proxy = %proxy, "outcome reported for unknown proxy");
            return;
        };

        if success {
            if health.disablements > 0 || health.consecutive_failures > 0 {
                info!(proxy = %proxy, "proxy recovered");
            }
            health.total_successes += 1;
            health.consecutive_failures = 0;
            health.disablements = 0;
            health.disabled_until = None;
            return;
        }

        health.total_failures += 1;
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);

        let now = Instant::now();
        // Late failures from attempts already in flight do not extend a cooldown
        if health.consecutive_failures >= self.config.failure_threshold && !health.cooling(now) {
            health.disablements = health.disablements.saturating_add(1);
            let cooldown = self.cooldown_for(health.disablements);
            health.disabled_until = Some(now + cooldown);
            warn!(
                proxy = %proxy,
                consecutive_failures = health.consecutive_failures,
                cooldown_secs = cooldown.as_secs(),
                "proxy disabled"
            );
            metrics::counter!("weakpass_proxy_disabled_total").increment(1);
        } else {
            debug!(
                proxy = %proxy,
                consecutive_failures = health.consecutive_failures,
                "proxy failure recorded"
            );
        }
    }

    /// Cooldown for the `disablement`-th consecutive trip (1-based).
    pub fn cooldown_for(&self, disablement: u32) -> Duration {
        let exponent = disablement.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.config
            .backoff_base
            .saturating_mul(factor)
            .min(self.config.backoff_max)
    }

    /// Time until the earliest cooldown ends, or `None` if a proxy is
    /// eligible now or the pool has nothing cooling.
    pub async fn next_available_in(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        let now = Instant::now();
        if state.entries.iter().any(|(_, h)| !h.cooling(now)) {
            return None;
        }
        state
            .entries
            .iter()
            .filter_map(|(_, h)| h.disabled_until)
            .min()
            .map(|until| until.saturating_duration_since(now))
    }

    /// Per-proxy health snapshot in registration order.
    pub async fn snapshot(&self) -> Vec<ProxySnapshot> {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .map(|(proxy, health)| ProxySnapshot {
                proxy: proxy.clone(),
                health: health.clone(),
            })
            .collect()
    }

    /// Pool health summary for the status endpoint.
    ///
    /// All eligible → healthy, some eligible → degraded, none → unhealthy.
    /// An empty or disabled pool reports `direct`.
    pub async fn health(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let now = Instant::now();

        let mut proxies = Vec::with_capacity(state.entries.len());
        let mut available = 0usize;
        let mut cooling = 0usize;
        for (proxy, health) in &state.entries {
            let remaining = health
                .disabled_until
                .map(|until| until.saturating_duration_since(now).as_secs())
                .unwrap_or(0);
            if health.cooling(now) {
                cooling += 1;
            } else {
                available += 1;
            }
            proxies.push(serde_json::json!({
                "proxy": proxy.endpoint(),
                "status": health.label(now),
                "consecutive_failures": health.consecutive_failures,
                "total_successes": health.total_successes,
                "total_failures": health.total_failures,
                "cooldown_remaining_secs": remaining,
            }));
        }

        let total = state.entries.len();
        let status = if !state.enabled || total == 0 {
            "direct"
        } else if available == total {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "enabled": state.enabled,
            "proxies_total": total,
            "proxies_available": available,
            "proxies_cooling_down": cooling,
            "proxies": proxies,
        })
    }
}
