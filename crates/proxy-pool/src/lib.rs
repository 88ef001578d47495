//! Health-tracked proxy pool
//!
//! Hands out upstream proxies round-robin and trips a per-proxy circuit
//! breaker after repeated transport failures. A tripped proxy cools down for
//! a backoff that doubles with each consecutive trip (capped), then becomes
//! eligible again; a single success closes the breaker completely.
//!
//! Proxy lifecycle:
//! 1. Proxy registered via `add` → eligible
//! 2. `acquire` selects eligible proxies round-robin
//! 3. `failure_threshold` consecutive failures → cooling down until `disabled_until`
//! 4. Cool-down elapses → eligible again (half-open: next failure re-trips)
//! 5. Any success → counters reset, cool-down cleared
//!
//! An empty or disabled pool means "connect directly".

pub mod error;
pub mod pool;
pub mod proxy;

pub use error::{Error, Result};
pub use pool::{PoolConfig, ProxyHealth, ProxyPool, ProxySnapshot};
pub use proxy::{ProxyCredentials, ProxyInfo, ProxyKind};
