//! Concurrent login verification engine
//!
//! Takes targets (URL + candidate credentials), shapes a login request from
//! the matching `RequestTemplate`, sends it through the proxy pool, and
//! classifies the answer. Batches run under a fixed concurrency budget with a
//! minimum spacing between dispatches; results come back aligned with the
//! input regardless of completion order.
//!
//! Attempt flow:
//! 1. `ProxyPool::acquire()` picks a proxy (or a direct connection)
//! 2. `request::LoginRequest::build()` fills the template with the credentials
//! 3. `Transport::send()` performs the request under a wall-clock timeout
//! 4. `classifier::classify()` maps the outcome to a `LoginStatus`
//! 5. `ProxyPool::report()` feeds the circuit breaker
//!
//! Transport faults are retried with a fresh proxy; application answers
//! (success, failed, ambiguous) never are.

pub mod captcha;
pub mod checkpoint;
pub mod classifier;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod outcome;
pub mod request;
pub mod stats;
pub mod transport;

pub use captcha::{CaptchaSolver, Recognition};
pub use checkpoint::SessionSink;
pub use classifier::{Verdict, classify};
pub use engine::{
    BatchHooks, BatchOptions, BatchReport, Engine, EngineConfig, ExhaustionPolicy, ResultSink,
};
pub use error::{Error, Result};
pub use outcome::{AttemptOutcome, FaultKind, TransportFault};
pub use request::LoginRequest;
pub use stats::StatsCounter;
pub use transport::{HttpTransport, Transport, TransportSettings};
