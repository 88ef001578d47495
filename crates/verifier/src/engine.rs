//! Verification engine
//!
//! `verify_one` runs a single target to a `LoginResult`, retrying transport
//! faults with a fresh proxy each time. `verify_batch` fans a target list out
//! over a bounded worker pool:
//!
//! - a `Semaphore` of `max_concurrent` permits bounds in-flight attempts
//! - a pacer keeps successive dispatches at least `delay` apart
//! - completions are collected as they arrive, so progress callbacks and the
//!   result sink run in completion order while the returned results stay
//!   aligned with the input
//! - a `CancellationToken` stops dispatch; in-flight attempts finish under
//!   their own timeout
//!
//! Only resource faults (engine stopped, proxy pool exhausted, sink failure)
//! end a batch early, and only after in-flight attempts have drained.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use common::{LoginResult, LoginStatus, ScanStats, Target, mask};
use futures_util::FutureExt;
use profile::{ProfileSource, RequestTemplate};
use proxy_pool::{ProxyInfo, ProxyPool};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::captcha::{CaptchaSolver, Recognition};
use crate::classifier::{Verdict, classify};
use crate::error::{Error, Result};
use crate::metrics::{InFlight, record_attempt};
use crate::outcome::{AttemptOutcome, FaultKind};
use crate::request::LoginRequest;
use crate::stats::StatsCounter;
use crate::transport::Transport;

/// What to do when every proxy is cooling down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Surface `NoProxyAvailable`
    #[default]
    Abort,
    /// Sleep until the earliest cooldown ends, at most `max_retries` times
    Wait,
}

/// Per-attempt policy.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wall-clock limit for one HTTP exchange
    pub timeout: Duration,
    /// Extra attempts after a transport fault
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub on_exhausted: ExhaustionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
            on_exhausted: ExhaustionPolicy::Abort,
        }
    }
}

/// Batch scheduling knobs.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_concurrent: usize,
    /// Minimum spacing between dispatches (not completions)
    pub delay: Duration,
    /// Session checkpoint cadence for `run_session`; 0 saves only at the end
    pub checkpoint_every: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            delay: Duration::from_millis(500),
            checkpoint_every: 10,
        }
    }
}

/// Receives each result as it completes. Called from a single task, in
/// completion order; `position` indexes the batch's target slice.
pub trait ResultSink: Send + Sync {
    fn record<'a>(
        &'a self,
        position: usize,
        result: &'a LoginResult,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;
pub type LogFn = Arc<dyn Fn(&Target, &LoginResult) + Send + Sync>;

/// Callbacks and cancellation for one batch.
#[derive(Clone, Default)]
pub struct BatchHooks {
    /// `(done, total)` after each completion
    pub on_progress: Option<ProgressFn>,
    pub on_log: Option<LogFn>,
    pub sink: Option<Arc<dyn ResultSink>>,
    pub cancel: CancellationToken,
}

/// Results aligned with the input; `None` for targets never dispatched
/// because the batch was cancelled.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub results: Vec<Option<LoginResult>>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }
}

/// Concurrent verification engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    profiles: Arc<dyn ProfileSource>,
    pool: Arc<ProxyPool>,
    transport: Arc<dyn Transport>,
    solver: Option<Arc<dyn CaptchaSolver>>,
    stats: Arc<StatsCounter>,
    running: Arc<AtomicBool>,
}

/// Result of one network attempt, before retry handling.
enum Attempt {
    Sent {
        outcome: AttemptOutcome,
        captcha: Option<Recognition>,
    },
    /// Not attemptable; becomes a final `Error` result without retry
    Rejected(String),
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        profiles: Arc<dyn ProfileSource>,
        pool: Arc<ProxyPool>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            profiles,
            pool,
            transport,
            solver: None,
            stats: Arc::new(StatsCounter::default()),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_captcha_solver(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Accept attempts again after `stop`. A new engine starts running.
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("engine started");
        }
    }

    /// Refuse further attempts and release transport resources.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.transport.shutdown();
            info!("engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ScanStats {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::EngineClosed)
        }
    }

    /// Verify one target.
    ///
    /// Rejected credentials, unreachable hosts and timeouts are all `Ok`
    /// results; `Err` means the engine could not attempt the target at all.
    pub async fn verify_one(&self, target: &Target) -> Result<LoginResult> {
        self.verify_spaced(target, self.config.retry_backoff).await
    }

    /// `verify_one` with retries at least `retry_spacing` apart.
    async fn verify_spaced(&self, target: &Target, retry_spacing: Duration) -> Result<LoginResult> {
        self.ensure_running()?;
        let started = Instant::now();

        let result = if target.is_valid() {
            let template = self.profiles.profile(&target.url);
            self.run_attempts(target, &template, started, retry_spacing)
                .await?
        } else {
            LoginResult::fault(
                LoginStatus::Error,
                &target.url,
                "target is missing url, username or password",
                0.0,
            )
            .with_detail("target_index", target.index)
        };

        self.stats.record(&result);
        record_attempt(result.status, result.response_time);
        debug!(
            target_index = target.index,
            url = %target.url,
            username = %target.username,
            password = %mask(&target.password),
            status = %result.status,
            response_time = result.response_time,
            "attempt finished"
        );
        Ok(result)
    }

    async fn run_attempts(
        &self,
        target: &Target,
        template: &RequestTemplate,
        started: Instant,
        retry_spacing: Duration,
    ) -> Result<LoginResult> {
        let mut retries = 0u32;
        loop {
            self.ensure_running()?;
            let proxy = self.acquire_proxy().await?;

            let (outcome, captcha) = match self.attempt(target, template, proxy.as_ref()).await {
                Attempt::Sent { outcome, captcha } => (outcome, captcha),
                Attempt::Rejected(message) => {
                    return Ok(LoginResult::fault(
                        LoginStatus::Error,
                        &target.url,
                        message,
                        started.elapsed().as_secs_f64(),
                    )
                    .with_detail("system_type", template.name.as_str())
                    .with_detail("target_index", target.index));
                }
            };

            if let Some(p) = &proxy {
                self.pool.report(p, outcome.fault.is_none()).await;
            }

            let verdict = classify(&outcome, template);
            if verdict.status.is_transport_fault() && retries < self.config.max_retries {
                retries += 1;
                warn!(
                    target_index = target.index,
                    retry = retries,
                    status = %verdict.status,
                    reason = %verdict.message,
                    "retrying after transport fault"
                );
                tokio::time::sleep(retry_spacing).await;
                continue;
            }

            return Ok(build_result(
                target,
                template,
                &outcome,
                verdict,
                BuildContext {
                    elapsed: started.elapsed(),
                    retries,
                    proxy: proxy.as_ref(),
                    captcha: captcha.as_ref(),
                },
            ));
        }
    }

    async fn acquire_proxy(&self) -> Result<Option<ProxyInfo>> {
        let mut waits = 0u32;
        loop {
            match self.pool.acquire().await {
                Ok(proxy) => return Ok(proxy),
                Err(e)
                    if self.config.on_exhausted == ExhaustionPolicy::Wait
                        && waits < self.config.max_retries =>
                {
                    waits += 1;
                    let wait = self
                        .pool
                        .next_available_in()
                        .await
                        .unwrap_or(self.config.retry_backoff);
                    info!(
                        wait_ms = wait.as_millis() as u64,
                        reason = %e,
                        "all proxies cooling down, waiting"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn attempt(
        &self,
        target: &Target,
        template: &RequestTemplate,
        proxy: Option<&ProxyInfo>,
    ) -> Attempt {
        let mut request = match LoginRequest::build(template, target) {
            Ok(r) => r,
            Err(e) => return Attempt::Rejected(e.to_string()),
        };

        let mut recognition = None;
        if let Some(spec) = &template.captcha {
            let Some(solver) = self.solver.clone() else {
                return Attempt::Rejected("captcha required but no solver is configured".into());
            };
            let image_url = match crate::request::resolve_against(
                request.endpoint(),
                &spec.image_path,
                &target.url,
            ) {
                Ok(u) => u.to_string(),
                Err(e) => return Attempt::Rejected(e.to_string()),
            };

            let fetch_started = Instant::now();
            let image = match self
                .transport
                .fetch_captcha(&image_url, proxy, self.config.timeout)
                .await
            {
                Ok(image) => image,
                // Server reached: final, and not a proxy fault
                Err(fault) if fault.kind == FaultKind::Status => {
                    return Attempt::Rejected(fault.message);
                }
                Err(fault) => {
                    return Attempt::Sent {
                        outcome: AttemptOutcome::faulted(
                            request.url().to_string(),
                            fault,
                            fetch_started.elapsed(),
                        ),
                        captcha: None,
                    };
                }
            };

            let cookie = image.cookie_header();
            let solved = tokio::task::spawn_blocking(move || solver.recognize(&image.bytes)).await;
            let found = match solved {
                Ok(Some(found)) => found,
                Ok(None) => return Attempt::Rejected("captcha not recognized".into()),
                Err(e) => return Attempt::Rejected(format!("captcha solver failed: {e}")),
            };
            if found.confidence < spec.min_confidence {
                debug!(
                    target_index = target.index,
                    confidence = found.confidence,
                    "low-confidence captcha recognition"
                );
            }
            request.set_field(spec.field.clone(), found.text.clone());
            if let Some(cookie) = cookie {
                request.set_header("cookie", cookie);
            }
            recognition = Some(found);
        }

        let outcome = self
            .transport
            .send(&request, proxy, self.config.timeout)
            .await;
        Attempt::Sent {
            outcome,
            captcha: recognition,
        }
    }

    /// Verify `targets` under the batch options.
    ///
    /// Results are aligned with `targets`. On cancellation the report holds
    /// whatever completed, with `cancelled` set. A resource fault stops
    /// dispatch, waits for in-flight attempts, then returns the fault.
    pub async fn verify_batch(
        &self,
        targets: &[Target],
        options: &BatchOptions,
        hooks: &BatchHooks,
    ) -> Result<BatchReport> {
        self.ensure_running()?;
        let total = targets.len();
        let max_concurrent = options.max_concurrent.max(1);
        info!(
            targets = total,
            max_concurrent,
            delay_ms = options.delay.as_millis() as u64,
            "batch started"
        );

        // Retries honour the batch pacing
        let retry_spacing = self.config.retry_backoff.max(options.delay);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut tasks: JoinSet<(usize, Result<LoginResult>)> = JoinSet::new();
        let mut collector = Collector::new(total);
        let mut next_dispatch: Option<tokio::time::Instant> = None;
        let mut next = 0usize;
        let mut cancelled = false;

        loop {
            let can_dispatch = next < total && collector.fault.is_none() && !cancelled;
            if !can_dispatch && tasks.is_empty() {
                break;
            }

            let deadline = next_dispatch;
            let permits = semaphore.clone();
            tokio::select! {
                biased;

                _ = hooks.cancel.cancelled(), if can_dispatch => {
                    cancelled = true;
                    info!(dispatched = next, total, "batch cancelled, draining in-flight attempts");
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok((position, result)) => {
                            collector.accept(position, result, targets, hooks).await;
                        }
                        Err(e) => {
                            error!(error = %e, "attempt task failed");
                            collector.fail(Error::Internal(format!("attempt task failed: {e}")));
                        }
                    }
                }

                permit = async move {
                    if let Some(at) = deadline {
                        tokio::time::sleep_until(at).await;
                    }
                    permits.acquire_owned().await
                }, if can_dispatch => {
                    let permit = permit
                        .map_err(|_| Error::Internal("attempt semaphore closed".into()))?;
                    if let Err(e) = self.ensure_running() {
                        collector.fail(e);
                        continue;
                    }

                    next_dispatch = Some(tokio::time::Instant::now() + options.delay);
                    let position = next;
                    next += 1;

                    let engine = self.clone();
                    let target = targets[position].clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let _in_flight = InFlight::enter();
                        let result = match AssertUnwindSafe(engine.verify_spaced(&target, retry_spacing))
                            .catch_unwind()
                            .await
                        {
                            Ok(result) => result,
                            Err(panic) => Ok(engine.panicked(&target, panic_message(&*panic))),
                        };
                        (position, result)
                    });
                }
            }
        }

        let done = collector.done;
        if let Some(fault) = collector.fault {
            warn!(done, total, error = %fault, "batch aborted");
            return Err(fault);
        }
        info!(done, total, cancelled, "batch finished");
        Ok(BatchReport {
            results: collector.results,
            cancelled,
        })
    }

    fn panicked(&self, target: &Target, message: String) -> LoginResult {
        error!(target_index = target.index, panic = %message, "attempt panicked");
        let result = LoginResult::fault(
            LoginStatus::Error,
            &target.url,
            format!("internal error: {message}"),
            0.0,
        )
        .with_detail("target_index", target.index);
        self.stats.record(&result);
        record_attempt(result.status, result.response_time);
        result
    }
}

/// Gathers completions for `verify_batch`.
struct Collector {
    results: Vec<Option<LoginResult>>,
    done: usize,
    fault: Option<Error>,
}

impl Collector {
    fn new(total: usize) -> Self {
        Self {
            results: vec![None; total],
            done: 0,
            fault: None,
        }
    }

    fn fail(&mut self, error: Error) {
        if self.fault.is_none() {
            self.fault = Some(error);
        }
    }

    async fn accept(
        &mut self,
        position: usize,
        result: Result<LoginResult>,
        targets: &[Target],
        hooks: &BatchHooks,
    ) {
        let result = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(position, error = %e, "attempt aborted");
                self.fail(e);
                return;
            }
        };

        if let Some(log) = &hooks.on_log {
            log(&targets[position], &result);
        }
        if let Some(sink) = &hooks.sink
            && let Err(e) = sink.record(position, &result).await
        {
            error!(position, error = %e, "result sink failed");
            self.fail(e);
        }

        self.results[position] = Some(result);
        self.done += 1;
        if let Some(progress) = &hooks.on_progress {
            progress(self.done, self.results.len());
        }
    }
}

struct BuildContext<'a> {
    elapsed: Duration,
    retries: u32,
    proxy: Option<&'a ProxyInfo>,
    captcha: Option<&'a Recognition>,
}

fn build_result(
    target: &Target,
    template: &RequestTemplate,
    outcome: &AttemptOutcome,
    verdict: Verdict,
    ctx: BuildContext<'_>,
) -> LoginResult {
    let mut result = LoginResult {
        status: verdict.status,
        success: verdict.success,
        message: verdict.message,
        response_time: ctx.elapsed.as_secs_f64(),
        url: target.url.clone(),
        final_url: outcome.final_url.clone(),
        page_changed: verdict.page_changed,
        details: Default::default(),
        timestamp: Utc::now(),
    }
    .with_detail("system_type", template.name.as_str())
    .with_detail("target_index", target.index)
    .with_detail("request_url", outcome.request_url.as_str())
    .with_detail("attempts", ctx.retries + 1)
    .with_detail(
        "proxy",
        ctx.proxy
            .map(ProxyInfo::endpoint)
            .unwrap_or_else(|| "direct".into()),
    );

    if let Some(code) = outcome.status {
        result = result
            .with_detail("status_code", code)
            .with_detail("content_length", outcome.body.len());
    }
    if let Some(indicator) = &verdict.matched {
        result = result.with_detail("matched_indicator", indicator.to_string());
    }
    if let (Some(found), Some(spec)) = (ctx.captcha, &template.captcha) {
        result = result
            .with_detail("captcha_confidence", f64::from(found.confidence))
            .with_detail("captcha_low_confidence", found.confidence < spec.min_confidence);
    }
    result
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::CaptchaImage;
    use crate::outcome::{FaultKind, TransportFault};
    use crate::transport::TransportFuture;
    use profile::{CaptchaSpec, Indicator};
    use proxy_pool::PoolConfig;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    type Script = dyn Fn(usize, &LoginRequest) -> AttemptOutcome + Send + Sync;

    /// Transport that answers from a script after a fixed latency.
    struct MockTransport {
        script: Box<Script>,
        latency: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        sent_at: Mutex<Vec<tokio::time::Instant>>,
        shutdowns: AtomicUsize,
    }

    impl MockTransport {
        fn new(
            latency: Duration,
            script: impl Fn(usize, &LoginRequest) -> AttemptOutcome + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                latency,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                sent_at: Mutex::new(Vec::new()),
                shutdowns: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockTransport {
        fn send<'a>(
            &'a self,
            request: &'a LoginRequest,
            _proxy: Option<&'a ProxyInfo>,
            _timeout: Duration,
        ) -> TransportFuture<'a, AttemptOutcome> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                self.sent_at
                    .lock()
                    .unwrap()
                    .push(tokio::time::Instant::now());
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.latency).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                (self.script)(call, request)
            })
        }

        fn fetch_captcha<'a>(
            &'a self,
            _url: &'a str,
            _proxy: Option<&'a ProxyInfo>,
            _timeout: Duration,
        ) -> TransportFuture<'a, std::result::Result<CaptchaImage, TransportFault>> {
            Box::pin(async {
                Ok(CaptchaImage {
                    bytes: b"png".to_vec(),
                    cookies: vec!["sid=42".into()],
                })
            })
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn template() -> RequestTemplate {
        RequestTemplate {
            name: "test-portal".into(),
            success_indicators: vec![Indicator::BodyContains("Welcome".into())],
            failure_indicators: vec![Indicator::BodyContains("Invalid".into())],
            ..RequestTemplate::default()
        }
    }

    fn answer(request: &LoginRequest, body: &str) -> AttemptOutcome {
        let url = request.url().to_string();
        AttemptOutcome::response(url.clone(), 200, url, body, Duration::from_millis(5))
    }

    /// "right" logs in, "wrong" is rejected, anything else is unrecognizable.
    fn by_password(_call: usize, request: &LoginRequest) -> AttemptOutcome {
        match request.fields.get("password").map(String::as_str) {
            Some("right") => answer(request, "Welcome admin"),
            Some("wrong") => answer(request, "Invalid credentials"),
            _ => answer(request, "<html>hello</html>"),
        }
    }

    fn refused(request: &LoginRequest) -> AttemptOutcome {
        AttemptOutcome::faulted(
            request.url().to_string(),
            TransportFault::new(FaultKind::Connect, "connection refused"),
            Duration::from_millis(1),
        )
    }

    fn engine_with(transport: Arc<MockTransport>, config: EngineConfig, pool: ProxyPool) -> Engine {
        Engine::new(config, Arc::new(template()), Arc::new(pool), transport)
    }

    fn engine(transport: Arc<MockTransport>) -> Engine {
        engine_with(
            transport,
            EngineConfig::default(),
            ProxyPool::new(PoolConfig::default()),
        )
    }

    fn targets(passwords: &[&str]) -> Vec<Target> {
        passwords
            .iter()
            .enumerate()
            .map(|(i, pw)| Target::new(i, "http://10.0.0.1/login", "admin", *pw))
            .collect()
    }

    fn options(max_concurrent: usize, delay_ms: u64) -> BatchOptions {
        BatchOptions {
            max_concurrent,
            delay: Duration::from_millis(delay_ms),
            checkpoint_every: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_respects_concurrency_and_dispatch_spacing() {
        let transport = MockTransport::new(Duration::from_secs(1), by_password);
        let engine = engine(transport.clone());
        let batch = targets(&["right", "wrong", "right", "wrong", "right", "wrong"]);

        let report = engine
            .verify_batch(&batch, &options(2, 100), &BatchHooks::default())
            .await
            .unwrap();

        assert!(!report.cancelled);
        assert_eq!(report.completed(), 6);
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 2);

        let sent = transport.sent_at.lock().unwrap().clone();
        for pair in sent.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::from_millis(100),
                "dispatches {:?} apart",
                pair[1] - pair[0]
            );
        }

        // Aligned with the input regardless of completion order
        for (i, slot) in report.results.iter().enumerate() {
            let result = slot.as_ref().unwrap();
            assert_eq!(result.details["target_index"], i);
            let expected = if i % 2 == 0 {
                LoginStatus::Success
            } else {
                LoginStatus::Failed
            };
            assert_eq!(result.status, expected);
        }

        let stats = engine.stats();
        assert_eq!(stats.total, 6);
        assert_eq!(stats.success, 3);
        assert_eq!(stats.failed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_faults_are_retried_until_an_answer() {
        let transport = MockTransport::new(Duration::ZERO, |call, request| {
            if call < 2 {
                refused(request)
            } else {
                answer(request, "Welcome admin")
            }
        });
        let engine = engine(transport.clone());

        let result = engine
            .verify_one(&Target::new(0, "http://10.0.0.1/login", "admin", "right"))
            .await
            .unwrap();

        assert_eq!(result.status, LoginStatus::Success);
        assert!(result.success);
        assert_eq!(result.details["attempts"], 3);
        assert_eq!(result.details["proxy"], "direct");
        assert_eq!(result.details["system_type"], "test-portal");
        assert_eq!(transport.calls(), 3);
        // Only the final answer is counted
        assert_eq!(engine.stats().total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_retries_wait_at_least_the_dispatch_delay() {
        let transport = MockTransport::new(Duration::ZERO, |call, request| {
            if call < 2 {
                refused(request)
            } else {
                answer(request, "Welcome admin")
            }
        });
        let engine = engine(transport.clone());

        let report = engine
            .verify_batch(&targets(&["right"]), &options(1, 2_000), &BatchHooks::default())
            .await
            .unwrap();
        assert_eq!(report.results[0].as_ref().unwrap().status, LoginStatus::Success);

        let sent = transport.sent_at.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        for pair in sent.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(2), "retried after {:?}", pair[1] - pair[0]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_keep_the_last_fault() {
        let transport = MockTransport::new(Duration::ZERO, |_, request| {
            AttemptOutcome::faulted(
                request.url().to_string(),
                TransportFault::new(FaultKind::Timeout, "timed out"),
                Duration::from_secs(10),
            )
        });
        let config = EngineConfig {
            max_retries: 1,
            ..EngineConfig::default()
        };
        let engine = engine_with(
            transport.clone(),
            config,
            ProxyPool::new(PoolConfig::default()),
        );

        let result = engine
            .verify_one(&Target::new(0, "http://10.0.0.1/login", "admin", "x"))
            .await
            .unwrap();
        assert_eq!(result.status, LoginStatus::Timeout);
        assert!(!result.success);
        assert_eq!(transport.calls(), 2);
        assert_eq!(engine.stats().timeout, 1);
        assert_eq!(engine.stats().error, 0);
    }

    #[tokio::test]
    async fn application_answers_are_never_retried() {
        let transport = MockTransport::new(Duration::ZERO, by_password);
        let engine = engine(transport.clone());

        let failed = engine.verify_one(&targets(&["wrong"])[0]).await.unwrap();
        assert_eq!(failed.status, LoginStatus::Failed);
        let ambiguous = engine.verify_one(&targets(&["maybe"])[0]).await.unwrap();
        assert_eq!(ambiguous.status, LoginStatus::Ambiguous);
        assert!(!ambiguous.success);

        assert_eq!(transport.calls(), 2);
        assert_eq!(engine.stats().ambiguous, 1);
    }

    #[tokio::test]
    async fn invalid_target_fails_without_network() {
        let transport = MockTransport::new(Duration::ZERO, by_password);
        let engine = engine(transport.clone());

        let result = engine
            .verify_one(&Target::new(3, "http://10.0.0.1/login", "admin", ""))
            .await
            .unwrap();
        assert_eq!(result.status, LoginStatus::Error);

        let bad_url = engine
            .verify_one(&Target::new(4, "ftp://10.0.0.1/", "admin", "pw"))
            .await
            .unwrap();
        assert_eq!(bad_url.status, LoginStatus::Error);
        assert!(bad_url.message.contains("unsupported scheme"), "got {}", bad_url.message);

        assert_eq!(transport.calls(), 0);
        assert_eq!(engine.stats().error, 2);
    }

    #[tokio::test]
    async fn stopped_engine_refuses_work_until_restarted() {
        let transport = MockTransport::new(Duration::ZERO, by_password);
        let engine = engine(transport.clone());

        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(transport.shutdowns.load(Ordering::SeqCst), 1);

        let target = &targets(&["right"])[0];
        assert!(matches!(
            engine.verify_one(target).await,
            Err(Error::EngineClosed)
        ));
        assert!(matches!(
            engine
                .verify_batch(&targets(&["right"]), &options(1, 0), &BatchHooks::default())
                .await,
            Err(Error::EngineClosed)
        ));

        engine.start();
        assert_eq!(
            engine.verify_one(target).await.unwrap().status,
            LoginStatus::Success
        );
    }

    #[tokio::test]
    async fn reset_stats_zeroes_counters() {
        let engine = engine(MockTransport::new(Duration::ZERO, by_password));
        engine.verify_one(&targets(&["right"])[0]).await.unwrap();
        assert_eq!(engine.stats().success, 1);
        engine.reset_stats();
        assert_eq!(engine.stats(), ScanStats::default());
    }

    async fn single_proxy_pool(failure_threshold: u32) -> ProxyPool {
        let pool = ProxyPool::new(PoolConfig {
            failure_threshold,
            ..PoolConfig::default()
        });
        pool.add("http://10.9.9.9:3128".parse().unwrap())
            .await
            .unwrap();
        pool
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_aborts_the_batch() {
        let transport = MockTransport::new(Duration::ZERO, |_, request| refused(request));
        let config = EngineConfig {
            max_retries: 0,
            ..EngineConfig::default()
        };
        let engine = engine_with(transport.clone(), config, single_proxy_pool(1).await);

        let outcome = engine
            .verify_batch(
                &targets(&["a", "b", "c"]),
                &options(1, 0),
                &BatchHooks::default(),
            )
            .await;

        assert!(
            matches!(outcome, Err(Error::NoProxyAvailable(_))),
            "got {outcome:?}"
        );
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_policy_sleeps_through_the_cooldown() {
        let transport = MockTransport::new(Duration::ZERO, |call, request| {
            if call == 0 {
                refused(request)
            } else {
                answer(request, "Welcome admin")
            }
        });
        let config = EngineConfig {
            max_retries: 1,
            on_exhausted: ExhaustionPolicy::Wait,
            ..EngineConfig::default()
        };
        let engine = engine_with(transport.clone(), config, single_proxy_pool(1).await);

        let started = tokio::time::Instant::now();
        let result = engine.verify_one(&targets(&["right"])[0]).await.unwrap();

        assert_eq!(result.status, LoginStatus::Success);
        assert_eq!(result.details["proxy"], "http://10.9.9.9:3128");
        assert!(started.elapsed() >= Duration::from_secs(30));

        let health = &engine.pool().snapshot().await[0].health;
        assert_eq!(health.total_failures, 1);
        assert_eq!(health.total_successes, 1);
    }

    #[tokio::test]
    async fn panicking_attempt_becomes_an_error_result() {
        let transport = MockTransport::new(Duration::ZERO, |call, request| {
            if request.fields.get("password").map(String::as_str) == Some("boom") {
                panic!("scripted failure on call {call}");
            }
            by_password(call, request)
        });
        let engine = engine(transport);

        let report = engine
            .verify_batch(
                &targets(&["boom", "right"]),
                &options(2, 0),
                &BatchHooks::default(),
            )
            .await
            .unwrap();

        let crashed = report.results[0].as_ref().unwrap();
        assert_eq!(crashed.status, LoginStatus::Error);
        assert!(crashed.message.contains("scripted failure"), "got {}", crashed.message);
        assert_eq!(
            report.results[1].as_ref().unwrap().status,
            LoginStatus::Success
        );
        assert_eq!(engine.stats().total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_dispatch_and_keeps_completed_results() {
        let transport = MockTransport::new(Duration::from_millis(10), by_password);
        let engine = engine(transport.clone());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let hooks = BatchHooks {
            on_progress: Some(Arc::new(move |_: usize, _: usize| trigger.cancel())),
            cancel,
            ..BatchHooks::default()
        };

        let report = engine
            .verify_batch(
                &targets(&["right", "wrong", "right", "wrong"]),
                &options(1, 1000),
                &hooks,
            )
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.completed(), 1);
        assert!(report.results[0].is_some());
        assert!(report.results[1..].iter().all(Option::is_none));
        assert_eq!(transport.calls(), 1);
    }

    struct RecordingSink {
        seen: Mutex<Vec<usize>>,
        fail_at: Option<usize>,
    }

    impl ResultSink for RecordingSink {
        fn record<'a>(
            &'a self,
            position: usize,
            _result: &'a LoginResult,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async move {
                if self.fail_at == Some(position) {
                    return Err(Error::Sink("disk full".into()));
                }
                self.seen.lock().unwrap().push(position);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn hooks_see_every_completion() {
        let engine = engine(MockTransport::new(Duration::ZERO, by_password));
        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
            fail_at: None,
        });
        let progress: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let logged = Arc::new(AtomicUsize::new(0));

        let progress_hook = progress.clone();
        let log_hook = logged.clone();
        let hooks = BatchHooks {
            on_progress: Some(Arc::new(move |done: usize, total: usize| {
                progress_hook.lock().unwrap().push((done, total))
            })),
            on_log: Some(Arc::new(move |_: &Target, _: &LoginResult| {
                log_hook.fetch_add(1, Ordering::SeqCst);
            })),
            sink: Some(sink.clone()),
            ..BatchHooks::default()
        };

        engine
            .verify_batch(&targets(&["right", "wrong", "x"]), &options(3, 0), &hooks)
            .await
            .unwrap();

        let mut seen = sink.seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(*progress.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(logged.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sink_failure_aborts_the_batch() {
        let engine = engine(MockTransport::new(Duration::ZERO, by_password));
        let hooks = BatchHooks {
            sink: Some(Arc::new(RecordingSink {
                seen: Mutex::new(Vec::new()),
                fail_at: Some(0),
            })),
            ..BatchHooks::default()
        };

        let outcome = engine
            .verify_batch(&targets(&["right", "wrong", "x"]), &options(1, 0), &hooks)
            .await;
        assert!(matches!(outcome, Err(Error::Sink(_))), "got {outcome:?}");
    }

    #[tokio::test]
    async fn empty_batch_completes_immediately() {
        let engine = engine(MockTransport::new(Duration::ZERO, by_password));
        let report = engine
            .verify_batch(&[], &options(5, 500), &BatchHooks::default())
            .await
            .unwrap();
        assert!(report.results.is_empty());
        assert!(!report.cancelled);
    }

    struct FixedSolver(f32);

    impl CaptchaSolver for FixedSolver {
        fn recognize(&self, image: &[u8]) -> Option<Recognition> {
            (image == b"png").then(|| Recognition {
                text: "4821".into(),
                confidence: self.0,
            })
        }
    }

    fn captcha_engine(transport: Arc<MockTransport>) -> Engine {
        let template = RequestTemplate {
            captcha: Some(CaptchaSpec {
                image_path: "/captcha.png".into(),
                field: "verify_code".into(),
                min_confidence: 0.6,
            }),
            ..template()
        };
        Engine::new(
            EngineConfig::default(),
            Arc::new(template),
            Arc::new(ProxyPool::new(PoolConfig::default())),
            transport,
        )
    }

    #[tokio::test]
    async fn captcha_answer_and_cookie_ride_along() {
        let transport = MockTransport::new(Duration::ZERO, |call, request| {
            assert_eq!(request.fields["verify_code"], "4821");
            assert_eq!(request.headers["cookie"], "sid=42");
            by_password(call, request)
        });
        let engine = captcha_engine(transport).with_captcha_solver(Arc::new(FixedSolver(0.4)));

        let result = engine.verify_one(&targets(&["right"])[0]).await.unwrap();
        assert_eq!(result.status, LoginStatus::Success);
        assert_eq!(result.details["captcha_low_confidence"], true);
    }

    #[tokio::test]
    async fn captcha_without_solver_is_an_error() {
        let transport = MockTransport::new(Duration::ZERO, by_password);
        let engine = captcha_engine(transport.clone());

        let result = engine.verify_one(&targets(&["right"])[0]).await.unwrap();
        assert_eq!(result.status, LoginStatus::Error);
        assert!(result.message.contains("no solver"));
        assert_eq!(transport.calls(), 0);
    }

    /// Serves logins, but the captcha endpoint answers 404.
    #[derive(Default)]
    struct MissingCaptcha {
        fetches: AtomicUsize,
        sends: AtomicUsize,
    }

    impl Transport for MissingCaptcha {
        fn send<'a>(
            &'a self,
            request: &'a LoginRequest,
            _proxy: Option<&'a ProxyInfo>,
            _timeout: Duration,
        ) -> TransportFuture<'a, AttemptOutcome> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { by_password(0, request) })
        }

        fn fetch_captcha<'a>(
            &'a self,
            _url: &'a str,
            _proxy: Option<&'a ProxyInfo>,
            _timeout: Duration,
        ) -> TransportFuture<'a, std::result::Result<CaptchaImage, TransportFault>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Err(TransportFault::new(
                    FaultKind::Status,
                    "captcha fetch returned HTTP 404",
                ))
            })
        }
    }

    #[tokio::test]
    async fn captcha_http_error_is_final_and_spares_the_proxy() {
        let transport = Arc::new(MissingCaptcha::default());
        let template = RequestTemplate {
            captcha: Some(CaptchaSpec {
                image_path: "/captcha.jpg".into(),
                field: "verify_code".into(),
                min_confidence: 0.6,
            }),
            ..template()
        };
        let engine = Engine::new(
            EngineConfig::default(),
            Arc::new(template),
            Arc::new(single_proxy_pool(1).await),
            transport.clone(),
        )
        .with_captcha_solver(Arc::new(FixedSolver(0.9)));

        let result = engine.verify_one(&targets(&["right"])[0]).await.unwrap();
        assert_eq!(result.status, LoginStatus::Error);
        assert!(result.message.contains("404"), "got {}", result.message);
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(transport.sends.load(Ordering::SeqCst), 0);

        // A threshold-1 pool would have tripped on a reported failure
        let snapshot = engine.pool().snapshot().await;
        assert_eq!(snapshot[0].health.consecutive_failures, 0);
        assert!(engine.pool().acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn verifies_against_a_live_server() {
        use axum::Router;
        use axum::routing::post;

        let app = Router::new().route(
            "/login",
            post(|body: String| async move {
                if body.contains(r#""password":"right""#) {
                    "<h1>Welcome admin</h1>"
                } else {
                    "Invalid username or password"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let engine = Engine::new(
            EngineConfig::default(),
            Arc::new(template()),
            Arc::new(ProxyPool::new(PoolConfig::default())),
            Arc::new(crate::transport::HttpTransport::new(Default::default())),
        );
        let batch: Vec<Target> = ["right", "wrong"]
            .iter()
            .enumerate()
            .map(|(i, pw)| Target::new(i, format!("http://{addr}"), "admin", *pw))
            .collect();

        let report = engine
            .verify_batch(&batch, &options(2, 10), &BatchHooks::default())
            .await
            .unwrap();

        let ok = report.results[0].as_ref().unwrap();
        assert_eq!(ok.status, LoginStatus::Success);
        assert_eq!(ok.details["status_code"], 200);
        assert_eq!(ok.details["request_url"], format!("http://{addr}/login"));
        let rejected = report.results[1].as_ref().unwrap();
        assert_eq!(rejected.status, LoginStatus::Failed);
        assert!(!rejected.success);
    }
}
