//! Weak-credential scanner
//!
//! Single-binary CLI that:
//! 1. Loads the system catalog, proxy list and scan policy from TOML
//! 2. Creates a session from a JSON target list, or resumes a stored one
//! 3. Verifies the remaining targets through the proxy pool, checkpointing
//!    as results arrive
//! 4. Lists stored sessions and exports their results as CSV or JSON
//!
//! SIGINT/SIGTERM stop dispatch; in-flight attempts finish and the session is
//! saved, so `--resume` picks up where the run stopped.

mod config;
mod error;
mod metrics;
mod status;

use anyhow::{Context, Result};
use common::{LoginResult, Target, mask};
use proxy_pool::ProxyPool;
use scan_session::{ExportFormat, ScanSession, SessionStore, SessionSummary, export_results};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use verifier::{BatchHooks, Engine, HttpTransport};

use crate::config::Config;
use crate::error::Error;
use crate::status::{AppState, Progress};

const USAGE: &str = "\
usage: weakpass-scan [--config PATH] COMMAND

commands:
  --targets FILE                       start a new scan from a JSON target list
  --resume SESSION_ID                  continue an interrupted scan
  --list                               list stored sessions
  --export SESSION_ID --output PATH [--format csv|json]
                                       write a session's results";

/// What the binary was asked to do.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Scan {
        targets: PathBuf,
    },
    Resume {
        session_id: String,
    },
    List,
    Export {
        session_id: String,
        format: ExportFormat,
        output: PathBuf,
    },
    Help,
}

#[derive(Debug, PartialEq, Eq)]
struct Invocation {
    command: Command,
    config: Option<String>,
}

fn flag_value(
    args: &mut std::slice::Iter<'_, String>,
    flag: &'static str,
) -> error::Result<String> {
    args.next()
        .filter(|v| !v.starts_with("--"))
        .cloned()
        .ok_or(Error::MissingValue(flag))
}

fn parse_args(args: &[String]) -> error::Result<Invocation> {
    let mut targets = None;
    let mut resume = None;
    let mut list = false;
    let mut export = None;
    let mut format = None;
    let mut output = None;
    let mut config = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--targets" => targets = Some(PathBuf::from(flag_value(&mut iter, "--targets")?)),
            "--resume" => resume = Some(flag_value(&mut iter, "--resume")?),
            "--list" => list = true,
            "--export" => export = Some(flag_value(&mut iter, "--export")?),
            "--format" => {
                let value = flag_value(&mut iter, "--format")?;
                format = Some(
                    value
                        .parse::<ExportFormat>()
                        .map_err(|_| Error::InvalidFormat(value))?,
                );
            }
            "--output" => output = Some(PathBuf::from(flag_value(&mut iter, "--output")?)),
            "--config" => config = Some(flag_value(&mut iter, "--config")?),
            "-h" | "--help" => {
                return Ok(Invocation {
                    command: Command::Help,
                    config,
                });
            }
            other => return Err(Error::UnknownArgument(other.to_string())),
        }
    }

    let chosen: Vec<&'static str> = [
        targets.is_some().then_some("--targets"),
        resume.is_some().then_some("--resume"),
        list.then_some("--list"),
        export.is_some().then_some("--export"),
    ]
    .into_iter()
    .flatten()
    .collect();
    if let [first, second, ..] = chosen.as_slice() {
        return Err(Error::Conflict(*first, *second));
    }

    let command = if let Some(targets) = targets {
        Command::Scan { targets }
    } else if let Some(session_id) = resume {
        Command::Resume { session_id }
    } else if list {
        Command::List
    } else if let Some(session_id) = export {
        Command::Export {
            session_id,
            format: format.unwrap_or(ExportFormat::Csv),
            output: output.ok_or(Error::MissingOutput)?,
        }
    } else {
        return Err(Error::NoCommand);
    };
    Ok(Invocation { command, config })
}

/// Read a JSON array of targets, tagging each with the file it came from.
fn load_targets(path: &Path) -> common::Result<Vec<Target>> {
    let contents = std::fs::read_to_string(path)?;
    let mut targets: Vec<Target> = serde_json::from_str(&contents)?;
    let source = path.display().to_string();
    for target in &mut targets {
        if target.source_file.is_none() {
            target.source_file = Some(source.clone());
        }
    }
    Ok(targets)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = parse_args(&args).with_context(|| format!("invalid arguments\n\n{USAGE}"))?;
    if invocation.command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let config_path = Config::resolve_path(invocation.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        systems = config.systems.len(),
        max_concurrent = config.scan.max_concurrent,
        proxy_enabled = config.proxy.enabled,
        session_dir = %config.session.dir.display(),
        "configuration loaded"
    );

    let store = Arc::new(
        SessionStore::open(&config.session.dir)
            .await
            .with_context(|| format!("failed to open {}", config.session.dir.display()))?,
    );

    match invocation.command {
        Command::List => {
            for summary in store.list_sessions().await? {
                println!("{}", serde_json::to_string(&summary)?);
            }
            Ok(())
        }
        Command::Export {
            session_id,
            format,
            output,
        } => {
            let session = store
                .load_session(&session_id)
                .await?
                .with_context(|| format!("session {session_id} not found"))?;
            let rows = export_results(&session, &output, format)
                .await
                .with_context(|| format!("failed to export to {}", output.display()))?;
            println!("exported {rows} results to {}", output.display());
            Ok(())
        }
        Command::Scan { targets } => {
            if let Some(days) = config.session.retention_days {
                let removed = store
                    .cleanup_older_than(Duration::from_secs(days * 24 * 60 * 60))
                    .await?;
                if removed > 0 {
                    info!(removed, retention_days = days, "old sessions removed");
                }
            }
            let targets = load_targets(&targets)
                .with_context(|| format!("failed to read targets from {}", targets.display()))?;
            let session = store
                .create_session(targets, config.session_config())
                .await
                .context("failed to create session")?;
            run_scan(&config, store, session).await
        }
        Command::Resume { session_id } => {
            let session = store
                .load_session(&session_id)
                .await?
                .with_context(|| format!("session {session_id} not found"))?;
            if session.is_completed() {
                info!(session_id = %session_id, "session already complete, nothing to resume");
                println!("{}", serde_json::to_string_pretty(&SessionSummary::from(&session))?);
                return Ok(());
            }
            run_scan(&config, store, session).await
        }
        Command::Help => Ok(()),
    }
}

/// Verify the remaining targets of `session` until done or interrupted.
async fn run_scan(config: &Config, store: Arc<SessionStore>, session: ScanSession) -> Result<()> {
    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    let session_config = session.config.clone();
    let proxies = config.load_proxies()?;
    let pool = Arc::new(
        ProxyPool::with_proxies(config.pool_config(), proxies)
            .await
            .context("invalid proxy list")?,
    );
    pool.set_enabled(session_config.use_proxy).await;

    let engine = Engine::new(
        config.engine_config(&session_config),
        Arc::new(config.catalog()?),
        pool.clone(),
        Arc::new(HttpTransport::new(config.transport_settings())),
    );

    let session_id = session.session_id.clone();
    let (done, total) = session.progress();
    let progress = Arc::new(Progress::new(session_id.clone(), done, total));
    metrics::record_progress(done, total);
    info!(session_id = %session_id, done, total, "scan starting");

    let server_stop = CancellationToken::new();
    let server = match config.status.listen_addr {
        Some(addr) => {
            let state = AppState {
                progress: progress.clone(),
                pool: pool.clone(),
                prometheus,
            };
            Some(spawn_status_server(addr, state, server_stop.clone()).await?)
        }
        None => None,
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let hooks = BatchHooks {
        on_progress: Some(Arc::new({
            let progress = progress.clone();
            move |done: usize, total: usize| {
                progress.update(done, total);
                metrics::record_progress(done, total);
                if done % 50 == 0 || done == total {
                    info!(done, total, "scan progress");
                }
            }
        })),
        on_log: Some(Arc::new(|target: &Target, result: &LoginResult| {
            if result.success {
                info!(
                    target_index = target.index,
                    url = %target.url,
                    username = %target.username,
                    password = %mask(&target.password),
                    "weak credential confirmed"
                );
            } else {
                debug!(
                    target_index = target.index,
                    status = %result.status,
                    message = %result.message,
                    "attempt completed"
                );
            }
        })),
        sink: None,
        cancel,
    };

    let shared = Arc::new(Mutex::new(session));
    let outcome = engine
        .run_session(
            shared.clone(),
            store,
            &config.batch_options(&session_config),
            &hooks,
        )
        .await;

    engine.stop();
    progress.finish();
    server_stop.cancel();
    if let Some(handle) = server {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "status server error during shutdown"),
            Err(e) => error!(error = %e, "status server task panicked"),
        }
    }

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            let context = failure_context(&session_id, &e);
            return Err(anyhow::Error::new(e).context(context));
        }
    };

    let summary = SessionSummary::from(&*shared.lock().await);
    info!(
        session_id = %session_id,
        done = summary.completed_targets,
        total = summary.total_targets,
        success = summary.stats.success,
        failed = summary.stats.failed,
        errors = summary.stats.error + summary.stats.timeout,
        cancelled = report.cancelled,
        "scan finished"
    );
    if report.cancelled {
        warn!(session_id = %session_id, "scan interrupted, continue with --resume {session_id}");
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Tell the operator whether completed results made it to disk.
fn failure_context(session_id: &str, e: &verifier::Error) -> String {
    match e {
        verifier::Error::FinalCheckpoint { .. } => format!(
            "scan {session_id} stopped; results since the last checkpoint were not saved"
        ),
        _ => format!("scan {session_id} aborted; completed results were checkpointed"),
    }
}

async fn spawn_status_server(
    addr: SocketAddr,
    state: AppState,
    stop: CancellationToken,
) -> Result<tokio::task::JoinHandle<std::io::Result<()>>> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status endpoint to {addr}"))?;
    info!(addr = %addr, "status endpoint listening");
    let app = status::build_router(state);
    Ok(tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
    }))
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, stopping dispatch"),
        _ = terminate => info!("received SIGTERM, stopping dispatch"),
    }
}
