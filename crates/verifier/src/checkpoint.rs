//! Session checkpointing
//!
//! `SessionSink` folds batch results into a `ScanSession` as they complete
//! and writes a checkpoint every `every` results. `Engine::run_session`
//! drives the remaining targets of a session through it and always writes a
//! final checkpoint, so an interrupted run resumes where it stopped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{LoginResult, Target};
use scan_session::{ScanSession, SessionStore};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::engine::{BatchHooks, BatchOptions, BatchReport, Engine, ResultSink};
use crate::error::{Error, Result};

/// Result sink that records into a shared session.
pub struct SessionSink {
    session: Arc<Mutex<ScanSession>>,
    store: Arc<SessionStore>,
    /// Batch position → session position
    positions: Vec<usize>,
    every: usize,
    since_checkpoint: AtomicUsize,
}

impl SessionSink {
    /// `positions[i]` is the session position of the batch's `i`-th target.
    /// `every == 0` disables periodic checkpoints.
    pub fn new(
        session: Arc<Mutex<ScanSession>>,
        store: Arc<SessionStore>,
        positions: Vec<usize>,
        every: usize,
    ) -> Self {
        Self {
            session,
            store,
            positions,
            every,
            since_checkpoint: AtomicUsize::new(0),
        }
    }

    /// Write the session as it stands now.
    pub async fn checkpoint(&self) -> Result<()> {
        // Clone out so the lock is not held across disk I/O
        let snapshot = self.session.lock().await.clone();
        self.store.save_session(&snapshot).await?;
        self.since_checkpoint.store(0, Ordering::SeqCst);
        Ok(())
    }
}

impl ResultSink for SessionSink {
    fn record<'a>(
        &'a self,
        position: usize,
        result: &'a LoginResult,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let slot = *self.positions.get(position).ok_or_else(|| {
                Error::Internal(format!("batch position {position} has no session slot"))
            })?;

            let due = {
                let mut session = self.session.lock().await;
                session.add_result(slot, result.clone())?;
                let pending = self.since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
                self.every > 0 && pending >= self.every
            };
            if due {
                self.checkpoint().await?;
            }
            Ok(())
        })
    }
}

impl Engine {
    /// Verify every target of `session` that has no result yet.
    ///
    /// Results land in the session as they complete. Progress callbacks see
    /// session-wide counts, so a resumed run continues from where it stopped.
    /// Any sink in `hooks` is replaced by the session sink. The session is
    /// saved once more before returning, whether the batch finished, was
    /// cancelled or failed. If that save fails the error is
    /// `Error::FinalCheckpoint`, carrying the batch fault when there was one.
    pub async fn run_session(
        &self,
        session: Arc<Mutex<ScanSession>>,
        store: Arc<SessionStore>,
        options: &BatchOptions,
        hooks: &BatchHooks,
    ) -> Result<BatchReport> {
        let (session_id, already_done, total, remaining) = {
            let s = session.lock().await;
            let (done, total) = s.progress();
            (s.session_id.clone(), done, total, s.remaining())
        };
        let (positions, targets): (Vec<usize>, Vec<Target>) = remaining.into_iter().unzip();
        info!(
            session_id = %session_id,
            done = already_done,
            total,
            remaining = targets.len(),
            "running session"
        );

        let sink = Arc::new(SessionSink::new(
            session.clone(),
            store,
            positions,
            options.checkpoint_every,
        ));
        let mut hooks = hooks.clone();
        hooks.sink = Some(sink.clone());
        if let Some(progress) = hooks.on_progress.take() {
            hooks.on_progress = Some(Arc::new(move |done: usize, _batch_total: usize| {
                progress(already_done + done, total)
            }));
        }

        let outcome = self.verify_batch(&targets, options, &hooks).await;
        let saved = sink.checkpoint().await;
        match &saved {
            Ok(()) => debug!(session_id = %session_id, "final checkpoint written"),
            Err(e) => error!(session_id = %session_id, error = %e, "final checkpoint failed"),
        }

        match (outcome, saved) {
            (Ok(report), Ok(())) => Ok(report),
            (Err(batch), Ok(())) => Err(batch),
            (outcome, Err(save)) => Err(Error::FinalCheckpoint {
                save: Box::new(save),
                batch: outcome.err().map(Box::new),
            }),
        }
    }
}
