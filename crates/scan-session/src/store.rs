//! Session files on disk
//!
//! One JSON file per session at `<dir>/<session_id>.json`. All writes use
//! atomic temp-file + rename, so a crash mid-checkpoint leaves the previous
//! checkpoint intact. Loading never repairs: a file that fails to parse or
//! violates the session invariants is reported as `CorruptSession`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use common::{ScanStats, Target};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::{ScanSession, SessionConfig};

/// Listing entry for one stored session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_targets: usize,
    pub completed_targets: usize,
    pub completion_rate: f64,
    pub stats: ScanStats,
}

impl From<&ScanSession> for SessionSummary {
    fn from(session: &ScanSession) -> Self {
        let (completed, total) = session.progress();
        Self {
            session_id: session.session_id.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            total_targets: total,
            completed_targets: completed,
            completion_rate: session.completion_rate(),
            stats: session.stats,
        }
    }
}

/// Directory of session files.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open (and create if needed) the session directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Io(format!("creating session directory: {e}")))?;
        debug!(dir = %dir.display(), "session store opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start a new session and write its first checkpoint.
    ///
    /// Target indices must be unique; they are kept as given.
    pub async fn create_session(
        &self,
        targets: Vec<Target>,
        config: SessionConfig,
    ) -> Result<ScanSession> {
        let mut seen = HashSet::with_capacity(targets.len());
        for target in &targets {
            if !seen.insert(target.index) {
                return Err(Error::DuplicateTargetIndex(target.index));
            }
        }

        let session = ScanSession::new(new_session_id(), targets, config);
        self.save_session(&session).await?;
        info!(
            session_id = %session.session_id,
            targets = session.targets.len(),
            "session created"
        );
        Ok(session)
    }

    /// Load a session. `Ok(None)` when no file exists for `session_id`.
    pub async fn load_session(&self, session_id: &str) -> Result<Option<ScanSession>> {
        let path = self.path_for(session_id)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(session_id, "session file not found");
                return Ok(None);
            }
            Err(e) => return Err(Error::Io(format!("reading session file: {e}"))),
        };

        let corrupt = |reason: String| Error::CorruptSession {
            id: session_id.to_string(),
            reason,
        };
        let session: ScanSession =
            serde_json::from_str(&contents).map_err(|e| corrupt(e.to_string()))?;
        if session.session_id != session_id {
            return Err(corrupt(format!(
                "file holds session {}",
                session.session_id
            )));
        }
        session.validate().map_err(corrupt)?;

        let (done, total) = session.progress();
        info!(session_id, done, total, "session loaded");
        Ok(Some(session))
    }

    /// Checkpoint a session to disk.
    pub async fn save_session(&self, session: &ScanSession) -> Result<()> {
        let path = self.path_for(&session.session_id)?;
        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| Error::Serialize(format!("serializing session: {e}")))?;
        write_atomic(&path, &json).await?;
        let (done, total) = session.progress();
        debug!(session_id = %session.session_id, done, total, "session checkpointed");
        Ok(())
    }

    /// Summaries of every readable session, newest first.
    ///
    /// Unreadable files are skipped with a warning.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut sessions = Vec::new();
        for path in self.session_files().await? {
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read session file");
                    continue;
                }
            };
            match serde_json::from_str::<ScanSession>(&contents) {
                Ok(session) => sessions.push(SessionSummary::from(&session)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable session file");
                }
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// Remove a session file. Returns whether it existed.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let path = self.path_for(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(session_id, "session deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(format!("deleting session file: {e}"))),
        }
    }

    /// Delete session files last modified at least `max_age` ago.
    ///
    /// Returns the number of files removed.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for path in self.session_files().await? {
            let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to stat session file");
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age < max_age {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    info!(path = %path.display(), age_secs = age.as_secs(), "old session removed");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove session file"),
            }
        }
        Ok(removed)
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(Error::InvalidSessionId(session_id.to_string()));
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }

    async fn session_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::Io(format!("reading session directory: {e}")))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Io(format!("reading session directory: {e}")))?
        {
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if !is_temp && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

/// `scan_<YYYYmmdd_HHMMSS>_<8 hex>`
fn new_session_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "scan_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

/// Write a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. This prevents a torn checkpoint if the process crashes
/// mid-write. Sets 0600 permissions since sessions hold candidate passwords.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("session path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Io("session path has no file name".into()))?;

    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let tmp_path = dir.join(format!(
        ".{file_name}.tmp.{}.{}",
        std::process::id(),
        &nonce[..8]
    ));

    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(|e| Error::Io(format!("writing temp session file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting session file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp session file: {e}")))?;
    Ok(())
}
