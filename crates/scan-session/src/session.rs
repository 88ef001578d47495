//! In-memory scan state
//!
//! Results live in a vector parallel to `targets`; a slot is `None` until the
//! target at that position completes. Positions are the only key, so a target
//! can never be recorded twice under different names.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use common::{LoginResult, ScanStats, Target};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Engine settings captured when the session was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub max_concurrent: usize,
    /// Minimum spacing between dispatches
    pub delay_ms: u64,
    pub timeout_secs: u64,
    pub max_retries: u32,
    #[serde(default)]
    pub use_proxy: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            delay_ms: 500,
            timeout_secs: 10,
            max_retries: 2,
            use_proxy: false,
        }
    }
}

/// Durable state of one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSession {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub targets: Vec<Target>,
    /// Positions in `targets` that have a result
    pub completed_indices: BTreeSet<usize>,
    /// Parallel to `targets`
    pub results: Vec<Option<LoginResult>>,
    pub config: SessionConfig,
    pub stats: ScanStats,
}

impl ScanSession {
    pub(crate) fn new(session_id: String, targets: Vec<Target>, config: SessionConfig) -> Self {
        let now = Utc::now();
        let results = vec![None; targets.len()];
        Self {
            session_id,
            created_at: now,
            updated_at: now,
            targets,
            completed_indices: BTreeSet::new(),
            results,
            config,
            stats: ScanStats::default(),
        }
    }

    /// Record the result for the target at `position`.
    ///
    /// Overwriting an earlier result replaces it in the stats, so repeating
    /// the same call leaves the session unchanged apart from `updated_at`.
    pub fn add_result(&mut self, position: usize, result: LoginResult) -> Result<()> {
        let len = self.targets.len();
        let slot = self
            .results
            .get_mut(position)
            .ok_or(Error::InvalidTargetIndex {
                index: position,
                len,
            })?;

        if let Some(previous) = slot.as_ref() {
            self.stats.forget(previous);
        }
        self.stats.record(&result);
        *slot = Some(result);
        self.completed_indices.insert(position);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Targets without a result, in original order, paired with their position.
    pub fn remaining(&self) -> Vec<(usize, Target)> {
        self.targets
            .iter()
            .enumerate()
            .filter(|(pos, _)| !self.completed_indices.contains(pos))
            .map(|(pos, target)| (pos, target.clone()))
            .collect()
    }

    /// Targets without a result, in original order.
    pub fn remaining_targets(&self) -> Vec<Target> {
        self.remaining().into_iter().map(|(_, t)| t).collect()
    }

    /// Position of the target carrying `target_index`.
    pub fn position_of(&self, target_index: usize) -> Option<usize> {
        self.targets.iter().position(|t| t.index == target_index)
    }

    /// `(completed, total)`
    pub fn progress(&self) -> (usize, usize) {
        (self.completed_indices.len(), self.targets.len())
    }

    /// Fraction of targets completed; an empty session reports 0.0.
    pub fn completion_rate(&self) -> f64 {
        let (done, total) = self.progress();
        if total == 0 {
            0.0
        } else {
            done as f64 / total as f64
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_indices.len() == self.targets.len()
    }

    /// Check the structural invariants of a loaded session.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let len = self.targets.len();
        if self.results.len() != len {
            return Err(format!(
                "{} results for {} targets",
                self.results.len(),
                len
            ));
        }

        let mut seen = HashSet::with_capacity(len);
        for target in &self.targets {
            if !seen.insert(target.index) {
                return Err(format!("duplicate target index {}", target.index));
            }
        }

        if let Some(out_of_range) = self.completed_indices.iter().find(|&&i| i >= len) {
            return Err(format!("completed index {out_of_range} out of range"));
        }
        for (pos, slot) in self.results.iter().enumerate() {
            match (slot.is_some(), self.completed_indices.contains(&pos)) {
                (false, true) => return Err(format!("completed index {pos} has no result")),
                (true, false) => return Err(format!("result at {pos} not marked completed")),
                _ => {}
            }
        }

        let mut recomputed = ScanStats::default();
        for result in self.results.iter().flatten() {
            recomputed.record(result);
        }
        if recomputed != self.stats {
            return Err("stats do not match recorded results".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::LoginStatus;

    fn targets(n: usize) -> Vec<Target> {
        (0..n)
            .map(|i| Target::new(i, format!("https://host{i}.local/login"), "admin", "admin"))
            .collect()
    }

    fn result(status: LoginStatus) -> LoginResult {
        LoginResult::fault(status, "https://host.local/login", "test", 0.2)
    }

    fn session(n: usize) -> ScanSession {
        ScanSession::new("scan_test".into(), targets(n), SessionConfig::default())
    }

    #[test]
    fn resume_leaves_remaining_in_order() {
        let mut s = session(10);
        for pos in [0, 4, 7] {
            s.add_result(pos, result(LoginStatus::Failed)).unwrap();
        }

        let remaining: Vec<usize> = s.remaining_targets().iter().map(|t| t.index).collect();
        assert_eq!(remaining, vec![1, 2, 3, 5, 6, 8, 9]);
        assert_eq!(s.progress(), (3, 10));
        assert!(!s.is_completed());
    }

    #[test]
    fn add_result_is_idempotent() {
        let mut s = session(3);
        s.add_result(1, result(LoginStatus::Success)).unwrap();
        let stats = s.stats;
        let completed = s.completed_indices.clone();

        s.add_result(1, result(LoginStatus::Success)).unwrap();
        assert_eq!(s.stats, stats);
        assert_eq!(s.completed_indices, completed);
        assert_eq!(s.stats.total, 1);
    }

    #[test]
    fn overwrite_moves_stats_bucket() {
        let mut s = session(2);
        s.add_result(0, result(LoginStatus::Timeout)).unwrap();
        s.add_result(0, result(LoginStatus::Failed)).unwrap();
        assert_eq!(s.stats.timeout, 0);
        assert_eq!(s.stats.failed, 1);
        assert_eq!(s.stats.total, 1);
    }

    #[test]
    fn out_of_range_index_rejected() {
        let mut s = session(2);
        let err = s.add_result(2, result(LoginStatus::Failed)).unwrap_err();
        assert!(matches!(err, Error::InvalidTargetIndex { index: 2, len: 2 }));
        assert!(s.completed_indices.is_empty());
    }

    #[test]
    fn completion_tracks_every_target() {
        let mut s = session(2);
        assert_eq!(s.completion_rate(), 0.0);
        s.add_result(0, result(LoginStatus::Failed)).unwrap();
        assert!((s.completion_rate() - 0.5).abs() < f64::EPSILON);
        s.add_result(1, result(LoginStatus::Error)).unwrap();
        assert!(s.is_completed());
        assert!(s.remaining_targets().is_empty());
    }

    #[test]
    fn empty_session_is_trivially_complete() {
        let s = session(0);
        assert!(s.is_completed());
        assert_eq!(s.completion_rate(), 0.0);
    }

    #[test]
    fn position_lookup_uses_target_index() {
        let mut t = targets(3);
        t[0].index = 40;
        t[1].index = 41;
        t[2].index = 42;
        let s = ScanSession::new("scan_test".into(), t, SessionConfig::default());
        assert_eq!(s.position_of(41), Some(1));
        assert_eq!(s.position_of(7), None);
    }

    #[test]
    fn validate_detects_missing_result() {
        let mut s = session(3);
        s.add_result(0, result(LoginStatus::Failed)).unwrap();
        assert!(s.validate().is_ok());

        s.completed_indices.insert(2);
        assert!(s.validate().unwrap_err().contains("no result"));
    }

    #[test]
    fn validate_detects_stats_drift() {
        let mut s = session(1);
        s.add_result(0, result(LoginStatus::Failed)).unwrap();
        s.stats.success = 5;
        assert!(s.validate().is_err());
    }
}
