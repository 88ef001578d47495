//! Lock-free running tallies for the engine

use std::sync::atomic::{AtomicU64, Ordering};

use common::{LoginResult, LoginStatus, ScanStats};

/// Atomic counterpart of `ScanStats`, shared by concurrent attempts.
#[derive(Debug, Default)]
pub struct StatsCounter {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    ambiguous: AtomicU64,
    error: AtomicU64,
    timeout: AtomicU64,
}

impl StatsCounter {
    pub fn record(&self, result: &LoginResult) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let bucket = match result.status {
            LoginStatus::Success => &self.success,
            LoginStatus::Failed => &self.failed,
            LoginStatus::Ambiguous | LoginStatus::Pending => &self.ambiguous,
            LoginStatus::Error => &self.error,
            LoginStatus::Timeout => &self.timeout,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScanStats {
        ScanStats {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            ambiguous: self.ambiguous.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.total,
            &self.success,
            &self.failed,
            &self.ambiguous,
            &self.error,
            &self.timeout,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
