//! Manager counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Point-in-time manager statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Sessions currently resident in memory.
    pub active: usize,
    /// Highest number of sessions resident at once.
    pub peak_active: usize,
    pub created: u64,
    pub expired: u64,
    /// Creations refused because the active maximum was reached.
    pub rejected: u64,
    pub swapped_in: u64,
    pub swapped_out: u64,
    pub backed_up: u64,
    /// Cumulative time spent in expiry processing.
    pub processing_time: Duration,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) created: AtomicU64,
    pub(crate) expired: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) swapped_in: AtomicU64,
    pub(crate) swapped_out: AtomicU64,
    pub(crate) backed_up: AtomicU64,
    processing_micros: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_processing_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.processing_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, active: usize, peak_active: usize) -> SessionStats {
        SessionStats {
            active,
            peak_active,
            created: self.created.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            swapped_in: self.swapped_in.load(Ordering::Relaxed),
            swapped_out: self.swapped_out.load(Ordering::Relaxed),
            backed_up: self.backed_up.load(Ordering::Relaxed),
            processing_time: Duration::from_micros(self.processing_micros.load(Ordering::Relaxed)),
        }
    }
}
