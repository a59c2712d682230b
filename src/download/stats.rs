//! Counters for one download run.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Tracks chapters completed, failed, retried and recovered by the final
/// pass. Updated from concurrent fetches, hence atomics.
#[derive(Debug, Default)]
pub struct DownloadStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    recovered: AtomicUsize,
}

impl DownloadStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Chapters currently counted as failed. A chapter recovered by the
    /// final pass moves back to completed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Retry attempts made in the main pass.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn recovered(&self) -> usize {
        self.recovered.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.completed() + self.failed()
    }

    pub(crate) fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_recovery(&self) {
        self.recovered.fetch_add(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .failed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |failed| failed.checked_sub(1));
    }

    #[must_use]
    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            completed: self.completed(),
            failed: self.failed(),
            retried: self.retried(),
            recovered: self.recovered(),
        }
    }
}

/// Plain copy of the counters for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub completed: usize,
    pub failed: usize,
    pub retried: usize,
    pub recovered: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_moves_failed_to_completed() {
        let stats = DownloadStats::new();
        stats.increment_completed();
        stats.increment_failed();
        stats.increment_failed();
        stats.record_recovery();
        assert_eq!(
            stats.summary(),
            StatsSummary {
                completed: 2,
                failed: 1,
                retried: 0,
                recovered: 1
            }
        );
        assert_eq!(stats.total(), 3);
    }
}
