//! In-process counters for engine health.
//!
//! Durable per-job metrics live in the store (`processing_metrics`); these
//! atomics are the cheap live view used by the stats surface. Plain data,
//! lock-free, single global instance.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pub jobs_leased: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_retried: AtomicU64,
    pub jobs_discarded: AtomicU64,
    pub llm_calls: AtomicU64,
    pub metric_write_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_leased: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_discarded: AtomicU64::new(0),
            llm_calls: AtomicU64::new(0),
            metric_write_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_jobs_leased(&self) {
        self.jobs_leased.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_discarded(&self) {
        self.jobs_discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_llm_calls(&self) {
        self.llm_calls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_metric_write_errors(&self) {
        self.metric_write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_leased: self.jobs_leased.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_discarded: self.jobs_discarded.load(Ordering::Relaxed),
            llm_calls: self.llm_calls.load(Ordering::Relaxed),
            metric_write_errors: self.metric_write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot for reading.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub jobs_leased: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_discarded: u64,
    pub llm_calls: u64,
    pub metric_write_errors: u64,
}

impl MetricsSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "Jobs: {} leased, {} completed, {} failed, {} retried, {} discarded | LLM calls: {}",
            self.jobs_leased,
            self.jobs_completed,
            self.jobs_failed,
            self.jobs_retried,
            self.jobs_discarded,
            self.llm_calls,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment_and_snapshot() {
        let metrics = Metrics::new();
        metrics.inc_jobs_leased();
        metrics.inc_jobs_leased();
        metrics.inc_jobs_completed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_leased, 2);
        assert_eq!(snapshot.jobs_completed, 1);
        assert!(snapshot.summary().contains("2 leased"));
    }
}
