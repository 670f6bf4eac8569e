use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct StorageMetrics {
    opens: AtomicU64,
    schema_bootstraps: AtomicU64,
    tx_commits: AtomicU64,
    tx_rollbacks: AtomicU64,
    busy_retries: AtomicU64,
    locked_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetricsSnapshot {
    pub opens: u64,
    pub schema_bootstraps: u64,
    pub tx_commits: u64,
    pub tx_rollbacks: u64,
    pub busy_retries: u64,
    pub locked_failures: u64,
}

impl StorageMetrics {
    pub fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_schema_bootstrap(&self) {
        self.schema_bootstraps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.tx_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.tx_rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy_retry(&self) {
        self.busy_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_locked_failure(&self) {
        self.locked_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StorageMetricsSnapshot {
        StorageMetricsSnapshot {
            opens: self.opens.load(Ordering::Relaxed),
            schema_bootstraps: self.schema_bootstraps.load(Ordering::Relaxed),
            tx_commits: self.tx_commits.load(Ordering::Relaxed),
            tx_rollbacks: self.tx_rollbacks.load(Ordering::Relaxed),
            busy_retries: self.busy_retries.load(Ordering::Relaxed),
            locked_failures: self.locked_failures.load(Ordering::Relaxed),
        }
    }
}

/// Counters for operation queue transitions.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub total_enqueued: AtomicU64,
    pub total_claimed: AtomicU64,
    pub total_completed: AtomicU64,
    pub total_failed: AtomicU64,
    pub total_skipped: AtomicU64,
    pub total_cancelled: AtomicU64,
    pub total_superseded: AtomicU64,
    pub total_reconciled: AtomicU64,
    pub total_purged: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    pub total_enqueued: u64,
    pub total_claimed: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_skipped: u64,
    pub total_cancelled: u64,
    pub total_superseded: u64,
    pub total_reconciled: u64,
    pub total_purged: u64,
}

impl QueueMetrics {
    #[must_use]
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_claimed: self.total_claimed.load(Ordering::Relaxed),
            total_completed: self.total_completed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_skipped: self.total_skipped.load(Ordering::Relaxed),
            total_cancelled: self.total_cancelled.load(Ordering::Relaxed),
            total_superseded: self.total_superseded.load(Ordering::Relaxed),
            total_reconciled: self.total_reconciled.load(Ordering::Relaxed),
            total_purged: self.total_purged.load(Ordering::Relaxed),
        }
    }
}
