//! Run counters with throughput and ETA, logged on a fixed interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    attempts: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    aborted: AtomicU64,
    persisted: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    /// Records that reached a terminal outcome (succeeded or failed).
    pub completed: u64,
    pub attempts: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub aborted: u64,
    pub persisted: u64,
    pub rejected: u64,
    pub elapsed_secs: f64,
    pub per_minute: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
}

/// Shared progress counters. Clones update the same run.
#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    started: Instant,
    counters: Arc<Counters>,
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ProgressMonitor {
    pub fn new(total: u64) -> Self {
        let counters = Counters::default();
        counters.total.store(total, Ordering::Relaxed);
        Self {
            started: Instant::now(),
            counters: Arc::new(counters),
        }
    }

    pub fn record_attempt(&self) {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, n: u64) {
        self.counters.persisted.fetch_add(n, Ordering::Relaxed);
    }

    /// Results the store refused. Reported as failures, not successes.
    pub fn record_rejected(&self, n: u64) {
        self.counters.rejected.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let c = &self.counters;
        let total = c.total.load(Ordering::Relaxed);
        let rejected = c.rejected.load(Ordering::Relaxed);
        let succeeded = c.succeeded.load(Ordering::Relaxed).saturating_sub(rejected);
        let failed = c.failed.load(Ordering::Relaxed) + rejected;
        let completed = succeeded + failed;
        let elapsed = self.started.elapsed().as_secs_f64();

        let per_minute = if elapsed > 0.0 {
            completed as f64 * 60.0 / elapsed
        } else {
            0.0
        };
        let remaining = total.saturating_sub(completed + c.skipped.load(Ordering::Relaxed));
        let eta_secs = (per_minute > 0.0 && remaining > 0)
            .then(|| (remaining as f64 * 60.0 / per_minute).round() as u64);

        ProgressSnapshot {
            total,
            completed,
            attempts: c.attempts.load(Ordering::Relaxed),
            succeeded,
            failed,
            skipped: c.skipped.load(Ordering::Relaxed),
            aborted: c.aborted.load(Ordering::Relaxed),
            persisted: c.persisted.load(Ordering::Relaxed),
            rejected,
            elapsed_secs: (elapsed * 10.0).round() / 10.0,
            per_minute: (per_minute * 10.0).round() / 10.0,
            eta_secs,
        }
    }

    pub fn log(&self) {
        let s = self.snapshot();
        tracing::info!(
            completed = s.completed,
            total = s.total,
            succeeded = s.succeeded,
            failed = s.failed,
            persisted = s.persisted,
            attempts = s.attempts,
            per_minute = s.per_minute,
            eta_secs = ?s.eta_secs,
            "Progress"
        );
    }

    /// Log a snapshot every `interval` until `cancel` fires.
    pub fn spawn_logger(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.log(),
                    () = cancel.cancelled() => break,
                }
            }
        })
    }
}
