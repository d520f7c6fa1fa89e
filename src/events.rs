//! Progress reporting for observers (CLI, UI, tests).
//!
//! The pipeline publishes [`PipelineEvent`]s on a broadcast channel and keeps
//! per-pool [`RunStats`]. Nothing in the core prints.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::ErrorKind;
use crate::state_machine::Stage;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    JobQueued {
        job_id: String,
        attempt: u32,
    },
    JobStarted {
        job_id: String,
        attempt: u32,
        worker_id: usize,
    },
    StageCompleted {
        job_id: String,
        attempt: u32,
        stage: Stage,
        seconds: f64,
    },
    JobFinished {
        job_id: String,
        attempt: u32,
        stage: Stage,
        error: Option<ErrorKind>,
        resource: Option<String>,
    },
    RetrySubmitted {
        job_id: String,
        attempt: u32,
    },
    RetryDeferred {
        job_id: String,
        reason: String,
    },
    PermanentlyFailed {
        job_id: String,
        attempts: u32,
    },
}

/// Cloneable publishing handle. Emitting never blocks and is a no-op when
/// nobody is subscribed.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    /// A bus that buffers up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }
}

/// Counters owned by one worker pool.
#[derive(Debug, Default)]
pub struct RunStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    permanently_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    /// Jobs whose last allowed attempt failed.
    pub permanently_failed: u64,
}

impl RunStats {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permanently_failed(&self) {
        self.permanently_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, success: bool) {
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            permanently_failed: self.permanently_failed.load(Ordering::Relaxed),
        }
    }
}
