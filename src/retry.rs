//! Periodic re-submission of failed jobs.
//!
//! A scan looks at the latest audit entry of every job. Retryable failures
//! get a fresh attempt on the worker pool. A job whose latest entry used up
//! the pool's attempt bound was already reported as permanently failed when
//! that entry was recorded, and every scan skips it, including scans after
//! a restart over the same audit log.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::events::PipelineEvent;
use crate::pipeline::Services;
use crate::resources::ResourcePool;
use crate::state_machine::{AuditEntry, JobRecord};
use crate::worker_pool::WorkerPool;

/// When to scan and how long to back off. The attempt bound lives on the
/// worker pool, which records the attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Time between two scans of [`RetryCoordinator::run_periodic`].
    pub interval: Duration,
    /// Minimum wait after a failed attempt, doubled per attempt. Zero disables.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            backoff_base: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// `backoff_base * 2^(attempt-1)`, saturating.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }
}

/// What the coordinator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    Idle,
    Scanning,
    Resubmitting,
}

/// What one scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// `(job_id, new attempt)` for every resubmission.
    pub resubmitted: Vec<(String, u32)>,
    /// Jobs that are retryable but not yet.
    pub deferred: Vec<String>,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.resubmitted.is_empty() && self.deferred.is_empty()
    }
}

/// Finds retryable failures in the audit log and queues their next attempt.
pub struct RetryCoordinator<S: Services> {
    workers: Arc<WorkerPool<S>>,
    audit: Arc<AuditLog>,
    resources: Arc<ResourcePool>,
    policy: RetryPolicy,
    state: Mutex<CoordinatorState>,
    scan_lock: tokio::sync::Mutex<()>,
    /// Failed attempts already answered with a new one. Only needs to cover
    /// the queue's lifetime: after a restart the queue is empty again and
    /// those attempts are due once more.
    resubmitted: Mutex<HashSet<(String, u32)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: Services> RetryCoordinator<S> {
    /// A coordinator over the worker pool's audit log and resources.
    pub fn new(workers: Arc<WorkerPool<S>>, policy: RetryPolicy) -> Self {
        let audit = Arc::clone(workers.audit());
        let resources = Arc::clone(workers.resources());
        Self {
            workers,
            audit,
            resources,
            policy,
            state: Mutex::new(CoordinatorState::Idle),
            scan_lock: tokio::sync::Mutex::new(()),
            resubmitted: Mutex::new(HashSet::new()),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *lock(&self.state)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn set_state(&self, next: CoordinatorState) {
        *lock(&self.state) = next;
    }

    /// Resubmits every failed job whose latest attempt is retryable now.
    pub async fn scan_and_retry(&self) -> ScanReport {
        let _scan = self.scan_lock.lock().await;
        self.set_state(CoordinatorState::Scanning);

        let mut report = ScanReport::default();
        let mut due = Vec::new();
        let now = Utc::now();
        let eligible = self.resources.eligible_count();
        let max_attempts = self.workers.max_attempts();

        for (job_id, entry) in self.audit.latest_per_job().await {
            if !entry.is_retryable_failure() || entry.exhausts(max_attempts) {
                continue;
            }
            if lock(&self.resubmitted).contains(&(job_id.clone(), entry.attempt_count)) {
                continue;
            }

            if let Some(reason) = self.defer_reason(&entry, now, eligible) {
                debug!(job_id = %job_id, reason, "retry deferred");
                self.workers.events().emit(PipelineEvent::RetryDeferred {
                    job_id: job_id.clone(),
                    reason: reason.to_string(),
                });
                report.deferred.push(job_id);
                continue;
            }
            due.push(entry);
        }

        self.set_state(CoordinatorState::Resubmitting);
        for entry in due {
            let record = JobRecord::retry_of(&entry);
            let attempt = record.attempt_count;
            match self.workers.resubmit(record).await {
                Ok(()) => {
                    lock(&self.resubmitted).insert((entry.job_id.clone(), entry.attempt_count));
                    info!(job_id = %entry.job_id, attempt, "retry submitted");
                    self.workers.events().emit(PipelineEvent::RetrySubmitted {
                        job_id: entry.job_id.clone(),
                        attempt,
                    });
                    report.resubmitted.push((entry.job_id, attempt));
                }
                Err(err) => {
                    warn!(job_id = %entry.job_id, error = %err, "retry not submitted");
                    report.deferred.push(entry.job_id);
                }
            }
        }

        self.set_state(CoordinatorState::Idle);
        report
    }

    fn defer_reason(
        &self,
        entry: &AuditEntry,
        now: chrono::DateTime<Utc>,
        eligible: usize,
    ) -> Option<&'static str> {
        let backoff = self.policy.delay_for_attempt(entry.attempt_count);
        if !backoff.is_zero() {
            let wait = chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::MAX);
            if entry.completed_at.checked_add_signed(wait).is_some_and(|at| at > now) {
                return Some("backoff");
            }
        }
        if eligible == 0 && entry.error_kind().is_some_and(|kind| kind.waits_on_resources()) {
            return Some("all resources cooling down");
        }
        None
    }

    /// One scan followed by a run of whatever it resubmitted.
    pub async fn run_once(&self) -> (ScanReport, Vec<AuditEntry>) {
        let report = self.scan_and_retry().await;
        let entries = if report.resubmitted.is_empty() {
            Vec::new()
        } else {
            self.workers.run().await
        };
        (report, entries)
    }

    /// Scans every `interval` until `shutdown` turns true or its sender goes away.
    pub async fn run_periodic(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.policy.interval.as_secs(), "retry coordinator started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let (report, entries) = self.run_once().await;
                    if !report.is_empty() {
                        info!(
                            resubmitted = report.resubmitted.len(),
                            deferred = report.deferred.len(),
                            ran = entries.len(),
                            "retry cycle finished"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("retry coordinator stopped");
    }
}
