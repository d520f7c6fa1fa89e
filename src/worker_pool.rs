//! Bounded concurrent executor for job attempts.
//!
//! Submissions land on a bounded queue. [`WorkerPool::run`] starts
//! `max_workers` workers that drain it, each running one attempt to a
//! terminal stage before pulling the next, and returns the audit entries of
//! everything it ran.
//!
//! The pool also owns the attempt bound: when it records a retryable failure
//! on a job's last allowed attempt, it reports the job as permanently failed.
//! That verdict follows from the audit entry alone, so it holds across
//! restarts without any extra state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{Mutex, Notify, broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::error::{ErrorKind, SubmitError};
use crate::events::{EventBus, PipelineEvent, RunStats, StatsSnapshot};
use crate::pipeline::{Orchestrator, OrchestratorConfig, Services};
use crate::resources::ResourcePool;
use crate::state_machine::{AuditEntry, JobError, JobRecord, WorkDescriptor};

/// What `submit` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueFullPolicy {
    /// Wait for a worker to make room.
    #[default]
    Block,
    /// Fail with [`SubmitError::QueueFull`].
    Reject,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Attempts that may run at the same time.
    pub max_workers: usize,
    /// Capacity of the submission queue.
    pub queue_depth: usize,
    pub queue_full: QueueFullPolicy,
    /// Pause between two dispatches of the same worker.
    pub inter_submission_delay: Duration,
    /// Attempts a job may use in total, the first one included.
    pub max_attempts: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            queue_depth: 256,
            queue_full: QueueFullPolicy::Block,
            inter_submission_delay: Duration::ZERO,
            max_attempts: 3,
        }
    }
}

struct Shared<S> {
    orchestrator: Arc<Orchestrator<S>>,
    audit: Arc<AuditLog>,
    config: WorkerPoolConfig,
    tx: mpsc::Sender<JobRecord>,
    rx: Mutex<mpsc::Receiver<JobRecord>>,
    /// Open [`Intake`] handles; workers keep waiting while any exist.
    intakes: AtomicUsize,
    activity: Notify,
    events: EventBus,
    stats: RunStats,
}

/// Runs submitted jobs with at most `max_workers` attempts in flight.
pub struct WorkerPool<S> {
    shared: Arc<Shared<S>>,
    run_lock: Mutex<()>,
}

/// Keeps a running batch open for more submissions.
///
/// Without one, `run` returns as soon as the queue is empty. Hold an intake
/// while feeding a `Block` queue from another task, then drop it.
pub struct Intake<S: Services> {
    shared: Arc<Shared<S>>,
}

impl<S: Services> Drop for Intake<S> {
    fn drop(&mut self) {
        self.shared.intakes.fetch_sub(1, Ordering::SeqCst);
        self.shared.activity.notify_waiters();
    }
}

impl<S: Services> WorkerPool<S> {
    /// Builds an idle pool; nothing runs until [`run`](Self::run).
    pub fn new(
        services: Arc<S>,
        pool: Arc<ResourcePool>,
        audit: Arc<AuditLog>,
        config: WorkerPoolConfig,
        orchestrator: OrchestratorConfig,
    ) -> Self {
        let events = EventBus::default();
        let orchestrator = Orchestrator::new(services, pool, orchestrator, events.clone());
        let orchestrator = Arc::new(orchestrator);
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        Self {
            shared: Arc::new(Shared {
                orchestrator,
                audit,
                config,
                tx,
                rx: Mutex::new(rx),
                intakes: AtomicUsize::new(0),
                activity: Notify::new(),
                events,
                stats: RunStats::default(),
            }),
            run_lock: Mutex::new(()),
        }
    }

    /// The identities attempts lease from.
    pub fn resources(&self) -> &Arc<ResourcePool> {
        self.shared.orchestrator.pool()
    }

    /// Where every attempt is recorded.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.shared.audit
    }

    /// Publishing side of the event stream.
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    /// Counters since the pool was built.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Attempts a job may use in total.
    pub fn max_attempts(&self) -> u32 {
        self.shared.config.max_attempts
    }

    /// Items waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.tx.max_capacity() - self.shared.tx.capacity()
    }

    /// Opens the batch for submissions until the returned handle drops.
    pub fn intake(&self) -> Intake<S> {
        self.shared.intakes.fetch_add(1, Ordering::SeqCst);
        Intake {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Validates and enqueues one work item, returning its job id.
    pub async fn submit(&self, input: &str) -> Result<String, SubmitError> {
        let descriptor = match WorkDescriptor::parse(input) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                self.shared.stats.record_rejected();
                warn!(input, error = %err, "rejected work descriptor");
                return Err(err);
            }
        };
        self.submit_descriptor(&descriptor).await?;
        Ok(descriptor.id)
    }

    /// Enqueues an already validated work item as its first attempt.
    pub async fn submit_descriptor(&self, descriptor: &WorkDescriptor) -> Result<(), SubmitError> {
        let record = JobRecord::new(descriptor);
        let attempt = record.attempt_count;
        if let Err(err) = self.enqueue(record).await {
            self.shared.stats.record_rejected();
            return Err(err);
        }
        self.shared.stats.record_submitted();
        self.shared.events.emit(PipelineEvent::JobQueued {
            job_id: descriptor.id.clone(),
            attempt,
        });
        debug!(job_id = %descriptor.id, "job queued");
        Ok(())
    }

    /// Enqueues a prepared retry attempt.
    pub async fn resubmit(&self, record: JobRecord) -> Result<(), SubmitError> {
        let job_id = record.id.clone();
        let attempt = record.attempt_count;
        self.enqueue(record).await?;
        self.shared.stats.record_retried();
        self.shared.events.emit(PipelineEvent::JobQueued { job_id, attempt });
        Ok(())
    }

    async fn enqueue(&self, record: JobRecord) -> Result<(), SubmitError> {
        let result = match self.shared.config.queue_full {
            QueueFullPolicy::Reject => self.shared.tx.try_send(record).map_err(|err| match err {
                TrySendError::Full(_) => SubmitError::QueueFull,
                TrySendError::Closed(_) => SubmitError::Closed,
            }),
            QueueFullPolicy::Block => {
                self.shared.tx.send(record).await.map_err(|_| SubmitError::Closed)
            }
        };
        if result.is_ok() {
            self.shared.activity.notify_waiters();
        }
        result
    }

    /// Drains the queue with `max_workers` workers and returns one entry per
    /// attempt run. Concurrent calls are serialized.
    pub async fn run(&self) -> Vec<AuditEntry> {
        let _running = self.run_lock.lock().await;
        let workers = self.shared.config.max_workers.max(1);
        info!(workers, queued = self.pending(), "worker pool starting");

        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let shared = Arc::clone(&self.shared);
            set.spawn(async move { shared.work(worker_id).await });
        }

        let mut entries = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(done) => entries.extend(done),
                Err(err) => error!(error = %err, "worker task ended abnormally"),
            }
        }

        let stats = self.stats();
        info!(
            ran = entries.len(),
            completed = stats.completed,
            failed = stats.failed,
            "worker pool drained"
        );
        entries
    }
}

impl<S: Services> Shared<S> {
    async fn work(self: Arc<Self>, worker_id: usize) -> Vec<AuditEntry> {
        let mut entries = Vec::new();
        loop {
            let notified = self.activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.rx.lock().await.try_recv();
            let record = match next {
                Ok(record) => record,
                Err(TryRecvError::Empty) if self.intakes.load(Ordering::SeqCst) > 0 => {
                    notified.await;
                    continue;
                }
                Err(_) => break,
            };

            if !entries.is_empty() && !self.config.inter_submission_delay.is_zero() {
                tokio::time::sleep(self.config.inter_submission_delay).await;
            }
            entries.push(self.process(record, worker_id).await);
        }
        debug!(worker = worker_id, ran = entries.len(), "worker idle, exiting");
        entries
    }

    async fn process(&self, record: JobRecord, worker_id: usize) -> AuditEntry {
        self.events.emit(PipelineEvent::JobStarted {
            job_id: record.id.clone(),
            attempt: record.attempt_count,
            worker_id,
        });

        // The attempt runs on its own task so a panicking stage cannot take
        // the worker down. Its lease is released by the guard's drop, and the
        // last checkpoint tells the audit how far it got.
        let (checkpoints, progress) = watch::channel(record.clone());
        let orchestrator = Arc::clone(&self.orchestrator);
        let attempt = tokio::spawn(async move {
            orchestrator
                .run_with_checkpoints(record, worker_id, Some(checkpoints))
                .await
        });
        let done = match attempt.await {
            Ok(done) => done,
            Err(err) => {
                let mut failed = progress.borrow().clone();
                error!(
                    job_id = %failed.id,
                    worker = worker_id,
                    resource = failed.assigned_resource.as_deref().unwrap_or("-"),
                    error = %err,
                    "job attempt panicked"
                );
                failed.worker_id = Some(worker_id);
                failed.fail(JobError::new(ErrorKind::Internal, format!("stage panicked: {err}")));
                failed
            }
        };

        let entry = AuditEntry::from_record(&done);
        if let Err(err) = self.audit.append(entry.clone()).await {
            error!(
                job_id = %entry.job_id,
                attempt = entry.attempt_count,
                error = %err,
                "failed to append audit entry"
            );
        }
        self.stats.record_outcome(entry.success);
        self.events.emit(PipelineEvent::JobFinished {
            job_id: entry.job_id.clone(),
            attempt: entry.attempt_count,
            stage: entry.stage,
            error: entry.error_kind(),
            resource: entry.assigned_resource.clone(),
        });
        if entry.exhausts(self.config.max_attempts) {
            warn!(
                job_id = %entry.job_id,
                attempts = entry.attempt_count,
                error = ?entry.error_kind(),
                "job permanently failed"
            );
            self.stats.record_permanently_failed();
            self.events.emit(PipelineEvent::PermanentlyFailed {
                job_id: entry.job_id.clone(),
                attempts: entry.attempt_count,
            });
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::adapters::{Scripted, ScriptedServices};
    use crate::resources::{LedgerEntry, PoolPolicy, ResourceLedger};
    use crate::state_machine::Stage;

    fn policy(acquire_ms: u64) -> PoolPolicy {
        PoolPolicy {
            acquire_timeout: Duration::from_millis(acquire_ms),
            ..Default::default()
        }
    }

    fn in_memory(ids: &[&str], acquire_ms: u64) -> Arc<ResourcePool> {
        let ledger = ResourceLedger::in_memory();
        Arc::new(ResourcePool::new(ids.iter().copied(), ledger, policy(acquire_ms)).unwrap())
    }

    fn worker_pool(
        services: Arc<ScriptedServices>,
        resources: Arc<ResourcePool>,
        config: WorkerPoolConfig,
    ) -> WorkerPool<ScriptedServices> {
        WorkerPool::new(
            services,
            resources,
            Arc::new(AuditLog::in_memory()),
            config,
            OrchestratorConfig::default(),
        )
    }

    fn workers(n: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_workers: n,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn one_cooling_resource_leaves_one_job_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("ledger.json");
        let now = Utc::now();
        let seeded = BTreeMap::from([(
            "r1".to_string(),
            LedgerEntry {
                last_used: Some(now),
                first_seen: now,
                use_count: 4,
                cooldown_until: Some(now + chrono::Duration::hours(1)),
            },
        )]);
        ResourceLedger::open(&ledger_path).save(&seeded).unwrap();

        let ledger = ResourceLedger::open(&ledger_path);
        let resources = ResourcePool::new(["r1", "r2", "r3"], ledger, policy(100)).unwrap();
        let resources = Arc::new(resources);
        let services = ScriptedServices::new().with_fetch_delay(Duration::from_millis(300));
        let services = Arc::new(services);
        let pool = worker_pool(Arc::clone(&services), resources, workers(3));

        for id in ["job1", "job2", "job3"] {
            pool.submit(id).await.unwrap();
        }
        let entries = pool.run().await;

        assert_eq!(entries.len(), 3);
        let completed: Vec<_> = entries.iter().filter(|e| e.success).collect();
        let exhausted: Vec<_> = entries
            .iter()
            .filter(|e| e.error_kind() == Some(ErrorKind::ResourceExhausted))
            .collect();
        assert_eq!(completed.len(), 2);
        assert_eq!(exhausted.len(), 1);
        assert!(exhausted[0].assigned_resource.is_none());
        assert!(services.fetches().iter().all(|(_, r)| r != "r1"));
    }

    #[tokio::test]
    async fn success_leaves_cooldown_and_counts_one_use() {
        let resources = in_memory(&["r1"], 100);
        let before = resources.snapshot()[0].clone();
        let services = Arc::new(ScriptedServices::new());
        let pool = worker_pool(services, Arc::clone(&resources), workers(1));

        pool.submit("job1").await.unwrap();
        let entries = pool.run().await;

        assert!(entries[0].success);
        let after = resources.snapshot()[0].clone();
        assert_eq!(after.cooldown_until, before.cooldown_until);
        assert_eq!(after.use_count, before.use_count + 1);
    }

    #[tokio::test]
    async fn resources_are_never_shared_and_run_terminates() {
        let resources =
            in_memory(&["r1", "r2"], 5_000);
        let services = ScriptedServices::new().with_fetch_delay(Duration::from_millis(20));
        let services = Arc::new(services);
        let pool = worker_pool(Arc::clone(&services), resources, workers(4));

        for i in 0..12 {
            pool.submit(&format!("job{i}")).await.unwrap();
        }
        let entries = pool.run().await;

        assert_eq!(entries.len(), 12);
        assert!(entries.iter().all(|e| e.success));
        assert_eq!(services.overlaps(), 0);
        assert_eq!(pool.stats().completed, 12);
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_pool() {
        let resources = in_memory(&["r1"], 1_000);
        let services = Arc::new(ScriptedServices::new());
        services.script("bad", [Scripted::Invalid]);
        let pool = worker_pool(Arc::clone(&services), resources, workers(2));

        for id in ["good1", "bad", "good2"] {
            pool.submit(id).await.unwrap();
        }
        let entries = pool.run().await;

        assert_eq!(entries.len(), 3);
        let failed: Vec<_> = entries.iter().filter(|e| !e.success).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job_id, "bad");
        assert_eq!(failed[0].stage, Stage::Failed);
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn write_failures_are_io_errors() {
        let resources = in_memory(&["r1"], 1_000);
        let services = Arc::new(ScriptedServices::new());
        services.fail_writes(true);
        let pool = worker_pool(services, resources, workers(1));

        pool.submit("job1").await.unwrap();
        let entries = pool.run().await;

        assert_eq!(entries[0].error_kind(), Some(ErrorKind::IoError));
        assert_eq!(pool.audit().len().await, 1);
    }

    #[tokio::test]
    async fn invalid_descriptor_is_rejected_at_submit() {
        let resources = in_memory(&["r1"], 100);
        let pool = worker_pool(Arc::new(ScriptedServices::new()), resources, workers(1));

        let err = pool.submit("not a valid id!").await.unwrap_err();

        assert!(matches!(err, SubmitError::Invalid(_)));
        assert_eq!(pool.pending(), 0);
        assert_eq!(pool.stats().rejected, 1);
    }

    #[tokio::test]
    async fn reject_policy_refuses_when_queue_is_full() {
        let resources = in_memory(&["r1"], 100);
        let config = WorkerPoolConfig {
            max_workers: 1,
            queue_depth: 2,
            queue_full: QueueFullPolicy::Reject,
            ..Default::default()
        };
        let pool = worker_pool(Arc::new(ScriptedServices::new()), resources, config);

        pool.submit("job1").await.unwrap();
        pool.submit("job2").await.unwrap();
        let err = pool.submit("job3").await.unwrap_err();

        assert!(matches!(err, SubmitError::QueueFull));
        assert_eq!(pool.pending(), 2);
        assert_eq!(pool.run().await.len(), 2);
    }

    #[tokio::test]
    async fn blocking_submissions_feed_a_running_batch() {
        let resources = in_memory(&["r1", "r2"], 5_000);
        let config = WorkerPoolConfig {
            max_workers: 2,
            queue_depth: 1,
            ..Default::default()
        };
        let pool = worker_pool(Arc::new(ScriptedServices::new()), resources, config);

        let intake = pool.intake();
        let feed = async {
            for i in 0..6 {
                pool.submit(&format!("job{i}")).await.unwrap();
            }
            drop(intake);
        };
        let ((), entries) = tokio::join!(feed, pool.run());

        assert_eq!(entries.len(), 6);
        assert_eq!(pool.stats().submitted, 6);
    }

    #[tokio::test]
    async fn worker_ids_stay_within_bounds() {
        let resources =
            in_memory(&["r1", "r2", "r3"], 5_000);
        let pool = worker_pool(Arc::new(ScriptedServices::new()), resources, workers(3));

        for i in 0..9 {
            pool.submit(&format!("job{i}")).await.unwrap();
        }
        let entries = pool.run().await;

        assert!(entries.iter().all(|e| e.worker_id.is_some_and(|w| w < 3)));
    }

    #[tokio::test]
    async fn events_bracket_each_attempt() {
        let resources = in_memory(&["r1"], 100);
        let pool = worker_pool(Arc::new(ScriptedServices::new()), resources, workers(1));
        let mut rx = pool.subscribe();

        pool.submit("job1").await.unwrap();
        pool.run().await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                PipelineEvent::JobQueued { .. } => kinds.push("queued"),
                PipelineEvent::JobStarted { .. } => kinds.push("started"),
                PipelineEvent::JobFinished { .. } => kinds.push("finished"),
                _ => {}
            }
        }
        assert_eq!(kinds, vec!["queued", "started", "finished"]);
    }

    #[tokio::test]
    async fn panicking_fetch_is_isolated_and_releases_its_resource() {
        let resources = in_memory(&["r1"], 1_000);
        let services = Arc::new(ScriptedServices::new());
        services.script("boom", [Scripted::Panic]);
        let pool = worker_pool(Arc::clone(&services), Arc::clone(&resources), workers(2));

        for id in ["good1", "boom", "good2"] {
            pool.submit(id).await.unwrap();
        }
        let entries = pool.run().await;

        assert_eq!(entries.len(), 3);
        for id in ["good1", "boom", "good2"] {
            assert_eq!(pool.audit().entries_for(id).await.len(), 1, "{id}");
        }
        let boom = entries.iter().find(|e| e.job_id == "boom").unwrap();
        assert_eq!(boom.stage, Stage::Failed);
        assert_eq!(boom.error_kind(), Some(ErrorKind::Internal));
        assert_eq!(boom.assigned_resource.as_deref(), Some("r1"));
        assert!(boom.worker_id.is_some());
        assert!(entries.iter().filter(|e| e.job_id != "boom").all(|e| e.success));
        assert!(!resources.snapshot()[0].assigned);
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn panic_after_flagged_fetch_keeps_the_cooldown() {
        let resources = in_memory(&["r1"], 100);
        let services = Arc::new(ScriptedServices::new());
        services.script("job1", [Scripted::Flagged]);
        services.fail_generates(Some(Scripted::Panic));
        let pool = worker_pool(services, Arc::clone(&resources), workers(1));

        pool.submit("job1").await.unwrap();
        let entries = pool.run().await;

        assert_eq!(entries[0].error_kind(), Some(ErrorKind::Internal));
        assert_eq!(entries[0].assigned_resource.as_deref(), Some("r1"));
        let r1 = resources.snapshot()[0].clone();
        assert!(!r1.assigned);
        assert!(r1.in_cooldown(Utc::now()));
    }

    #[tokio::test]
    async fn last_allowed_attempt_is_reported_permanently_failed() {
        let services = Arc::new(ScriptedServices::new());
        services.script("job1", [Scripted::Transient]);
        services.script("job2", [Scripted::Invalid]);
        let config = WorkerPoolConfig {
            max_attempts: 1,
            ..workers(1)
        };
        let pool = worker_pool(services, in_memory(&["r1"], 100), config);
        let mut rx = pool.subscribe();

        pool.submit("job1").await.unwrap();
        pool.submit("job2").await.unwrap();
        pool.run().await;

        let mut permanent = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::PermanentlyFailed { job_id, attempts } = event {
                permanent.push((job_id, attempts));
            }
        }
        // job2 failed for good too, but it never had a retry to exhaust.
        assert_eq!(permanent, vec![("job1".to_string(), 1)]);
        assert_eq!(pool.stats().permanently_failed, 1);
    }
}
