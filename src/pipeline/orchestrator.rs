use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::collaborators::Services;
use super::stages;
use crate::error::ErrorKind;
use crate::events::{EventBus, PipelineEvent};
use crate::resources::{Lease, ReleaseOutcome, ResourcePool};
use crate::state_machine::{JobError, JobRecord, Stage};

/// Per-attempt limits.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Time limit for one attempt; `None` disables the deadline.
    pub job_deadline: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Lease,
    Fetch,
    Generate,
    Persist,
    Export,
}

impl Step {
    const ALL: [Step; 5] = [Step::Lease, Step::Fetch, Step::Generate, Step::Persist, Step::Export];
}

/// Drives one job attempt through lease → fetch → generate → persist →
/// export → complete, and always gives the leased identity back.
///
/// The orchestrator is also where a failure's consequences for the identity
/// are decided; stages only report what went wrong.
pub struct Orchestrator<S> {
    services: Arc<S>,
    pool: Arc<ResourcePool>,
    config: OrchestratorConfig,
    events: EventBus,
}

impl<S: Services> Orchestrator<S> {
    pub fn new(
        services: Arc<S>,
        pool: Arc<ResourcePool>,
        config: OrchestratorConfig,
        events: EventBus,
    ) -> Self {
        Self {
            services,
            pool,
            config,
            events,
        }
    }

    /// The pool attempts lease their identity from.
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// Runs the attempt described by `record` to a terminal stage.
    pub async fn run(&self, record: JobRecord, worker_id: usize) -> JobRecord {
        self.run_with_checkpoints(record, worker_id, None).await
    }

    /// Like [`run`](Self::run), publishing the record on `checkpoints` after
    /// every step. A caller that loses the attempt to a panic still sees how
    /// far it got, including the identity it leased.
    pub async fn run_with_checkpoints(
        &self,
        record: JobRecord,
        worker_id: usize,
        checkpoints: Option<watch::Sender<JobRecord>>,
    ) -> JobRecord {
        let span = info_span!(
            "job",
            job_id = %record.id,
            attempt = record.attempt_count,
            worker = worker_id
        );
        self.run_attempt(record, worker_id, checkpoints.as_ref())
            .instrument(span)
            .await
    }

    async fn run_attempt(
        &self,
        mut record: JobRecord,
        worker_id: usize,
        checkpoints: Option<&watch::Sender<JobRecord>>,
    ) -> JobRecord {
        record.worker_id = Some(worker_id);
        record.started_at.get_or_insert_with(Utc::now);
        if record.stage.is_terminal() {
            debug!(stage = %record.stage, "record already terminal");
            return record;
        }

        let deadline = self.config.job_deadline.map(|d| Instant::now() + d);
        let mut lease: Option<Lease> = None;

        for step in Step::ALL {
            if record.is_failed() {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                record.fail(JobError::new(
                    ErrorKind::Timeout,
                    format!("job deadline exceeded before {step:?}"),
                ));
                break;
            }

            let before = record.stage;
            let timed_out = match deadline {
                Some(d) => tokio::time::timeout_at(d, self.step(step, &mut record, &mut lease))
                    .await
                    .is_err(),
                None => {
                    self.step(step, &mut record, &mut lease).await;
                    false
                }
            };
            if timed_out {
                record.fail(JobError::new(
                    ErrorKind::Timeout,
                    format!("job deadline exceeded during {step:?}"),
                ));
            }
            if let Some(lease) = lease.as_mut() {
                lease.note(release_outcome(&record));
            }
            if let Some(checkpoints) = checkpoints {
                checkpoints.send_replace(record.clone());
            }
            self.report_stage(&record, before);
        }

        // Runs whatever stage failed.
        if let Some(lease) = lease.take() {
            let outcome = release_outcome(&record);
            if let Err(err) = lease.release(outcome).await {
                error!(error = %err, "failed to release resource");
            }
        }

        if record.is_failed() {
            let err = record.error.as_ref().map(ToString::to_string).unwrap_or_default();
            warn!(error = %err, "job attempt failed");
        } else {
            record.advance(Stage::Completed);
            let resource = record.assigned_resource.as_deref().unwrap_or("-");
            info!(resource, "job completed");
        }
        record
    }

    async fn step(&self, step: Step, record: &mut JobRecord, lease: &mut Option<Lease>) {
        let services = self.services.as_ref();
        match step {
            Step::Lease => stages::lease_resource(record, &self.pool, lease).await,
            Step::Fetch => stages::fetch_content(record, services).await,
            Step::Generate => stages::generate_content(record, services).await,
            Step::Persist => stages::persist_outputs(record, services).await,
            Step::Export => stages::export_artifacts(record, services).await,
        }
    }

    fn report_stage(&self, record: &JobRecord, before: Stage) {
        if record.stage == before || record.is_failed() {
            return;
        }
        let seconds = record.timings.get(record.stage.as_str()).copied().unwrap_or_default();
        debug!(stage = %record.stage, seconds, "stage completed");
        self.events.emit(PipelineEvent::StageCompleted {
            job_id: record.id.clone(),
            attempt: record.attempt_count,
            stage: record.stage,
            seconds,
        });
    }
}

/// Decides what the attempt means for the identity it used: the most severe
/// of what the fetch reported and what the failure, if any, implies.
///
/// Timeouts count as transient: the identity may be degraded, and the pool
/// policy decides whether that costs it a cooldown.
fn release_outcome(record: &JobRecord) -> ReleaseOutcome {
    let from_error = match record.error_kind() {
        Some(ErrorKind::UpstreamRejected) => ReleaseOutcome::Rejected,
        Some(ErrorKind::UpstreamTransient | ErrorKind::Timeout) => ReleaseOutcome::Transient,
        _ => ReleaseOutcome::Success,
    };
    record
        .resource_outcome
        .map_or(from_error, |reported| reported.max(from_error))
}
