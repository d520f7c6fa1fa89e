//! Stage functions. Each one checks whether its output is already on the
//! record and returns early if so, which makes a job resumable from any
//! stage. A failing stage marks the record `Failed` and later stages see that
//! and do nothing.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::time::Instant;

use super::collaborators::{Exporter, Fetcher, Generator, Writer};
use crate::error::{CollaboratorError, ErrorKind, PoolError};
use crate::resources::{Lease, ResourcePool};
use crate::state_machine::{JobError, JobRecord, Stage};

fn reach(record: &mut JobRecord, stage: Stage, started: Instant) {
    record.record_timing(stage, started.elapsed().as_secs_f64());
    if record.stage.can_advance_to(stage) {
        record.advance(stage);
    }
}

fn collaborator_failure(record: &mut JobRecord, stage: &str, err: CollaboratorError) {
    record.fail(JobError::new(ErrorKind::from(&err), format!("{stage}: {err}")));
}

fn missing(record: &mut JobRecord, what: &str) {
    record.fail(JobError::new(
        ErrorKind::Internal,
        format!("{what} missing at stage {}", record.stage),
    ));
}

/// Leases an egress identity unless the record no longer needs the network.
pub async fn lease_resource(
    record: &mut JobRecord,
    pool: &Arc<ResourcePool>,
    lease: &mut Option<Lease>,
) {
    if record.is_failed() || record.content.is_some() || lease.is_some() {
        return;
    }
    let started = Instant::now();
    match pool.lease().await {
        Ok(granted) => {
            record.assigned_resource = Some(granted.identifier().to_string());
            *lease = Some(granted);
            reach(record, Stage::ResourceLeased, started);
        }
        Err(err @ (PoolError::Exhausted { .. } | PoolError::Empty)) => {
            record.fail(JobError::new(ErrorKind::ResourceExhausted, err.to_string()));
        }
        Err(err) => {
            record.fail(JobError::new(ErrorKind::Internal, err.to_string()));
        }
    }
}

/// Fetches the source content through the leased identity.
pub async fn fetch_content<F: Fetcher>(record: &mut JobRecord, fetcher: &F) {
    if record.is_failed() || record.content.is_some() {
        return;
    }
    let Some(resource) = record.assigned_resource.clone() else {
        return missing(record, "leased resource");
    };
    let started = Instant::now();
    match fetcher.fetch(&record.id, &resource).await {
        Ok(fetched) => {
            record.content = Some(fetched.content);
            record.resource_outcome = Some(fetched.resource_outcome);
            reach(record, Stage::ContentFetched, started);
        }
        Err(err) => collaborator_failure(record, "fetch", err),
    }
}

/// Generates notes from the fetched content.
pub async fn generate_content<G: Generator>(record: &mut JobRecord, generator: &G) {
    if record.is_failed() || record.derived.is_some() {
        return;
    }
    let Some(content) = record.content.as_deref() else {
        return missing(record, "fetched content");
    };
    let started = Instant::now();
    match generator.generate(content).await {
        Ok(derived) => {
            record.derived = Some(derived);
            reach(record, Stage::ContentGenerated, started);
        }
        Err(err) => collaborator_failure(record, "generate", err),
    }
}

/// Writes the notes to `<job id>.md`.
pub async fn persist_outputs<W: Writer>(record: &mut JobRecord, writer: &W) {
    if record.is_failed() || record.output_path.is_some() {
        return;
    }
    let Some(derived) = record.derived.as_deref() else {
        return missing(record, "generated content");
    };
    let path = PathBuf::from(format!("{}.md", record.id));
    let started = Instant::now();
    match writer.write(&path, derived.as_bytes()).await {
        Ok(()) => {
            record.output_path = Some(path);
            reach(record, Stage::Persisted, started);
        }
        Err(err) => collaborator_failure(record, "persist", err),
    }
}

/// Exports the notes as an artifact.
pub async fn export_artifacts<E: Exporter>(record: &mut JobRecord, exporter: &E) {
    if record.is_failed() || record.artifact_path.is_some() {
        return;
    }
    let Some(derived) = record.derived.as_deref() else {
        return missing(record, "generated content");
    };
    let started = Instant::now();
    match exporter.export(&record.id, derived).await {
        Ok(path) => {
            record.artifact_path = Some(path);
            reach(record, Stage::Exported, started);
        }
        Err(err) => collaborator_failure(record, "export", err),
    }
}
