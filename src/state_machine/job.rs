use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::Stage;
use crate::error::{ErrorKind, SubmitError};
use crate::resources::ReleaseOutcome;

/// Longest identifier accepted as a job key.
const MAX_KEY_LEN: usize = 64;

/// A unit of work as handed to the submitter: a video id or a URL naming one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDescriptor {
    /// The raw input, kept for diagnostics.
    pub source: String,
    /// Stable job identifier derived from the source.
    pub id: String,
}

impl WorkDescriptor {
    /// Parses a bare video id or a watch/short/embed URL.
    pub fn parse(input: &str) -> Result<Self, SubmitError> {
        let source = input.trim();
        if source.is_empty() {
            return Err(SubmitError::Invalid("empty work descriptor".into()));
        }

        let id = if source.contains('/') || source.contains('?') {
            extract_video_id(source)
                .ok_or_else(|| SubmitError::Invalid(format!("no video id in {source:?}")))?
        } else {
            source
        };

        if id.len() > MAX_KEY_LEN
            || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SubmitError::Invalid(format!("malformed video id {id:?}")));
        }

        Ok(Self {
            source: source.to_string(),
            id: id.to_string(),
        })
    }
}

fn extract_video_id(url: &str) -> Option<&str> {
    let cut = |s: &'_ str| -> usize { s.find(['&', '#', '?', '/']).unwrap_or(s.len()) };

    if let Some(pos) = url.find("v=") {
        let rest = &url[pos + 2..];
        let id = &rest[..cut(rest)];
        return (!id.is_empty()).then_some(id);
    }
    for marker in ["youtu.be/", "/shorts/", "/embed/", "/live/"] {
        if let Some(pos) = url.find(marker) {
            let rest = &url[pos + marker.len()..];
            let id = &rest[..cut(rest)];
            return (!id.is_empty()).then_some(id);
        }
    }
    None
}

/// Structured failure cause attached to a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The state carried through the pipeline for one attempt of one job.
///
/// A record is owned by exactly one worker for the lifetime of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub stage: Stage,
    /// 1 for the first attempt, incremented on every retry.
    pub attempt_count: u32,
    pub assigned_resource: Option<String>,
    /// Worker slot that ran this attempt; observability only.
    pub worker_id: Option<usize>,
    /// Seconds spent reaching each stage. Entries are never overwritten.
    pub timings: BTreeMap<String, f64>,
    pub error: Option<JobError>,

    pub content: Option<String>,
    pub derived: Option<String>,
    pub output_path: Option<PathBuf>,
    pub artifact_path: Option<PathBuf>,
    /// What the fetch collaborator reported about the leased identity.
    pub resource_outcome: Option<ReleaseOutcome>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// First attempt of a freshly submitted job.
    pub fn new(descriptor: &WorkDescriptor) -> Self {
        Self::with_attempt(descriptor.id.clone(), 1)
    }

    /// Fresh record for the next attempt of a job whose last attempt failed.
    pub fn retry_of(entry: &AuditEntry) -> Self {
        Self::with_attempt(entry.job_id.clone(), entry.attempt_count + 1)
    }

    fn with_attempt(id: String, attempt_count: u32) -> Self {
        Self {
            id,
            stage: Stage::Created,
            attempt_count,
            assigned_resource: None,
            worker_id: None,
            timings: BTreeMap::new(),
            error: None,
            content: None,
            derived: None,
            output_path: None,
            artifact_path: None,
            resource_outcome: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Moves the record forward. Backward or post-terminal moves are ignored.
    pub fn advance(&mut self, next: Stage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal transition {} -> {next}",
            self.stage
        );
        if self.stage.can_advance_to(next) {
            self.stage = next;
            if next.is_terminal() {
                self.completed_at = Some(Utc::now());
            }
        }
    }

    /// Marks the attempt failed with a structured cause.
    pub fn fail(&mut self, error: JobError) {
        if self.stage.is_terminal() {
            return;
        }
        self.error = Some(error);
        self.stage = Stage::Failed;
        self.completed_at = Some(Utc::now());
    }

    /// Keeps the first timing recorded for `stage`.
    pub fn record_timing(&mut self, stage: Stage, seconds: f64) {
        self.timings.entry(stage.to_string()).or_insert(seconds);
    }

    pub fn is_failed(&self) -> bool {
        self.stage == Stage::Failed
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Immutable snapshot of a job attempt once its outcome is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub job_id: String,
    pub attempt_count: u32,
    pub stage: Stage,
    pub success: bool,
    pub error: Option<JobError>,
    pub assigned_resource: Option<String>,
    pub timings: BTreeMap<String, f64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub worker_id: Option<usize>,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub artifact_path: Option<PathBuf>,
}

impl AuditEntry {
    /// Snapshots a record that reached a terminal stage.
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.id.clone(),
            attempt_count: record.attempt_count,
            stage: record.stage,
            success: record.stage == Stage::Completed,
            error: record.error.clone(),
            assigned_resource: record.assigned_resource.clone(),
            timings: record.timings.clone(),
            started_at: record.started_at.unwrap_or(record.created_at),
            completed_at: record.completed_at.unwrap_or_else(Utc::now),
            worker_id: record.worker_id,
            output_path: record.output_path.clone(),
            artifact_path: record.artifact_path.clone(),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Whether this entry records a failure the coordinator may retry.
    pub fn is_retryable_failure(&self) -> bool {
        !self.success && self.error_kind().is_some_and(ErrorKind::is_retryable)
    }

    /// Whether this is a retryable failure on the last attempt
    /// `max_attempts` allows, which leaves the job failed for good.
    pub fn exhausts(&self, max_attempts: u32) -> bool {
        self.is_retryable_failure() && self.attempt_count >= max_attempts
    }
}
