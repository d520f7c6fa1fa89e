//! Append-only record of every finished job attempt.
//!
//! Entries live in memory and, when the log has a path, in a JSON array file
//! rewritten atomically on each append. Appends serialize on one mutex; an
//! entry is never mutated or removed once appended.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::AuditError;
use crate::persist::write_atomic_async;
use crate::state_machine::{AuditEntry, Stage};

/// Grouping key for entries that never leased a resource.
pub const UNASSIGNED: &str = "(none)";

#[derive(Debug)]
pub struct AuditLog {
    path: Option<PathBuf>,
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    /// Opens the log at `path`, loading any entries already there.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => Vec::new(),
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| AuditError::Json {
                path: path.display().to_string(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(AuditError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        info!(path = %path.display(), entries = entries.len(), "audit log opened");
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    /// A log that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends one entry. `(job_id, attempt_count)` must be new.
    ///
    /// If the file write fails the entry is still kept in memory and is
    /// flushed with the next successful append.
    pub async fn append(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let mut entries = self.entries.lock().await;
        if entries
            .iter()
            .any(|e| e.job_id == entry.job_id && e.attempt_count == entry.attempt_count)
        {
            return Err(AuditError::Duplicate {
                job_id: entry.job_id,
                attempt: entry.attempt_count,
            });
        }
        debug!(
            job_id = %entry.job_id,
            attempt = entry.attempt_count,
            stage = %entry.stage,
            "audit entry appended"
        );
        entries.push(entry);

        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&*entries).map_err(|source| AuditError::Json {
            path: path.display().to_string(),
            source,
        })?;
        write_atomic_async(path, &json)
            .await
            .map_err(|source| AuditError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    /// Every entry matching `predicate`, in append order.
    pub async fn query<P>(&self, predicate: P) -> Vec<AuditEntry>
    where
        P: Fn(&AuditEntry) -> bool,
    {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    /// Number of recorded attempts.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Every failed attempt, retried or not.
    pub async fn failed(&self) -> Vec<AuditEntry> {
        self.query(|e| e.stage == Stage::Failed).await
    }

    /// All attempts of one job, ordered by attempt.
    pub async fn entries_for(&self, job_id: &str) -> Vec<AuditEntry> {
        let mut entries = self.query(|e| e.job_id == job_id).await;
        entries.sort_by_key(|e| e.attempt_count);
        entries
    }

    /// The highest attempt recorded for each job.
    pub async fn latest_per_job(&self) -> BTreeMap<String, AuditEntry> {
        let mut latest: BTreeMap<String, AuditEntry> = BTreeMap::new();
        for entry in self.entries.lock().await.iter() {
            match latest.get(&entry.job_id) {
                Some(seen) if seen.attempt_count >= entry.attempt_count => {}
                _ => {
                    latest.insert(entry.job_id.clone(), entry.clone());
                }
            }
        }
        latest
    }

    /// Latest entries of jobs that failed their last allowed attempt.
    pub async fn permanently_failed(&self, max_attempts: u32) -> Vec<AuditEntry> {
        self.latest_per_job()
            .await
            .into_values()
            .filter(|e| e.exhausts(max_attempts))
            .collect()
    }

    /// Entries grouped by the resource their attempt used.
    pub async fn by_resource(&self) -> BTreeMap<String, Vec<AuditEntry>> {
        let mut groups: BTreeMap<String, Vec<AuditEntry>> = BTreeMap::new();
        for entry in self.entries.lock().await.iter() {
            let key = entry.assigned_resource.as_deref().unwrap_or(UNASSIGNED);
            groups.entry(key.to_string()).or_default().push(entry.clone());
        }
        groups
    }
}
