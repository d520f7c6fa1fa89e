//! Filesystem writer and exporter. Both share one [`OutputLock`] so only one
//! worker touches the output tree at a time; callers assemble bytes before
//! taking it and only the write-and-rename happens inside.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::CollaboratorError;
use crate::persist::write_atomic_async;
use crate::pipeline::{Exporter, Writer};

pub type OutputLock = Arc<Mutex<()>>;

/// Lock shared by writers and exporters over the same directories.
pub fn output_lock() -> OutputLock {
    Arc::new(Mutex::new(()))
}

/// [`Writer`] that stores notes as files under one directory.
#[derive(Debug, Clone)]
pub struct FsWriter {
    root: PathBuf,
    lock: OutputLock,
}

impl FsWriter {
    /// Writes notes under `root`.
    pub fn new(root: impl Into<PathBuf>, lock: OutputLock) -> Self {
        Self {
            root: root.into(),
            lock,
        }
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, CollaboratorError> {
        let escapes = path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
        if path.is_absolute() || escapes {
            return Err(CollaboratorError::Invalid(format!(
                "refusing to write outside output dir: {}",
                path.display()
            )));
        }
        Ok(self.root.join(path))
    }
}

impl Writer for FsWriter {
    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), CollaboratorError> {
        let target = self.resolve(path)?;
        let _guard = self.lock.lock().await;
        write_atomic_async(&target, bytes).await?;
        Ok(())
    }
}

/// Sidecar describing one exported set of notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub job_id: String,
    pub exported_at: DateTime<Utc>,
    pub words: usize,
    pub characters: usize,
    pub body: String,
}

/// [`Exporter`] that writes an [`ExportArtifact`] JSON file per job.
#[derive(Debug, Clone)]
pub struct FsExporter {
    root: PathBuf,
    lock: OutputLock,
}

impl FsExporter {
    /// Writes artifacts under `root`.
    pub fn new(root: impl Into<PathBuf>, lock: OutputLock) -> Self {
        Self {
            root: root.into(),
            lock,
        }
    }
}

impl Exporter for FsExporter {
    async fn export(&self, job_id: &str, derived: &str) -> Result<PathBuf, CollaboratorError> {
        let artifact = ExportArtifact {
            job_id: job_id.to_string(),
            exported_at: Utc::now(),
            words: derived.split_whitespace().count(),
            characters: derived.chars().count(),
            body: derived.to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&artifact)
            .map_err(|e| CollaboratorError::Io(std::io::Error::other(e)))?;
        let target = self.root.join(format!("{job_id}.json"));

        let _guard = self.lock.lock().await;
        write_atomic_async(&target, &bytes).await?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writer_places_files_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsWriter::new(dir.path(), output_lock());

        writer.write(Path::new("abc.md"), b"# Notes").await.unwrap();

        let written = tokio::fs::read_to_string(dir.path().join("abc.md")).await.unwrap();
        assert_eq!(written, "# Notes");
    }

    #[tokio::test]
    async fn writer_refuses_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsWriter::new(dir.path(), output_lock());

        let err = writer.write(Path::new("../escape.md"), b"x").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Invalid(_)));
    }

    #[tokio::test]
    async fn exporter_writes_json_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = FsExporter::new(dir.path(), output_lock());

        let path = exporter.export("abc", "three little words").await.unwrap();

        assert_eq!(path, dir.path().join("abc.json"));
        let artifact: ExportArtifact =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(artifact.job_id, "abc");
        assert_eq!(artifact.words, 3);
    }

    #[tokio::test]
    async fn concurrent_writes_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(FsWriter::new(dir.path(), output_lock()));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let writer = Arc::clone(&writer);
            tasks.spawn(async move {
                let name = format!("job-{i}.md");
                writer.write(Path::new(&name), name.as_bytes()).await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 8);
    }
}
