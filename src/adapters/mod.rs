//! Concrete collaborators for the pipeline.

pub mod fs;
pub mod http;
mod notes;
mod scripted;

pub use fs::{ExportArtifact, FsExporter, FsWriter, OutputLock, output_lock};
pub use http::{DIRECT, HttpFetcher};
pub use notes::TranscriptNotes;
pub use scripted::{CallCounts, Scripted, ScriptedServices};
