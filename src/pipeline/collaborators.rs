//! Contracts for the out-of-scope subsystems the pipeline drives.
//!
//! Implementations may be written with `async fn`; the futures must be `Send`
//! because jobs run on a multi-threaded runtime.

use std::future::Future;
use std::path::{Path, PathBuf};

use crate::error::CollaboratorError;
use crate::resources::ReleaseOutcome;

/// Content returned by a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub content: String,
    /// What the fetch learned about the identity it went through. A fetch can
    /// succeed and still report the identity as flagged.
    pub resource_outcome: ReleaseOutcome,
}

impl Fetched {
    /// Content with no complaint about the identity.
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            resource_outcome: ReleaseOutcome::Success,
        }
    }
}

/// Pulls source content through one egress identity.
pub trait Fetcher: Send + Sync {
    /// Retrieves the source content for `key` through the egress identity `resource`.
    fn fetch(
        &self,
        key: &str,
        resource: &str,
    ) -> impl Future<Output = Result<Fetched, CollaboratorError>> + Send;
}

/// Turns content into notes.
pub trait Generator: Send + Sync {
    /// Derives the notes body from fetched content.
    fn generate(
        &self,
        content: &str,
    ) -> impl Future<Output = Result<String, CollaboratorError>> + Send;
}

/// Stores generated notes under a relative path.
pub trait Writer: Send + Sync {
    fn write(
        &self,
        path: &Path,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), CollaboratorError>> + Send;
}

/// Publishes finished notes somewhere else.
pub trait Exporter: Send + Sync {
    /// Publishes derived content as an artifact and returns where it landed.
    fn export(
        &self,
        job_id: &str,
        derived: &str,
    ) -> impl Future<Output = Result<PathBuf, CollaboratorError>> + Send;
}

/// Everything a job needs from the outside world.
pub trait Services: Fetcher + Generator + Writer + Exporter + 'static {}

impl<T> Services for T where T: Fetcher + Generator + Writer + Exporter + 'static {}

/// Bundles four independent implementations into one [`Services`].
#[derive(Debug, Clone)]
pub struct Collaborators<F, G, W, E> {
    pub fetcher: F,
    pub generator: G,
    pub writer: W,
    pub exporter: E,
}

impl<F, G, W, E> Fetcher for Collaborators<F, G, W, E>
where
    F: Fetcher,
    G: Sync + Send,
    W: Sync + Send,
    E: Sync + Send,
{
    fn fetch(
        &self,
        key: &str,
        resource: &str,
    ) -> impl Future<Output = Result<Fetched, CollaboratorError>> + Send {
        self.fetcher.fetch(key, resource)
    }
}

impl<F, G, W, E> Generator for Collaborators<F, G, W, E>
where
    F: Sync + Send,
    G: Generator,
    W: Sync + Send,
    E: Sync + Send,
{
    fn generate(
        &self,
        content: &str,
    ) -> impl Future<Output = Result<String, CollaboratorError>> + Send {
        self.generator.generate(content)
    }
}

impl<F, G, W, E> Writer for Collaborators<F, G, W, E>
where
    F: Sync + Send,
    G: Sync + Send,
    W: Writer,
    E: Sync + Send,
{
    fn write(
        &self,
        path: &Path,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), CollaboratorError>> + Send {
        self.writer.write(path, bytes)
    }
}

impl<F, G, W, E> Exporter for Collaborators<F, G, W, E>
where
    F: Sync + Send,
    G: Sync + Send,
    W: Sync + Send,
    E: Exporter,
{
    fn export(
        &self,
        job_id: &str,
        derived: &str,
    ) -> impl Future<Output = Result<PathBuf, CollaboratorError>> + Send {
        self.exporter.export(job_id, derived)
    }
}
