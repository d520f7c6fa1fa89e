//! In-memory services with scripted fetch outcomes. Backs the `demo`
//! command and the pipeline tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::CollaboratorError;
use crate::pipeline::{Exporter, Fetched, Fetcher, Generator, Writer};
use crate::resources::ReleaseOutcome;

/// Outcome of one scripted fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    Ok,
    /// Content arrives but the identity is reported as flagged.
    Flagged,
    Reject,
    Transient,
    Invalid,
    /// The call panics, as a buggy collaborator would.
    Panic,
}

/// How often each collaborator was called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch: usize,
    pub generate: usize,
    pub write: usize,
    pub export: usize,
}

/// Every collaborator at once, driven by per-key scripts.
#[derive(Debug, Default)]
pub struct ScriptedServices {
    fetch_delay: Duration,
    generate_delay: Duration,
    generate_fault: Mutex<Option<Scripted>>,
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    blocked_resources: Mutex<HashSet<String>>,
    fail_writes: AtomicBool,

    fetch_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    write_calls: AtomicUsize,
    export_calls: AtomicUsize,

    fetch_log: Mutex<Vec<(String, String)>>,
    in_flight: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
    written: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a resource busy for the duration of a fetch, even if the fetch is
/// cancelled.
struct InFlight<'a> {
    services: &'a ScriptedServices,
    resource: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(&self.services.in_flight).remove(&self.resource);
    }
}

impl ScriptedServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch sleeps for `delay` first.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Every generate call sleeps for `delay` first.
    pub fn with_generate_delay(mut self, delay: Duration) -> Self {
        self.generate_delay = delay;
        self
    }

    /// Queues outcomes for successive fetches of `key`. Once the queue is
    /// empty, fetches succeed.
    pub fn script(&self, key: &str, outcomes: impl IntoIterator<Item = Scripted>) {
        lock(&self.scripts)
            .entry(key.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Every fetch through `resource` is rejected.
    pub fn block_resource(&self, resource: &str) {
        lock(&self.blocked_resources).insert(resource.to_string());
    }

    /// Makes every write fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every generate call end the way `fault` says; `None` restores
    /// success. `Ok` and `Flagged` also succeed.
    pub fn fail_generates(&self, fault: Option<Scripted>) {
        *lock(&self.generate_fault) = fault;
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            fetch: self.fetch_calls.load(Ordering::SeqCst),
            generate: self.generate_calls.load(Ordering::SeqCst),
            write: self.write_calls.load(Ordering::SeqCst),
            export: self.export_calls.load(Ordering::SeqCst),
        }
    }

    /// `(key, resource)` for every fetch, in call order.
    pub fn fetches(&self) -> Vec<(String, String)> {
        lock(&self.fetch_log).clone()
    }

    /// How many fetches found their resource already in use by another fetch.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn written(&self, path: &Path) -> Option<Vec<u8>> {
        lock(&self.written).get(path).cloned()
    }

    fn next_outcome(&self, key: &str, resource: &str) -> Scripted {
        if lock(&self.blocked_resources).contains(resource) {
            return Scripted::Reject;
        }
        lock(&self.scripts)
            .get_mut(key)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Scripted::Ok)
    }
}

impl Fetcher for ScriptedServices {
    async fn fetch(&self, key: &str, resource: &str) -> Result<Fetched, CollaboratorError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.fetch_log).push((key.to_string(), resource.to_string()));

        let newly_busy = lock(&self.in_flight).insert(resource.to_string());
        if !newly_busy {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let _busy = InFlight {
            services: self,
            resource: resource.to_string(),
        };

        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }

        match self.next_outcome(key, resource) {
            Scripted::Ok => Ok(Fetched::ok(format!("transcript of {key}"))),
            Scripted::Flagged => Ok(Fetched {
                content: format!("transcript of {key}"),
                resource_outcome: ReleaseOutcome::Rejected,
            }),
            Scripted::Reject => Err(CollaboratorError::Rejected(format!("{resource} is blocked"))),
            Scripted::Transient => Err(CollaboratorError::Transient("connection reset".into())),
            Scripted::Invalid => {
                Err(CollaboratorError::Invalid(format!("{key} has no transcript")))
            }
            Scripted::Panic => panic!("scripted fetch of {key} panicked"),
        }
    }
}

impl Generator for ScriptedServices {
    async fn generate(&self, content: &str) -> Result<String, CollaboratorError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.generate_delay.is_zero() {
            tokio::time::sleep(self.generate_delay).await;
        }
        let fault = *lock(&self.generate_fault);
        match fault {
            None | Some(Scripted::Ok | Scripted::Flagged) => Ok(format!("# Notes\n\n{content}\n")),
            Some(Scripted::Reject) => Err(CollaboratorError::Rejected("generator refused".into())),
            Some(Scripted::Transient) => Err(CollaboratorError::Transient("generator busy".into())),
            Some(Scripted::Invalid) => {
                Err(CollaboratorError::Invalid("nothing to summarise".into()))
            }
            Some(Scripted::Panic) => panic!("scripted generate panicked"),
        }
    }
}

impl Writer for ScriptedServices {
    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), CollaboratorError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Io(std::io::Error::other("disk full")));
        }
        lock(&self.written).insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }
}

impl Exporter for ScriptedServices {
    async fn export(&self, job_id: &str, _derived: &str) -> Result<PathBuf, CollaboratorError> {
        self.export_calls.fetch_add(1, Ordering::SeqCst);
        Ok(PathBuf::from(format!("exports/{job_id}.json")))
    }
}
