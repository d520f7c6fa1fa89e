//! Pipeline configuration loaded from `tubenotes.toml`.
//!
//! Every key has a default, so a missing file or a partial one is fine.
//! `TUBENOTES_RESOURCES` and `TUBENOTES_TRANSCRIPT_URL` take precedence over
//! the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::logging::{LogConfig, LogFormat, LogLevel};
use crate::pipeline::OrchestratorConfig;
use crate::resources::PoolPolicy;
use crate::retry::RetryPolicy;
use crate::worker_pool::{QueueFullPolicy, WorkerPoolConfig};

pub const DEFAULT_CONFIG_FILE: &str = "tubenotes.toml";
pub const RESOURCES_ENV: &str = "TUBENOTES_RESOURCES";
pub const TRANSCRIPT_URL_ENV: &str = "TUBENOTES_TRANSCRIPT_URL";

/// Top-level settings loaded from `tubenotes.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Attempts that may run at the same time.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Total attempts per job, the first included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// How long a rejected identity stays out of rotation.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Whether a transient failure also puts the identity into cooldown.
    #[serde(default)]
    pub cooldown_on_transient: bool,

    /// Minimum time between two leases of the same identity.
    #[serde(default)]
    pub min_reuse_spacing_secs: u64,

    /// How long an attempt waits for an eligible identity.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Time between two retry scans in `watch`.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Base of the exponential retry backoff; 0 disables it.
    #[serde(default)]
    pub retry_backoff_base_secs: u64,

    /// Pause between two attempts on the same worker.
    #[serde(default)]
    pub inter_submission_delay_ms: u64,

    /// 0 disables the per-job deadline.
    #[serde(default = "default_job_deadline_secs")]
    pub job_deadline_secs: u64,

    /// Capacity of the submission queue.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// What a submission does when the queue is full.
    #[serde(default)]
    pub queue_full: QueueFullPolicy,

    /// Egress identities: `direct` or proxy URLs.
    #[serde(default = "default_resources")]
    pub resources: Vec<String>,

    /// JSON ledger with usage and cooldown history per identity.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// JSON audit log, one entry per attempt.
    #[serde(default = "default_audit_path")]
    pub audit_path: PathBuf,

    /// Where generated notes are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Where exported artifacts are written.
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,

    /// Transcript endpoint; `{id}` is replaced by the video id.
    #[serde(default = "default_transcript_url")]
    pub transcript_url: String,

    /// HTTP timeout for one transcript request.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Default verbosity; `RUST_LOG` refines it.
    #[serde(default)]
    pub log_level: LogLevel,

    /// `text` for terminals, `json` for log collectors.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Three attempts in flight.
fn default_max_workers() -> usize {
    3
}

/// The first attempt plus two retries.
fn default_max_attempts() -> u32 {
    3
}

/// 24 hours.
fn default_cooldown_secs() -> u64 {
    24 * 60 * 60
}

/// Half a minute.
fn default_acquire_timeout_secs() -> u64 {
    30
}

/// 15 minutes.
fn default_retry_interval_secs() -> u64 {
    15 * 60
}

/// Ten minutes per attempt.
fn default_job_deadline_secs() -> u64 {
    600
}

/// Roomy enough for a typical batch file.
fn default_queue_depth() -> usize {
    256
}

/// Just the direct connection.
fn default_resources() -> Vec<String> {
    vec!["direct".to_string()]
}

/// Next to the audit log under `.tubenotes/`.
fn default_ledger_path() -> PathBuf {
    PathBuf::from(".tubenotes/ledger.json")
}

/// Next to the ledger under `.tubenotes/`.
fn default_audit_path() -> PathBuf {
    PathBuf::from(".tubenotes/audit.json")
}

/// `notes/` in the working directory.
fn default_output_dir() -> PathBuf {
    PathBuf::from("notes")
}

/// `exports/` in the working directory.
fn default_export_dir() -> PathBuf {
    PathBuf::from("exports")
}

/// A transcript service on localhost.
fn default_transcript_url() -> String {
    "http://127.0.0.1:8080/transcripts/{id}".to_string()
}

/// One minute.
fn default_fetch_timeout_secs() -> u64 {
    60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_attempts: default_max_attempts(),
            cooldown_secs: default_cooldown_secs(),
            cooldown_on_transient: false,
            min_reuse_spacing_secs: 0,
            acquire_timeout_secs: default_acquire_timeout_secs(),
            retry_interval_secs: default_retry_interval_secs(),
            retry_backoff_base_secs: 0,
            inter_submission_delay_ms: 0,
            job_deadline_secs: default_job_deadline_secs(),
            queue_depth: default_queue_depth(),
            queue_full: QueueFullPolicy::default(),
            resources: default_resources(),
            ledger_path: default_ledger_path(),
            audit_path: default_audit_path(),
            output_dir: default_output_dir(),
            export_dir: default_export_dir(),
            transcript_url: default_transcript_url(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads `path`, or `tubenotes.toml` in the working directory when `path`
    /// is `None`. Only the implicit file may be missing.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(list) = var(RESOURCES_ENV) {
            let resources: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            if !resources.is_empty() {
                self.resources = resources;
            }
        }
        if let Some(url) = var(TRANSCRIPT_URL_ENV)
            && !url.is_empty()
        {
            self.transcript_url = url;
        }
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            bail!("max_workers must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.queue_depth == 0 {
            bail!("queue_depth must be at least 1");
        }
        if self.resources.is_empty() {
            bail!("at least one resource must be configured");
        }
        if !self.transcript_url.contains("{id}") {
            bail!("transcript_url must contain {{id}}");
        }
        Ok(())
    }

    /// Allocation policy for the resource pool.
    pub fn pool_policy(&self) -> PoolPolicy {
        PoolPolicy {
            cooldown: Duration::from_secs(self.cooldown_secs),
            cooldown_on_transient: self.cooldown_on_transient,
            min_reuse_spacing: Duration::from_secs(self.min_reuse_spacing_secs),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
        }
    }

    /// Worker pool sizing, queueing and the attempt bound.
    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_workers: self.max_workers,
            queue_depth: self.queue_depth,
            queue_full: self.queue_full,
            inter_submission_delay: Duration::from_millis(self.inter_submission_delay_ms),
            max_attempts: self.max_attempts,
        }
    }

    /// Per-attempt limits.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        let deadline =
            (self.job_deadline_secs > 0).then(|| Duration::from_secs(self.job_deadline_secs));
        OrchestratorConfig {
            job_deadline: deadline,
        }
    }

    /// Scan interval and backoff for the retry coordinator.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_secs(self.retry_interval_secs),
            backoff_base: Duration::from_secs(self.retry_backoff_base_secs),
        }
    }

    /// Logging setup derived from `log_level` and `log_format`.
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            format: self.log_format,
            ..LogConfig::default()
        }
    }
}
