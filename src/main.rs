mod cli;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use cli::{Cli, Command};
use tubenotes::adapters::{
    FsExporter, FsWriter, HttpFetcher, Scripted, ScriptedServices, TranscriptNotes, output_lock,
};
use tubenotes::audit::AuditLog;
use tubenotes::config::PipelineConfig;
use tubenotes::logging::{LogLevel, init_logging};
use tubenotes::pipeline::{Collaborators, Services};
use tubenotes::resources::{PoolPolicy, ResourceLedger, ResourcePool};
use tubenotes::retry::{RetryCoordinator, RetryPolicy};
use tubenotes::state_machine::AuditEntry;
use tubenotes::ui::{self, BatchProgress};
use tubenotes::worker_pool::{WorkerPool, WorkerPoolConfig};

type LiveServices = Collaborators<HttpFetcher, TranscriptNotes, FsWriter, FsExporter>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(workers) = cli.workers {
        config.max_workers = workers;
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.max_attempts = max_attempts;
    }
    config.validate()?;

    let mut log_config = config.log_config();
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    init_logging(&log_config)?;

    match cli.command {
        Command::Run { keys, file } => {
            let keys = collect_keys(keys, file.as_deref())?;
            let workers = live_workers(&config).await?;
            run_batch(&workers, &keys).await;
            ui::print_stats(&workers.stats());
        }
        Command::Retry => {
            let workers = Arc::new(live_workers(&config).await?);
            let coordinator = RetryCoordinator::new(Arc::clone(&workers), config.retry_policy());
            let progress = BatchProgress::start(0, workers.subscribe());
            let (report, _) = coordinator.run_once().await;
            progress.finish();
            let permanent = workers.audit().permanently_failed(workers.max_attempts()).await;
            ui::print_scan(&report, &permanent);
            ui::print_stats(&workers.stats());
        }
        Command::Watch => {
            let workers = Arc::new(live_workers(&config).await?);
            let coordinator = RetryCoordinator::new(Arc::clone(&workers), config.retry_policy());
            let coordinator = Arc::new(coordinator);
            let progress = BatchProgress::start(0, workers.subscribe());
            let (stop, shutdown) = watch::channel(false);
            let driver = tokio::spawn(Arc::clone(&coordinator).run_periodic(shutdown));

            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutting down after the current cycle");
            let _ = stop.send(true);
            driver.await.context("retry driver")?;
            progress.finish();
            ui::print_stats(&workers.stats());
        }
        Command::Audit {
            failed,
            by_resource,
            job,
        } => {
            let audit = AuditLog::open(&config.audit_path)
                .await
                .with_context(|| format!("opening audit log {}", config.audit_path.display()))?;
            if by_resource {
                let mut groups = audit.by_resource().await;
                if failed {
                    for entries in groups.values_mut() {
                        entries.retain(|e| !e.success);
                    }
                    groups.retain(|_, entries| !entries.is_empty());
                }
                ui::print_by_resource(&groups);
            } else {
                let entries = match &job {
                    Some(job_id) => audit.entries_for(job_id).await,
                    None => audit.query(|_| true).await,
                };
                let entries: Vec<AuditEntry> =
                    entries.into_iter().filter(|e| !failed || !e.success).collect();
                ui::print_entries(&entries);
            }
        }
        Command::Resources => {
            let pool = ResourcePool::new(
                config.resources.iter().cloned(),
                ResourceLedger::open(&config.ledger_path),
                config.pool_policy(),
            )
            .context("opening resource pool")?;
            ui::print_resources(&pool.snapshot());
        }
        Command::Demo => run_demo(&config).await?,
    }

    Ok(())
}

/// Keys from the command line followed by those in `file`, one per line.
fn collect_keys(mut keys: Vec<String>, file: Option<&Path>) -> Result<Vec<String>> {
    if let Some(path) = file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading job list {}", path.display()))?;
        keys.extend(
            contents
                .lines()
                .map(|line| line.split('#').next().unwrap_or_default().trim())
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }
    if keys.is_empty() {
        bail!("nothing to run: pass video ids or --file");
    }
    Ok(keys)
}

async fn live_workers(config: &PipelineConfig) -> Result<WorkerPool<LiveServices>> {
    let resources = ResourcePool::new(
        config.resources.iter().cloned(),
        ResourceLedger::open(&config.ledger_path),
        config.pool_policy(),
    )
    .context("opening resource pool")?;
    let audit = AuditLog::open(&config.audit_path)
        .await
        .with_context(|| format!("opening audit log {}", config.audit_path.display()))?;

    let lock = output_lock();
    let fetch_timeout = Duration::from_secs(config.fetch_timeout_secs);
    let services = Collaborators {
        fetcher: HttpFetcher::new(&config.transcript_url, fetch_timeout),
        generator: TranscriptNotes::default(),
        writer: FsWriter::new(&config.output_dir, lock.clone()),
        exporter: FsExporter::new(&config.export_dir, lock),
    };

    Ok(WorkerPool::new(
        Arc::new(services),
        Arc::new(resources),
        Arc::new(audit),
        config.worker_pool(),
        config.orchestrator(),
    ))
}

async fn run_batch<S: Services>(workers: &WorkerPool<S>, keys: &[String]) -> Vec<AuditEntry> {
    let progress = BatchProgress::start(keys.len() as u64, workers.subscribe());
    let intake = workers.intake();
    let feed = async {
        for key in keys {
            if let Err(err) = workers.submit(key).await {
                progress.skip(key, &err);
            }
        }
        drop(intake);
    };
    let ((), entries) = tokio::join!(feed, workers.run());
    progress.finish();
    entries
}

/// Scripted batch: three identities, one of which the upstream blocks, and a
/// couple of flaky videos that succeed on retry.
async fn run_demo(config: &PipelineConfig) -> Result<()> {
    let services = ScriptedServices::new().with_fetch_delay(Duration::from_millis(150));
    let services = Arc::new(services);
    services.block_resource("proxy-c");
    services.script("flakyVideo1", [Scripted::Transient]);
    services.script("flakyVideo2", [Scripted::Transient, Scripted::Transient]);
    services.script("missingVideo", [Scripted::Invalid]);

    let resources = ResourcePool::new(
        ["proxy-a", "proxy-b", "proxy-c"],
        ResourceLedger::in_memory(),
        PoolPolicy {
            acquire_timeout: Duration::from_secs(5),
            ..config.pool_policy()
        },
    )?;
    let workers = Arc::new(WorkerPool::new(
        services,
        Arc::new(resources),
        Arc::new(AuditLog::in_memory()),
        WorkerPoolConfig {
            max_workers: config.max_workers,
            max_attempts: config.max_attempts,
            ..WorkerPoolConfig::default()
        },
        config.orchestrator(),
    ));
    let coordinator = RetryCoordinator::new(Arc::clone(&workers), RetryPolicy::default());

    let keys: Vec<String> = [
        "dQw4w9WgXcQ",
        "https://youtu.be/jNQXAC9IVRw",
        "flakyVideo1",
        "flakyVideo2",
        "missingVideo",
        "not a video",
    ]
    .map(str::to_string)
    .to_vec();

    println!("── first pass ──");
    run_batch(&workers, &keys).await;

    for cycle in 1..config.max_attempts {
        let progress = BatchProgress::start(0, workers.subscribe());
        let (report, _) = coordinator.run_once().await;
        progress.finish();
        println!("── retry cycle {cycle} ──");
        let permanent = workers.audit().permanently_failed(config.max_attempts).await;
        ui::print_scan(&report, &permanent);
        if report.resubmitted.is_empty() {
            break;
        }
    }

    println!("\n── audit log ──");
    ui::print_entries(&workers.audit().query(|_| true).await);
    println!("\n── resources ──");
    ui::print_resources(&workers.resources().snapshot());
    println!();
    ui::print_stats(&workers.stats());
    Ok(())
}
