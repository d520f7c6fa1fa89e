//! Terminal output: a progress bar fed by the pipeline's event stream and
//! coloured tables for audit entries and resources.

use std::collections::BTreeMap;

use chrono::Utc;
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::events::{PipelineEvent, StatsSnapshot};
use crate::resources::ResourceRecord;
use crate::retry::ScanReport;
use crate::state_machine::AuditEntry;

/// Progress bar over one batch. Retries grow the bar as they are queued.
pub struct BatchProgress {
    pb: ProgressBar,
    follower: JoinHandle<()>,
}

impl BatchProgress {
    /// Starts a bar over `total` jobs that follows `events` until finished.
    pub fn start(total: u64, mut events: broadcast::Receiver<PipelineEvent>) -> Self {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        let bar = pb.clone();
        let follower = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => apply(&bar, &event),
                    Err(RecvError::Lagged(skipped)) => {
                        bar.println(format!("  ({skipped} progress events skipped)"));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Self { pb, follower }
    }

    /// Shrinks the bar for an item that never made it into the queue.
    pub fn skip(&self, item: &str, reason: &dyn std::fmt::Display) {
        self.pb.dec_length(1);
        self.pb
            .println(format!("  {} {item}: {reason}", Style::new().red().apply_to("skipped")));
    }

    /// Stops following events and clears the bar.
    pub fn finish(self) {
        self.follower.abort();
        self.pb.finish_and_clear();
    }
}

fn apply(bar: &ProgressBar, event: &PipelineEvent) {
    match event {
        PipelineEvent::JobStarted { job_id, .. } => bar.set_message(job_id.clone()),
        PipelineEvent::JobFinished { .. } => bar.inc(1),
        PipelineEvent::RetrySubmitted { .. } if bar.position() >= bar.length().unwrap_or(0) => {
            bar.inc_length(1);
        }
        _ => {}
    }
    if let Some(line) = render_event(event) {
        bar.println(line);
    }
}

/// One-line rendering of the events worth printing.
pub fn render_event(event: &PipelineEvent) -> Option<String> {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let yellow = Style::new().yellow();

    match event {
        PipelineEvent::JobFinished {
            job_id,
            attempt,
            error: None,
            resource,
            ..
        } => Some(format!(
            "  {} {job_id} (attempt {attempt}, via {})",
            green.apply_to("✓"),
            resource.as_deref().unwrap_or("-")
        )),
        PipelineEvent::JobFinished {
            job_id,
            attempt,
            error: Some(kind),
            ..
        } => Some(format!("  {} {job_id} (attempt {attempt}): {kind}", red.apply_to("✗"))),
        PipelineEvent::RetrySubmitted { job_id, attempt } => {
            Some(format!("  {} {job_id} queued for attempt {attempt}", yellow.apply_to("↻")))
        }
        PipelineEvent::PermanentlyFailed { job_id, attempts } => Some(format!(
            "  {} {job_id} gave up after {attempts} attempts",
            red.apply_to("✗✗")
        )),
        _ => None,
    }
}

/// One line per attempt, plus the error message for failures.
pub fn print_entries(entries: &[AuditEntry]) {
    let green = Style::new().green();
    let red = Style::new().red();
    if entries.is_empty() {
        println!("no audit entries");
        return;
    }
    for entry in entries {
        let status = if entry.success {
            green.apply_to("completed".to_string())
        } else {
            let label = entry
                .error_kind()
                .map_or_else(|| entry.stage.to_string(), |k| k.to_string());
            red.apply_to(label)
        };
        let seconds: f64 = entry.timings.values().sum();
        println!(
            "{:<14} #{:<2} {:<20} {:<28} {:>7.2}s  {}",
            entry.job_id,
            entry.attempt_count,
            status,
            entry.assigned_resource.as_deref().unwrap_or("-"),
            seconds,
            entry.completed_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &entry.error {
            println!("{:>18}{}", "", Style::new().dim().apply_to(&error.message));
        }
    }
}

/// Attempts grouped under the identity they used.
pub fn print_by_resource(groups: &BTreeMap<String, Vec<AuditEntry>>) {
    let bold = Style::new().bold();
    for (resource, entries) in groups {
        let failed = entries.iter().filter(|e| !e.success).count();
        println!(
            "{}  {} attempts, {} failed",
            bold.apply_to(resource),
            entries.len(),
            failed
        );
        print_entries(entries);
        println!();
    }
}

/// Lease state, cooldown and usage per identity.
pub fn print_resources(resources: &[ResourceRecord]) {
    let now = Utc::now();
    let green = Style::new().green();
    let yellow = Style::new().yellow();
    for record in resources {
        let state = if record.assigned {
            yellow.apply_to("leased".to_string())
        } else if record.in_cooldown(now) {
            let until = record.cooldown_until.map(|t| t.format("%Y-%m-%d %H:%M").to_string());
            yellow.apply_to(format!("cooling until {}", until.unwrap_or_default()))
        } else {
            green.apply_to("eligible".to_string())
        };
        println!(
            "{:<32} {:<34} uses {:<5} last used {}",
            record.identifier,
            state,
            record.use_count,
            record
                .last_used_at
                .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string())
        );
    }
}

/// Totals for one worker pool.
pub fn print_stats(stats: &StatsSnapshot) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    println!(
        "{} completed, {} failed ({} permanently), {} retried, {} rejected at submit",
        green.apply_to(stats.completed),
        red.apply_to(stats.failed),
        stats.permanently_failed,
        stats.retried,
        stats.rejected
    );
}

/// One scan's outcome, next to the jobs that are out of attempts for good.
pub fn print_scan(report: &ScanReport, permanent: &[AuditEntry]) {
    if report.is_empty() {
        println!("nothing to retry");
    } else {
        println!(
            "{} resubmitted, {} deferred",
            report.resubmitted.len(),
            report.deferred.len()
        );
    }
    if !permanent.is_empty() {
        let red = Style::new().red();
        let ids: Vec<&str> = permanent.iter().map(|e| e.job_id.as_str()).collect();
        println!("{} {}", red.apply_to("permanently failed:"), ids.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::state_machine::Stage;

    #[test]
    fn finished_jobs_render_with_resource_or_error() {
        let ok = render_event(&PipelineEvent::JobFinished {
            job_id: "abc".into(),
            attempt: 1,
            stage: Stage::Completed,
            error: None,
            resource: Some("proxy-a".into()),
        })
        .unwrap();
        assert!(ok.contains("abc") && ok.contains("proxy-a"));

        let failed = render_event(&PipelineEvent::JobFinished {
            job_id: "abc".into(),
            attempt: 2,
            stage: Stage::Failed,
            error: Some(ErrorKind::ResourceExhausted),
            resource: None,
        })
        .unwrap();
        assert!(failed.contains("ResourceExhausted"));
    }

    #[test]
    fn stage_events_are_not_printed() {
        assert!(
            render_event(&PipelineEvent::StageCompleted {
                job_id: "abc".into(),
                attempt: 1,
                stage: Stage::ContentFetched,
                seconds: 0.5,
            })
            .is_none()
        );
    }

    #[tokio::test]
    async fn progress_counts_finished_jobs() {
        let bus = crate::events::EventBus::new(16);
        let progress = BatchProgress::start(2, bus.subscribe());
        for id in ["a", "b"] {
            bus.emit(PipelineEvent::JobFinished {
                job_id: id.into(),
                attempt: 1,
                stage: Stage::Completed,
                error: None,
                resource: None,
            });
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(progress.pb.position(), 2);
        progress.finish();
    }
}
