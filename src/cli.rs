//! Command line interface for tubenotes, built on clap.
//!
//! [`Cli`] carries the global flags (`--config`, `--workers`,
//! `--max-attempts`, `--verbose`) and one [`Command`].

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Batch pipeline that turns video transcripts into notes.
#[derive(Debug, Parser)]
#[command(name = "tubenotes", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file (default: ./tubenotes.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of concurrent workers.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Total attempts allowed per job.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Debug-level logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Process a batch of videos.
    Run {
        /// Video ids or URLs.
        keys: Vec<String>,

        /// File with one video id or URL per line; `#` starts a comment.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Retry failed jobs once, then exit.
    Retry,

    /// Retry failed jobs on the configured interval until interrupted.
    Watch,

    /// Show the audit log.
    Audit {
        /// Only failed attempts.
        #[arg(long)]
        failed: bool,

        /// Group attempts by the resource they used.
        #[arg(long, conflicts_with = "job")]
        by_resource: bool,

        /// Every attempt of one job.
        #[arg(long)]
        job: Option<String>,
    },

    /// Show the egress identities and their cooldowns.
    Resources,

    /// Run a scripted batch in memory, without network or disk.
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["tubenotes", "run", "dQw4w9WgXcQ", "https://youtu.be/abc123"]);
        match cli.command {
            Command::Run { keys, file } => {
                assert_eq!(keys, vec!["dQw4w9WgXcQ", "https://youtu.be/abc123"]);
                assert!(file.is_none());
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "tubenotes",
            "--workers",
            "5",
            "--max-attempts",
            "4",
            "--config",
            "alt.toml",
            "--verbose",
            "demo",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.workers, Some(5));
        assert_eq!(cli.max_attempts, Some(4));
        assert_eq!(cli.config, Some(PathBuf::from("alt.toml")));
        assert!(matches!(cli.command, Command::Demo));
    }

    #[test]
    fn cli_parses_audit_filters() {
        let cli = Cli::parse_from(["tubenotes", "audit", "--failed", "--by-resource"]);
        match cli.command {
            Command::Audit {
                failed,
                by_resource,
                job,
            } => {
                assert!(failed);
                assert!(by_resource);
                assert!(job.is_none());
            }
            _ => panic!("expected Audit command"),
        }
    }

    #[test]
    fn by_resource_and_job_conflict() {
        let args = ["tubenotes", "audit", "--by-resource", "--job", "abc"];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
