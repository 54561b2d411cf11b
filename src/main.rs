//! # Ingest Harness CLI (`ih`)
//!
//! Runs the ETL jobs declared in a TOML config file.
//!
//! ## Usage
//!
//! ```bash
//! ih --config ./config/ih.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ih run <job>` | Extract, transform, and load one job |
//! | `ih jobs` | List configured jobs |
//! | `ih check [job]` | Build every connector and test connectivity |
//! | `ih credential <provider> <id>` | Resolve a credential and list its fields |
//!
//! ## Examples
//!
//! ```bash
//! # Load new papers since the start of the month, without touching the index
//! ih run papers --since 2024-06-01 --dry-run
//!
//! # Full mailbox run with JSON progress for a supervisor
//! ih run inbox --progress json
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use ingest_harness::extractor::ExtractFilter;
use ingest_harness::ingest::{self, RunOptions};
use ingest_harness::progress::ProgressMode;
use ingest_harness::{config, jobs};

/// Ingest Harness: move records from databases, mailboxes, and paper
/// archives into a search index.
#[derive(Parser)]
#[command(
    name = "ih",
    about = "Ingest Harness: configuration-driven ETL into OpenSearch and Elasticsearch",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ih.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one job.
    ///
    /// Prints a summary of extracted, transformed, skipped, ingested and
    /// failed records. Ctrl-C stops the run after the in-flight request.
    Run {
        /// Job name (`[jobs.<name>]`).
        job: String,

        /// Only read items dated on or after this day (YYYY-MM-DD).
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Only read items dated on or before this day (YYYY-MM-DD).
        #[arg(long)]
        until: Option<NaiveDate>,

        /// Maximum number of items to read.
        #[arg(long)]
        limit: Option<usize>,

        /// Load into an in-memory index and skip embedding.
        #[arg(long)]
        dry_run: bool,

        /// Progress on stderr. Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// List configured jobs.
    Jobs,

    /// Build connectors and test connectivity.
    Check {
        /// Only check this job.
        job: Option<String>,
    },

    /// Resolve a credential and print its field names.
    Credential {
        provider: String,
        identifier: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            job,
            since,
            until,
            limit,
            dry_run,
            progress,
        } => {
            if let (Some(s), Some(u)) = (since, until) {
                if s > u {
                    anyhow::bail!("--since {} is after --until {}", s, u);
                }
            }
            let options = RunOptions {
                filter: ExtractFilter {
                    since,
                    until,
                    limit,
                },
                dry_run,
            };
            let reporter = progress
                .unwrap_or_else(ProgressMode::default_for_tty)
                .reporter();

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping after in-flight requests");
                    on_signal.cancel();
                }
            });

            let summary = ingest::run_job(&cfg, &job, &options, reporter.as_ref(), &cancel)
                .await
                .map_err(|e| anyhow::anyhow!(e.report()))?;
            ingest::print_summary(&summary);
            if let Some(reason) = &summary.aborted {
                anyhow::bail!("job '{}' aborted: {}", job, reason);
            }
        }
        Commands::Jobs => {
            jobs::list_jobs(&cfg)?;
        }
        Commands::Check { job } => {
            let results = jobs::check_jobs(&cfg, job.as_deref()).await?;
            if !jobs::print_checks(&results) {
                anyhow::bail!("one or more connectors failed their check");
            }
        }
        Commands::Credential {
            provider,
            identifier,
        } => {
            jobs::show_credential(&cfg, &provider, &identifier).await?;
        }
    }

    Ok(())
}
