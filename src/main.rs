//! # eCFR Harness CLI (`ecfr`)
//!
//! Crawls the eCFR for one agency at a time, stores every document version
//! once, and computes readability metrics for what was stored.
//!
//! ## Usage
//!
//! ```bash
//! ecfr --config ./config/ecfr.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ecfr init` | Create the SQLite database and run schema migrations |
//! | `ecfr agencies refresh` | Load the agency list from the eCFR |
//! | `ecfr agencies list` | Show stored agencies |
//! | `ecfr sync <agency>` | Start or resume a crawl for an agency slug |
//! | `ecfr retry-failed <agency>` | Re-fetch content for errored descriptors |
//! | `ecfr metrics compute` | Compute missing readability snapshots |
//! | `ecfr metrics show <document>` | Show snapshots for a document |
//! | `ecfr stats` | Database overview |
//!
//! Logging goes through `tracing`; set `RUST_LOG` (default `info`).

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use ecfr_harness::ingest::IngestOptions;
use ecfr_harness::models::DateRange;
use ecfr_harness::progress::ProgressMode;
use ecfr_harness::{agencies, config, ingest, metrics, migrate, stats};

/// eCFR Harness CLI: resumable eCFR ingestion with readability metrics.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "ecfr",
    about = "eCFR Harness: resumable eCFR ingestion with readability metrics",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ecfr.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage the agency catalogue.
    Agencies {
        #[command(subcommand)]
        action: AgencyAction,
    },

    /// Start or resume the crawl of one agency.
    ///
    /// Progress is stored after every page; an interrupted sync picks up
    /// at the first unfinished page.
    Sync {
        /// Agency slug, e.g. `environmental-protection-agency`.
        agency: String,

        /// Results per search page (default from config).
        #[arg(long)]
        per_page: Option<u32>,

        /// Worker tasks for `--concurrent` (default from config).
        #[arg(long)]
        workers: Option<usize>,

        /// Restrict to results modified in this year. Remembered on resume.
        #[arg(long)]
        year: Option<i32>,

        /// First page (0-based) of a new crawl.
        #[arg(long)]
        start_page: Option<u32>,

        /// Discard stored progress and start over.
        #[arg(long)]
        reset: bool,

        /// Only results modified on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Only results modified before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<NaiveDate>,

        /// Split the remaining pages across workers.
        #[arg(long)]
        concurrent: bool,

        #[arg(long, value_enum, default_value_t = ProgressArg::Auto)]
        progress: ProgressArg,
    },

    /// Re-fetch content for descriptors whose last fetch failed.
    RetryFailed {
        agency: String,

        #[arg(long, value_enum, default_value_t = ProgressArg::Auto)]
        progress: ProgressArg,
    },

    /// Readability metrics.
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },

    /// Show database statistics.
    Stats,
}

#[derive(Subcommand)]
enum AgencyAction {
    /// Fetch the agency list from the eCFR and store it.
    Refresh,
    /// List stored agencies.
    List,
}

#[derive(Subcommand)]
enum MetricsAction {
    /// Compute snapshots for every document version that lacks one.
    Compute {
        /// Only documents of this agency slug.
        #[arg(long)]
        agency: Option<String>,

        /// Only versions dated on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Only versions dated on or before this date (YYYY-MM-DD, inclusive).
        #[arg(long)]
        until: Option<NaiveDate>,

        /// Worker tasks, clamped to 1..=10 (default from config).
        #[arg(long)]
        workers: Option<usize>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show snapshots for a document (row id or key such as `T40CIP52`).
    Show {
        document: String,

        /// Only snapshots dated on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Only snapshots dated on or before this date (YYYY-MM-DD, inclusive).
        #[arg(long)]
        until: Option<NaiveDate>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Auto,
    Human,
    Json,
    Off,
}

impl ProgressArg {
    fn mode(self) -> ProgressMode {
        match self {
            ProgressArg::Auto => ProgressMode::default_for_tty(),
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
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
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Agencies { action } => match action {
            AgencyAction::Refresh => agencies::run_refresh(&cfg).await?,
            AgencyAction::List => agencies::run_list(&cfg).await?,
        },
        Commands::Sync {
            agency,
            per_page,
            workers,
            year,
            start_page,
            reset,
            since,
            until,
            concurrent,
            progress,
        } => {
            let mut opts = IngestOptions::from_config(&cfg.ingest);
            if let Some(n) = per_page {
                opts.per_page = n;
            }
            if let Some(n) = workers {
                opts.workers = n;
            }
            opts.target_year = year;
            opts.start_page = start_page;
            opts.reset = reset;
            opts.range = DateRange::new(since, until);
            opts.concurrent = concurrent;
            ingest::run_sync(&cfg, &agency, &opts, progress.mode()).await?;
        }
        Commands::RetryFailed { agency, progress } => {
            ingest::run_retry_failed(&cfg, &agency, progress.mode()).await?;
        }
        Commands::Metrics { action } => match action {
            MetricsAction::Compute {
                agency,
                since,
                until,
                workers,
                limit,
            } => {
                metrics::run_compute(
                    &cfg,
                    agency.as_deref(),
                    DateRange::new(since, until),
                    workers,
                    limit,
                )
                .await?;
            }
            MetricsAction::Show {
                document,
                since,
                until,
            } => {
                metrics::run_show(&cfg, &document, DateRange::new(since, until)).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
