//! # Task Harness CLI (`taskh`)
//!
//! ## Usage
//!
//! ```bash
//! taskh --config ./config/taskh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `taskh init` | Create the SQLite database and run schema migrations |
//! | `taskh sync` | Run one ingestion from the configured source |
//! | `taskh search "<query>"` | Semantic search over indexed tasks |
//! | `taskh status` | Row counts and last run time |
//! | `taskh serve` | Start the HTTP server |
//!
//! `taskh sync` exits non-zero when the run ends in the error state.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use task_harness::progress::ProgressMode;
use task_harness::search::SearchOptions;
use task_harness::{config, ingest, logging, migrate, search, server, status};

#[derive(Parser)]
#[command(
    name = "taskh",
    about = "Task Harness — incremental task ingestion and semantic indexing",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/taskh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Run one ingestion: fetch, enrich changed tasks, store, delete.
    Sync {
        /// Fetch and compare fingerprints without enriching or writing.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr. Defaults to human on a TTY, else none.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Search indexed tasks by meaning.
    Search {
        query: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Restrict to one project id.
        #[arg(long)]
        project: Option<String>,

        /// Minimum priority (1 = low … 4 = urgent).
        #[arg(long)]
        min_priority: Option<u8>,

        /// Include completed tasks.
        #[arg(long)]
        include_completed: bool,
    },

    /// Show repository and index statistics.
    Status,

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_tracing(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync { dry_run, progress } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let reporter = mode.reporter();
            let summary = ingest::run_sync(&cfg, dry_run, reporter.as_ref()).await?;
            if !summary.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Search {
            query,
            limit,
            project,
            min_priority,
            include_completed,
        } => {
            let options = SearchOptions {
                limit,
                project_id: project,
                min_priority,
                include_completed,
            };
            search::run_search(&cfg, &query, &options).await?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
