//! # Deskflow CLI (`desk`)
//!
//! The `desk` binary is the primary interface for Deskflow. It provides
//! commands for workspace initialization, intake processing, status
//! inspection, checklist reconciliation, and action management.
//!
//! ## Usage
//!
//! ```bash
//! desk --config ./deskflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `desk init` | Create the workspace skeleton and the SQLite database |
//! | `desk watch` | Watch the holding area and process documents as they land |
//! | `desk process` | One-shot run over the holding area, then exit |
//! | `desk status` | Show record counts per state and documents needing review |
//! | `desk reconcile` | Merge checklist edits with the working database |
//! | `desk retry <doc>` | Requeue a document parked in needs_review |
//! | `desk actions <cmd>` | List or edit extracted commitments |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the workspace
//! desk init --config ./deskflow.toml
//!
//! # Run the pipeline continuously
//! desk watch --config ./deskflow.toml
//!
//! # Drain the holding area once (e.g. from cron)
//! desk process --config ./deskflow.toml
//!
//! # Tick a box in a delivered document, then sync it back
//! desk reconcile --config ./deskflow.toml
//!
//! # Complete an action from the database side
//! desk actions complete 3fa4b2
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use deskflow::report::ReportMode;
use deskflow::{actions, config, db, pipeline, status, sync};

/// Deskflow CLI — a local-first document intake, enrichment, and filing
/// pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file describing the workspace root, the enrichment agent command, and the
/// known entities.
#[derive(Parser)]
#[command(
    name = "desk",
    about = "Deskflow — a local-first document intake, enrichment, and filing pipeline",
    version,
    long_about = "Deskflow watches a holding area for loosely-structured documents (meeting \
    transcripts, notes, reports), classifies them, enriches them through an external agent, \
    files them into a PARA structure, and keeps extracted commitments reconciled between the \
    working database and the delivered documents."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./deskflow.toml")]
    config: PathBuf,

    /// Progress output on stderr: auto, human, json, or off.
    #[arg(long, global = true)]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the workspace and database schema.
    ///
    /// Creates the holding area (Inbox/), the filing structure (Projects/,
    /// Areas/, Resources/, Archive/, Accounts/), the internal state
    /// directory, and all database tables. Idempotent — running it multiple
    /// times is safe.
    Init,

    /// Watch the holding area and process documents as they arrive.
    ///
    /// Runs until interrupted. Files are picked up once they have been
    /// stable for the configured quiet period; in-flight documents from a
    /// previous run are resumed first. A blocking condition (holding area
    /// unreadable, database unreachable) halts intake with an error rather
    /// than silently dropping events.
    Watch,

    /// Process everything currently in the holding area, then exit.
    ///
    /// Picks up resumable records from previous runs as well. Suitable for
    /// cron or manual runs when the continuous watcher is not wanted.
    Process,

    /// Show pipeline status.
    ///
    /// Record counts per state, action totals, and every document waiting in
    /// needs_review together with its failure reason.
    Status,

    /// Reconcile delivered documents' checklists with the working database.
    ///
    /// For each action the side that changed since the last reconciliation
    /// wins; if both sides changed, the later edit wins and the losing value
    /// is logged. A deleted or corrupted checklist block never deletes
    /// database rows.
    Reconcile,

    /// Requeue a document parked in needs_review.
    ///
    /// Accepts a document id prefix or an exact file name. The document
    /// re-enters the pipeline at `classified` with a fresh enrichment retry
    /// budget.
    Retry {
        /// Document id prefix or file name.
        document: String,
    },

    /// Manage extracted commitments.
    Actions {
        #[command(subcommand)]
        action: ActionsAction,
    },
}

/// Action management subcommands.
#[derive(Subcommand)]
enum ActionsAction {
    /// List actions, optionally filtered.
    List {
        /// Filter by status: pending, completed, or cancelled.
        #[arg(long)]
        status: Option<String>,

        /// Filter by source reference prefix (e.g. `Accounts/Acme/`).
        #[arg(long)]
        source: Option<String>,
    },

    /// Mark an action completed (by id prefix).
    Complete { id: String },

    /// Reopen a completed or cancelled action (by id prefix).
    Reopen { id: String },

    /// Cancel an action (by id prefix).
    Cancel { id: String },
}

fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The long-running watcher narrates at info; one-shot commands stay
    // quiet unless RUST_LOG says otherwise.
    match &cli.command {
        Commands::Watch => init_tracing("deskflow=info"),
        _ => init_tracing("deskflow=warn"),
    }

    let cfg = config::load_config(&cli.config)?;
    let mode = ReportMode::from_flag(cli.progress.as_deref());

    match cli.command {
        Commands::Init => {
            db::run_init(&cfg).await?;
            println!("Workspace initialized at {}", cfg.workspace.root.display());
        }
        Commands::Watch => {
            pipeline::run_watch(&cfg, mode).await?;
        }
        Commands::Process => {
            pipeline::run_process(&cfg, mode).await?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
        Commands::Reconcile => {
            let pool = db::connect(&cfg).await?;
            sync::run_reconcile(&cfg, &pool).await?;
            pool.close().await;
        }
        Commands::Retry { document } => {
            pipeline::run_retry(&cfg, &document, mode).await?;
        }
        Commands::Actions { action } => match action {
            ActionsAction::List { status, source } => {
                actions::run_list(&cfg, status, source).await?;
            }
            ActionsAction::Complete { id } => {
                actions::run_complete(&cfg, &id).await?;
            }
            ActionsAction::Reopen { id } => {
                actions::run_reopen(&cfg, &id).await?;
            }
            ActionsAction::Cancel { id } => {
                actions::run_cancel(&cfg, &id).await?;
            }
        },
    }

    Ok(())
}
