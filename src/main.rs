//! # Code Recall CLI (`recall`)
//!
//! Drives the engine for one workspace per invocation. Every command
//! prints a JSON document on stdout; logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! recall --config ./recall.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `recall index <ws> <roots..>` | Full scan, index and embed |
//! | `recall reindex <ws> <paths..>` | Re-index specific files |
//! | `recall status <ws>` | Print the status snapshot |
//! | `recall query <ws> "<text>"` | Ranked similar chunks |
//! | `recall embed <ws>` | Run the embedding queue |
//! | `recall pause <ws>` / `resume <ws>` | Toggle the pause flag |
//! | `recall rebuild <ws>` | Discard and recreate the store |
//! | `recall backfill <ws>` | Convert legacy vectors |
//! | `recall delete <ws>` | Delete the store |

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use code_recall::config::{self, Config};
use code_recall::engine::Engine;

/// Code Recall: a local-first semantic code index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file falls back to the built-in defaults.
#[derive(Parser)]
#[command(name = "recall", version, about = "Code Recall: a local-first semantic code index")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./recall.toml")]
    config: PathBuf,

    /// Debug logging (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the roots, index every file and run one embedding pass.
    Index {
        workspace: String,
        #[arg(required = true)]
        roots: Vec<PathBuf>,
    },

    /// Re-index specific files (absolute paths or canonical identities).
    Reindex {
        workspace: String,
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Show lifecycle state, flags and counts.
    Status { workspace: String },

    /// Find chunks similar to a piece of text.
    Query {
        workspace: String,
        text: String,

        /// Number of results.
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },

    /// Embed stale chunks within the configured budgets.
    Embed { workspace: String },

    /// Stop write-path work; watcher events keep accumulating.
    Pause {
        workspace: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Clear the pause flag and drain pending events.
    Resume { workspace: String },

    /// Delete the store and recreate an empty schema.
    Rebuild {
        workspace: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Convert legacy JSON vectors to the binary format.
    Backfill { workspace: String },

    /// Delete the workspace's store files.
    Delete { workspace: String },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        tracing::debug!(path = %cli.config.display(), "config file not found; using defaults");
        Config::default()
    };
    let engine = Engine::new(cfg)?;

    match cli.command {
        Commands::Index { workspace, roots } => {
            let status = engine.build_full_index(&workspace, &roots).await?;
            print_json(&status)?;
        }
        Commands::Reindex { workspace, paths } => {
            print_json(&engine.index_paths(&workspace, &paths).await?)?;
        }
        Commands::Status { workspace } => {
            print_json(&engine.get_status(&workspace).await)?;
        }
        Commands::Query {
            workspace,
            text,
            top_k,
        } => {
            print_json(&engine.query_similar(&workspace, &text, top_k).await?)?;
        }
        Commands::Embed { workspace } => {
            print_json(&engine.run_embedding_queue(&workspace).await?)?;
        }
        Commands::Pause { workspace, reason } => {
            print_json(&engine.pause(&workspace, reason.as_deref()).await?)?;
        }
        Commands::Resume { workspace } => {
            print_json(&engine.resume(&workspace).await?)?;
        }
        Commands::Rebuild { workspace, reason } => {
            print_json(&engine.rebuild(&workspace, reason.as_deref()).await?)?;
        }
        Commands::Backfill { workspace } => {
            print_json(&engine.trigger_vector_backfill(&workspace).await?)?;
        }
        Commands::Delete { workspace } => {
            engine.delete_index(&workspace).await?;
            print_json(&serde_json::json!({ "workspace_id": workspace, "deleted": true }))?;
        }
    }

    Ok(())
}
