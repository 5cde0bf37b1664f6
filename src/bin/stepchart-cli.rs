//! Stepchart CLI - inspect persisted workflow runs
//!
//! Provides subcommands for initializing a store directory and reading the
//! run records written by `FileSnapshotStore`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use stepchart::RuntimeConfig;
use stepchart::runtime::storage::{init_storage, load_config, write_config};
use stepchart::workflow::{FileSnapshotStore, SnapshotStore};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "stepchart")]
#[command(about = "Inspect durable statechart workflow runs", long_about = None)]
struct Cli {
    /// Root directory for runtime storage
    #[arg(short, long, default_value = ".stepchart")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a store directory
    Init {
        /// Maximum microsteps per macrostep
        #[arg(long, default_value = "10000")]
        max_microsteps: usize,

        /// Retry delay for steps without one, in milliseconds
        #[arg(long, default_value = "1000")]
        retry_delay_ms: u64,
    },

    /// List stored runs of a workflow
    Runs {
        /// Workflow name
        workflow: String,
    },

    /// Print a stored run record
    Show {
        /// Workflow name
        workflow: String,

        /// Run id
        run_id: String,

        /// Only list suspended steps and their branches
        #[arg(long)]
        suspended: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            max_microsteps,
            retry_delay_ms,
        } => {
            let config = RuntimeConfig {
                root: cli.root.clone(),
                max_microsteps,
                default_retry_delay_ms: retry_delay_ms,
                ..RuntimeConfig::default()
            };
            init_storage(&config.root)?;
            write_config(&config)?;
            println!("Initialized stepchart store at {:?}", cli.root);
        }

        Commands::Runs { workflow } => {
            let store = open_store(&cli.root);
            let runs = store.list_runs(&workflow).await?;
            if runs.is_empty() {
                println!("No runs stored for '{}'", workflow);
            }
            for run_id in runs {
                println!("{}", run_id);
            }
        }

        Commands::Show {
            workflow,
            run_id,
            suspended,
        } => {
            let store = open_store(&cli.root);
            let state = store
                .load(&workflow, &run_id)
                .await?
                .with_context(|| format!("Run '{}' of workflow '{}' not found", run_id, workflow))?;

            if suspended {
                if state.suspended_steps.is_empty() {
                    println!("No suspended steps");
                }
                for (step, branch) in &state.suspended_steps {
                    println!("{}  (branch {})", step, branch);
                }
            } else {
                println!("Updated: {}", state.updated_at);
                println!("Steps:");
                for (step, result) in state.results() {
                    println!("  {}  {}", step, serde_json::to_string(&result)?);
                }
                println!("Branches: {}", state.root_snapshot.iter().count() + state.child_states.len());
            }
        }
    }

    Ok(())
}

fn open_store(root: &Path) -> FileSnapshotStore {
    match load_config(root) {
        Ok(config) => FileSnapshotStore::from_config(&config),
        Err(err) => {
            tracing::debug!(error = %err, "no config found, using root directly");
            FileSnapshotStore::new(root)
        }
    }
}
