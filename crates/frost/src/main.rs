//! Frost: in-process job scheduler
//!
//! Main binary with subcommands:
//! - `run`: Run jobs from a job file on a persistent scheduler
//! - `classify`: Classify an error message
//! - `diagnose`: Produce a diagnosis for an error message
//! - `healing-summary`: Summarize a healing log

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use frost_resilience::{Diagnoser, DiagnosisContext, FailureTaxonomy, HealingLog};

mod functions;
mod jobfile;
mod run;

#[derive(Parser)]
#[command(name = "frost")]
#[command(about = "In-process job scheduler with self-healing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Run {
        /// JSON job file to schedule on startup
        #[arg(long)]
        jobs: Option<PathBuf>,

        /// Where job state is saved and reloaded from
        #[arg(long, env = "FROST_STATE_FILE", default_value = "frost-state.jsonl")]
        state: PathBuf,

        /// Maximum concurrently running jobs
        #[arg(long, env = "FROST_WORKERS", default_value = "4")]
        workers: usize,

        /// Queue poll interval in milliseconds
        #[arg(long, env = "FROST_POLL_INTERVAL_MS", default_value = "100")]
        poll_interval_ms: u64,

        /// Append healing events to this JSON-lines file
        #[arg(long, env = "FROST_HEALING_LOG")]
        healing_log: Option<PathBuf>,

        /// Open a job's circuit after this many consecutive failures
        #[arg(long)]
        circuit_threshold: Option<u32>,

        /// Seconds an open circuit waits before admitting a probe
        #[arg(long, default_value = "30")]
        circuit_cooldown_secs: u64,

        /// Forget finished jobs after this many seconds
        #[arg(long)]
        retention_secs: Option<u64>,
    },

    /// Classify an error message into a failure category
    Classify {
        /// The error message
        message: String,
    },

    /// Diagnose an error message
    Diagnose {
        /// The error message
        message: String,

        /// Resource the failing operation touched
        #[arg(long)]
        resource: Option<String>,

        /// Retries already made
        #[arg(long, default_value = "0")]
        retries: u32,

        /// Jobs that depend on the failing one
        #[arg(long, default_value = "0")]
        dependents: usize,
    },

    /// Print an aggregate view of a healing log
    HealingSummary {
        /// Healing log file
        #[arg(long, env = "FROST_HEALING_LOG")]
        log: PathBuf,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).into_diagnostic()?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "frost=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            jobs,
            state,
            workers,
            poll_interval_ms,
            healing_log,
            circuit_threshold,
            circuit_cooldown_secs,
            retention_secs,
        } => {
            run::run(run::RunConfig {
                jobs,
                state,
                workers,
                poll_interval_ms,
                healing_log,
                circuit_threshold,
                circuit_cooldown_secs,
                retention_secs,
            })
            .await
        }

        Commands::Classify { message } => {
            print_json(&FailureTaxonomy::new().classify_message(&message))
        }

        Commands::Diagnose {
            message,
            resource,
            retries,
            dependents,
        } => {
            let mut context = DiagnosisContext::new()
                .retry_count(retries)
                .dependents(dependents);
            if let Some(resource) = resource {
                context = context.resource(resource);
            }
            print_json(&Diagnoser::new().diagnose_message(&message, Some(&context)))
        }

        Commands::HealingSummary { log } => {
            if !log.exists() {
                return Err(miette::miette!("healing log not found: {}", log.display()));
            }
            let log = HealingLog::open(&log).map_err(|e| miette::miette!("{}", e))?;
            print_json(&log.summary())
        }
    }
}
