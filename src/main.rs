//! BetterPicks - recommendation pipeline CLI
//!
//! One subcommand per job. Each prints its outcome as pretty JSON and exits
//! non-zero when the run failed.
//!
//! Usage:
//!   betterpicks publish --input slate.json --key nba:pregame:2026-10-17T18
//!   betterpicks ingest-outcomes --input finals.json
//!   betterpicks settle --key nba:settle:2026-10-17
//!   betterpicks stats --as-of 2026-10-18T00:00:00Z
//!   betterpicks resettle --apply
//!   betterpicks runs --key nba:settle:2026-10-17

use anyhow::{Context, Result};
use betterpicks_backend::{
    models::{FinalOutcome, PublishBatch},
    resettle::ResettleMode,
    JobOutcome, Pipeline, PipelineConfig, PipelineResult, Repository, SqliteRepository,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "betterpicks")]
#[command(about = "Driver-based pick publishing, settlement and stats")]
struct Args {
    /// Config file (defaults to BETTERPICKS_CONFIG or betterpicks.toml)
    #[arg(long, env = "BETTERPICKS_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database, overrides the configured path
    #[arg(long, env = "DATABASE_PATH")]
    db: Option<String>,

    /// Debug logging for this crate
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Score subjects and write recommendation cards
    Publish {
        /// JSON publish batch (subjects and/or pre-built cards)
        #[arg(long)]
        input: PathBuf,

        /// Idempotency key for this run window
        #[arg(long)]
        key: Option<String>,
    },

    /// Record final outcomes from a JSON array
    IngestOutcomes {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        key: Option<String>,
    },

    /// Settle pending cards whose subject has a final outcome
    Settle {
        #[arg(long)]
        key: Option<String>,
    },

    /// Recompute performance stats from the full history
    Stats {
        #[arg(long)]
        key: Option<String>,

        /// Window end for rolling periods (RFC 3339), defaults to now
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },

    /// Re-grade settled cards; preview unless --apply
    Resettle {
        #[arg(long)]
        apply: bool,

        #[arg(long)]
        key: Option<String>,
    },

    /// List recent job runs
    Runs {
        #[arg(long)]
        key: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,betterpicks=debug,betterpicks_backend=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::from_env()?,
    };
    if let Some(db) = &args.db {
        config.database_path = db.clone();
    }
    config.validate()?;
    Ok(config)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report<T: Serialize>(outcome: PipelineResult<JobOutcome<T>>) -> Result<bool> {
    match outcome {
        Ok(outcome) => {
            if let JobOutcome::Skipped { key, status } = &outcome {
                info!(key = %key, %status, "Run skipped");
            }
            print_json(&outcome)?;
            Ok(true)
        }
        Err(e) => {
            error!(kind = e.kind(), error = %e, "Run failed");
            print_json(&serde_json::json!({
                "outcome": "failed",
                "kind": e.kind(),
                "error": e.to_string(),
            }))?;
            Ok(false)
        }
    }
}

fn run(args: Args) -> Result<bool> {
    let config = load_config(&args)?;
    let repo = SqliteRepository::open(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path))?;
    let pipeline = Pipeline::new(&repo, &config);

    match args.command {
        Commands::Publish { input, key } => {
            let batch: PublishBatch = read_json(&input)?;
            info!(
                subjects = batch.subjects.len(),
                cards = batch.cards.len(),
                "Publishing batch"
            );
            report(pipeline.publish(&batch, key.as_deref()))
        }
        Commands::IngestOutcomes { input, key } => {
            let outcomes: Vec<FinalOutcome> = read_json(&input)?;
            report(pipeline.ingest_outcomes(&outcomes, key.as_deref()))
        }
        Commands::Settle { key } => report(pipeline.settle(key.as_deref())),
        Commands::Stats { key, as_of } => report(pipeline.recompute_stats(key.as_deref(), as_of)),
        Commands::Resettle { apply, key } => {
            let mode = if apply {
                ResettleMode::Apply
            } else {
                ResettleMode::Preview
            };
            report(pipeline.resettle(mode, key.as_deref()))
        }
        Commands::Runs { key, limit } => {
            let runs = repo.list_job_runs(key.as_deref(), limit)?;
            print_json(&runs)?;
            Ok(true)
        }
    }
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    }
}
