//! ETL Ingest - incremental pipeline runner

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use etl_common::logging::{init_logging, LogConfig, LogLevel};
use etl_ingest::config::{PipelineConfig, SourcesConfig};
use etl_ingest::db::{self, DbConfig};
use etl_ingest::scheduler::{Scheduler, SourceOutcome};
use etl_ingest::source::build_sources;
use etl_ingest::store::{CheckpointStore, MemoryStore, PgStore, PipelineStore, RunStore};
use etl_ingest::RunOrchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "etl-ingest")]
#[command(author, version, about = "Incremental ETL pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Sources file (overrides ETL_SOURCES_FILE)
    #[arg(long, global = true)]
    sources: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one pass over every source, or a single named source
    Run {
        /// Only run this source
        #[arg(short, long)]
        source: Option<String>,

        /// Use an in-memory store instead of Postgres
        #[arg(long)]
        dry_run: bool,
    },

    /// Run all sources periodically until Ctrl-C
    Schedule {
        /// Seconds between passes (overrides ETL_SCHEDULE_INTERVAL_SECS)
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Apply database migrations
    Migrate,

    /// Show checkpoints and recent runs
    Status {
        /// Number of recent runs to list
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("etl-ingest")
        .build()
        .merge_env()?;

    init_logging(&log_config)?;

    let mut pipeline = PipelineConfig::from_env()?;
    if let Some(sources) = cli.sources {
        pipeline.sources_file = sources;
    }

    match cli.command {
        Command::Run { source, dry_run } => {
            if dry_run {
                info!("Dry run, using in-memory store");
                run_once(Arc::new(MemoryStore::new()), &pipeline, source.as_deref()).await
            } else {
                let store = connect().await?;
                run_once(Arc::new(store), &pipeline, source.as_deref()).await
            }
        },
        Command::Schedule { interval_secs } => {
            if let Some(interval_secs) = interval_secs {
                pipeline.schedule_interval_secs = interval_secs;
            }
            pipeline.validate()?;
            let store = connect().await?;
            schedule(Arc::new(store), &pipeline).await
        },
        Command::Migrate => {
            let pool = db::create_pool(&DbConfig::from_env()?).await?;
            db::run_migrations(&pool).await?;
            info!("Migrations complete");
            Ok(())
        },
        Command::Status { limit } => {
            let store = connect().await?;
            status(&store, limit).await
        },
    }
}

async fn connect() -> Result<PgStore> {
    let pool = db::create_pool(&DbConfig::from_env()?).await?;
    db::health_check(&pool).await?;
    Ok(PgStore::new(pool))
}

fn load_scheduler<S: PipelineStore + 'static>(
    store: Arc<S>,
    pipeline: &PipelineConfig,
) -> Result<Scheduler<S>> {
    let sources = SourcesConfig::load(&pipeline.sources_file)?;
    sources.validate()?;
    if sources.sources.is_empty() {
        warn!(file = %pipeline.sources_file.display(), "No sources configured");
    }

    let clients = build_sources(&sources.sources, pipeline).context("Failed to build sources")?;
    let orchestrator = Arc::new(RunOrchestrator::from_config(store, pipeline));
    Ok(Scheduler::from_config(orchestrator, clients, pipeline))
}

async fn run_once<S: PipelineStore + 'static>(
    store: Arc<S>,
    pipeline: &PipelineConfig,
    source: Option<&str>,
) -> Result<()> {
    let mut scheduler = load_scheduler(store, pipeline)?;

    let outcomes = match source {
        Some(name) => match scheduler.run_one(name).await {
            Some(outcome) => vec![outcome],
            None => bail!("Unknown source: {}", name),
        },
        None => scheduler.run_all().await,
    };

    for outcome in &outcomes {
        print_outcome(outcome);
    }

    let failed = outcomes.iter().filter(|o| o.is_failure()).count();
    if failed > 0 {
        bail!("{} of {} source runs failed", failed, outcomes.len());
    }
    Ok(())
}

async fn schedule<S: PipelineStore + 'static>(store: Arc<S>, pipeline: &PipelineConfig) -> Result<()> {
    let scheduler = load_scheduler(store, pipeline)?;
    let mut handle = scheduler.start();

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Shutdown requested, stopping scheduler");
            handle.abort();
        },
        joined = &mut handle => {
            joined.context("Scheduler task ended unexpectedly")?;
        },
    }

    Ok(())
}

async fn status(store: &PgStore, limit: i64) -> Result<()> {
    let checkpoints = store.list_checkpoints().await?;
    println!("Checkpoints:");
    if checkpoints.is_empty() {
        println!("  (none)");
    }
    for checkpoint in &checkpoints {
        println!(
            "  {}/{}  status={}  watermark={}  runs={}  processed={}  last_run={}",
            checkpoint.source_kind,
            checkpoint.source_name,
            checkpoint.status,
            checkpoint.watermark().unwrap_or("-"),
            checkpoint.total_runs,
            checkpoint.total_records_processed,
            checkpoint
                .last_run_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    let runs = store.recent_runs(limit).await?;
    println!("Recent runs:");
    if runs.is_empty() {
        println!("  (none)");
    }
    for run in &runs {
        println!(
            "  {}  {}/{}  status={}  extracted={}  loaded={}  failed={}  started={}",
            run.run_id,
            run.source_kind,
            run.source_name,
            run.status,
            run.records_extracted,
            run.records_loaded,
            run.records_failed,
            run.started_at.to_rfc3339(),
        );
        if let Some(message) = &run.error_message {
            println!("      error: {}", message);
        }
    }

    Ok(())
}

fn print_outcome(outcome: &SourceOutcome) {
    match &outcome.result {
        Ok(summary) => println!(
            "{}: {}  extracted={}  transformed={}  loaded={}  failed={}  watermark={}  ({:.2}s)",
            outcome.source_name,
            summary.status,
            summary.records_extracted,
            summary.records_transformed,
            summary.records_loaded,
            summary.records_failed,
            summary.watermark_after.as_deref().unwrap_or("-"),
            summary.duration.as_secs_f64(),
        ),
        Err(e) => println!("{}: failed  {}", outcome.source_name, e),
    }
}
