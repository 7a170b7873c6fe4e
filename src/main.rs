//! rowttl: runs row-level TTL jobs and inspects their progress.
//!
//! `run` seeds an in-memory table, runs one TTL processor over it and
//! persists the job's progress in the file-backed job registry.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::Configuration;
use tokio_util::sync::CancellationToken;
use ttljob::testing::MemoryTable;
use ttljob::{
    FileJobRegistry, JobId, JobRegistry, ProcessorContext, RowLevelTtlDetails, TtlAggMetrics,
    TtlProcessor, TtlSettings, TtlSpec,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Row-level TTL job runner", long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a TTL job against a seeded in-memory table
    Run {
        #[arg(long, default_value_t = 1, help = "Job ID to record progress under")]
        job_id: i64,

        #[arg(long, default_value_t = 10_000, help = "Rows to seed, keyed 1..=N")]
        rows: i64,

        #[arg(long, default_value_t = 2_500, help = "Leading rows that are already expired")]
        expired: usize,

        #[arg(long, default_value_t = 4, help = "Number of spans to split the table into")]
        spans: usize,

        #[arg(long, default_value_t = 1, help = "Processor ID recorded in progress")]
        processor_id: i32,
    },
    /// Show the persisted progress of a job
    Progress {
        #[arg(long, help = "Job ID to inspect")]
        job_id: i64,
    },
    #[command(flatten)]
    Common(CommonCommands),
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

async fn run_job(
    config: &Configuration,
    job_id: JobId,
    rows: i64,
    expired: usize,
    spans: usize,
    processor_id: i32,
) -> Result<()> {
    config.ttl.validate().context("Invalid TTL configuration")?;

    let table = Arc::new(MemoryTable::with_int_keys(1..=rows, expired));
    let desc = table.descriptor();
    log::info!(
        "Seeded {} with {} rows, {} expired",
        desc.relation_name(),
        table.row_count(),
        expired.min(table.row_count())
    );

    let registry = Arc::new(FileJobRegistry::new(&config.jobs.registry_dir));
    registry
        .register_job(job_id)
        .await
        .context("Failed to register TTL job")?;

    let details = RowLevelTtlDetails {
        cutoff: table.cutoff(),
        table_id: desc.id,
        table_version: desc.version,
    };
    let spec = TtlSpec::from_config(&config.ttl, job_id, details, table.split_spans(spans));
    let processor = TtlProcessor::new(spec, table.clone(), table.clone(), registry.clone())
        .with_context(ProcessorContext {
            processor_id,
            sql_instance_id: config.node.sql_instance_id,
            worker_concurrency: config.ttl.worker_concurrency,
        })
        .with_settings(TtlSettings::from_config(&config.ttl))
        .with_metrics(TtlAggMetrics::new());

    let cancel = CancellationToken::new();
    let shutdown = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(()) => cancel.cancel(),
                Err(e) => log::warn!("Shutdown signal handler unavailable: {e:#}"),
            }
        })
    };

    let result = processor.run(cancel).await;
    shutdown.abort();

    match result {
        Ok(report) => {
            log::info!(
                "TTL job {} deleted {} rows over {} spans with {} workers",
                job_id,
                report.rows_deleted,
                report.span_count,
                report.concurrency
            );
            println!(
                "Job {job_id}: deleted {} rows, {} rows remain",
                report.rows_deleted,
                table.row_count()
            );
            Ok(())
        }
        Err(e) => {
            log::error!(
                "TTL job {} failed (retryable: {}): {}",
                job_id,
                e.is_retryable(),
                e
            );
            Err(e).context("TTL job failed")
        }
    }
}

async fn show_progress(config: &Configuration, job_id: JobId) -> Result<()> {
    let registry = FileJobRegistry::new(&config.jobs.registry_dir);
    let job = registry
        .load_job(job_id)
        .await
        .context("Failed to load job record")?
        .with_context(|| format!("Job {job_id} not found in {}", config.jobs.registry_dir))?;
    let json = serde_json::to_string_pretty(&job).context("Failed to serialize job record")?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;

    match cli.command {
        Command::Run {
            job_id,
            rows,
            expired,
            spans,
            processor_id,
        } => run_job(&config, JobId(job_id), rows, expired, spans, processor_id).await,
        Command::Progress { job_id } => show_progress(&config, JobId(job_id)).await,
        Command::Common(command) => utils::handle_common_command(&command, &config),
    }
}
