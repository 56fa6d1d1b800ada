mod config;
mod evaluator;
mod executor;
mod harness;
mod literal;
mod offline;
mod orchestrator;
#[cfg(test)]
mod testing;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{RunTasksArgs, VerifyArgs};
use executor::Executor;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use verifier_common::redis::RedisStore;
use verifier_common::Store;

#[derive(Parser)]
#[command(name = "verifier")]
#[command(about = "Verify generated solutions against their problems' test cases", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify candidates in the store, or dump/ingest offline task files
    Verify(VerifyArgs),

    /// Process one shard of an offline task file
    RunTasks(RunTasksArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Verify(args) => verify(args).await,
        Commands::RunTasks(args) => run_tasks(args).await,
    }
}

async fn verify(args: VerifyArgs) -> anyhow::Result<()> {
    args.validate()?;

    let store: Arc<dyn Store> = Arc::new(
        RedisStore::connect(&args.store.redis_url)
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", args.store.redis_url))?,
    );
    info!(redis_url = %args.store.redis_url, "Connected to Redis");

    if let Some(path) = &args.dump_tasks {
        let settings = args.dump_settings(harness::IMPORT_PRELUDE);
        let count = offline::dump_tasks(store, &settings, path).await?;
        info!(tasks = count, path = %path.display(), "Offline tasks ready");
        return Ok(());
    }

    if !args.ingest_results.is_empty() {
        let summary = offline::ingest_results(
            store,
            &args.ingest_results,
            args.batch_size,
            args.dryrun,
            args.failure_log.as_deref(),
        )
        .await?;
        info!(
            records = summary.processed,
            written = summary.written,
            deferred = summary.deferred,
            write_errors = summary.write_errors,
            "Ingest complete"
        );
        return Ok(());
    }

    let runner = args.runner.build_runner()?;
    let executor = Arc::new(
        Executor::new(runner, args.runner.limits()).with_language(args.runner.language.clone()),
    );
    let settings = args.orchestrator_settings();

    until_shutdown(async {
        orchestrator::run_online(store, executor, &settings).await?;
        Ok::<_, anyhow::Error>(())
    })
    .await
}

async fn run_tasks(args: RunTasksArgs) -> anyhow::Result<()> {
    args.validate()?;

    let runner = args.runner.build_runner()?;
    let executor = Arc::new(
        Executor::new(runner, args.runner.limits()).with_language(args.runner.language.clone()),
    );
    info!(
        rank = args.rank,
        world_size = args.world_size,
        language = %executor.language(),
        "Offline worker configured"
    );

    until_shutdown(async {
        offline::run_shard(
            executor,
            &args.tasks,
            args.rank,
            args.world_size,
            &args.output_dir,
            args.concurrency,
        )
        .await?;
        Ok::<_, anyhow::Error>(())
    })
    .await
}

/// Run `work` until it finishes or Ctrl-C arrives. Verdicts not yet written
/// stay pending in the store and are picked up by the next run.
async fn until_shutdown<F>(work: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => warn!("Received shutdown signal, stopping"),
            Err(e) => {
                error!(error = %e, "Failed to install Ctrl-C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = work => result,
        _ = shutdown => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}
