//! Analysis worker
//!
//! Pulls analysis jobs from SQS and runs them through the pipeline with a
//! shared pool of native Stockfish processes.

mod sqs;

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use analysis_pipeline::{
    EnginePool, PgStore, Pipeline, PipelineError, ReanalyseOptions, RunOptions, StockfishFactory,
    WorkerConfig,
};

use crate::sqs::{AnalysisJob, SqsClient, SqsMessage};

type WorkerPipeline = Pipeline<PgStore, StockfishFactory>;

/// Parse --games 123,456,789 from CLI args
fn parse_local_games() -> Option<Vec<i64>> {
    let args: Vec<String> = std::env::args().collect();
    let pos = args.iter().position(|a| a == "--games")?;
    let ids: Vec<i64> = args
        .get(pos + 1)?
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    (!ids.is_empty()).then_some(ids)
}

/// Errors that redelivery cannot fix
fn is_permanent(e: &PipelineError) -> bool {
    matches!(
        e,
        PipelineError::GameNotFound(_) | PipelineError::InvalidPosition(_)
    )
}

async fn run_job(pipeline: &WorkerPipeline, job: &AnalysisJob) -> Result<(), PipelineError> {
    let report = if job.reanalyse {
        pipeline
            .reanalyse(
                job.game_id,
                ReanalyseOptions {
                    clear_tasks: job.clear_tasks,
                    deep: job.deep,
                },
            )
            .await?
    } else {
        pipeline
            .run_analysis(job.game_id, RunOptions { deep: job.deep })
            .await?
    };

    info!(
        game_id = report.game_id,
        state = report.state.as_str(),
        highlights = report.highlights,
        tasks_created = report.tasks_created,
        missing_fast = report.missing_fast,
        missing_deep = report.missing_deep,
        "Analysis complete"
    );
    Ok(())
}

async fn handle_message(pipeline: WorkerPipeline, sqs: SqsClient, msg: SqsMessage) {
    let job = match AnalysisJob::parse(&msg.body) {
        Ok(job) => job,
        Err(e) => {
            warn!(body = %msg.body, error = %e, "Invalid job format, deleting message");
            let _ = sqs.delete_message(&msg.receipt_handle).await;
            return;
        }
    };

    match run_job(&pipeline, &job).await {
        Ok(()) => {
            let _ = sqs.delete_message(&msg.receipt_handle).await;
        }
        Err(e) if is_permanent(&e) => {
            warn!(game_id = job.game_id, error = %e, "Job cannot succeed, deleting message");
            let _ = sqs.delete_message(&msg.receipt_handle).await;
        }
        Err(e) => {
            error!(game_id = job.game_id, error = %e, "Analysis failed");
            // Don't delete - will retry via visibility timeout
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Load .env file for local dev
    let _ = dotenvy::dotenv();

    let local_games = parse_local_games();
    if local_games.is_some() {
        // Local runs read DATABASE_URL directly and never touch SQS
        std::env::set_var("LOCAL_DEV", "1");
        std::env::set_var("SQS_QUEUE_URL", "unused");
    }

    // Load config (fetches DB URL from Secrets Manager in prod)
    let config = WorkerConfig::load().await?;
    let settings = &config.pipeline.engine;
    info!(
        stockfish_path = %settings.path,
        pool_size = settings.pool_size,
        fast_ms = settings.fast.movetime_ms,
        deep_ms = settings.deep.movetime_ms,
        "Worker config loaded"
    );

    let workers = settings.pool_size;
    let db_pool_size = (workers + 2) as u32; // headroom for overlapping saves
    let db = PgPoolOptions::new()
        .max_connections(db_pool_size)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .connect(&config.database_url)
        .await?;
    info!(db_pool_size, "Database connection pool established");

    let engines = EnginePool::from_settings(StockfishFactory::new(settings), settings);
    let pipeline: WorkerPipeline = Pipeline::new(
        Arc::new(PgStore::new(db)),
        Arc::new(engines),
        Arc::new(config.pipeline.clone()),
    );

    // --games mode: analyse the listed games and exit
    if let Some(game_ids) = local_games {
        let mut failed = 0u32;
        for &game_id in &game_ids {
            let job = AnalysisJob {
                game_id,
                deep: true,
                reanalyse: false,
                clear_tasks: false,
            };
            if let Err(e) = run_job(&pipeline, &job).await {
                error!(game_id, error = %e, "Analysis failed");
                failed += 1;
            }
        }
        pipeline.shutdown().await;
        info!(games = game_ids.len(), failed, "Local run finished");
        return Ok(());
    }

    let sqs = SqsClient::new(&config).await?;
    info!(queue_url = %config.sqs_queue_url, "SQS client ready");

    // One job per engine session
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut empty_receives = 0;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(not(unix))]
    let mut sigterm = std::future::pending::<()>();

    info!("Starting main loop");

    loop {
        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = &mut sigterm;

        let messages = tokio::select! {
            _ = terminate => {
                info!("Received SIGTERM, waiting for in-flight work...");
                break;
            }
            result = sqs.receive_messages() => result,
        };

        let messages = match messages {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "Failed to receive messages");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        if messages.is_empty() {
            empty_receives += 1;
            if empty_receives >= config.max_empty_receives {
                info!("No messages after {} polls, exiting", config.max_empty_receives);
                break;
            }
            continue;
        }
        empty_receives = 0;

        // Collect all available messages (SQS may distribute across servers)
        let mut all_messages = messages;
        while all_messages.len() < workers {
            match sqs.receive_messages_nowait().await {
                Ok(more) if !more.is_empty() => all_messages.extend(more),
                _ => break,
            }
        }

        for msg in all_messages {
            let permit = semaphore.clone().acquire_owned().await?;
            let pipeline = pipeline.clone();
            let sqs = sqs.clone();
            tokio::spawn(async move {
                let _permit = permit; // Hold until done
                handle_message(pipeline, sqs, msg).await;
            });
        }
    }

    // Acquire all permits = wait for all jobs to complete
    let _drained = semaphore.acquire_many(workers as u32).await?;
    info!("Shutting down Stockfish engines");
    pipeline.shutdown().await;
    info!("Graceful shutdown complete");

    Ok(())
}
