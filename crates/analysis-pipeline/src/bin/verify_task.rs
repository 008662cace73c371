//! Judge an answer to a tactics task with the engine and record it.
//!
//! Usage:
//!   cargo run -p analysis-pipeline --bin verify-task -- <task_id> <uci_move>
//!
//! Set DATABASE_URL env var or use .env file. Engine settings and
//! thresholds come from the same variables as the worker.

use std::sync::Arc;

use anyhow::Context;

use analysis_pipeline::{EnginePool, PgStore, Pipeline, PipelineConfig, StockfishFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let (Some(task_id), Some(proposed)) = (args.get(1), args.get(2)) else {
        anyhow::bail!("usage: verify-task <task_id> <uci_move>");
    };
    let task_id: i64 = task_id
        .parse()
        .with_context(|| format!("task id '{task_id}' is not a number"))?;

    let db_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set (or use .env file)")?;
    let db = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&db_url)
        .await?;

    let mut config = PipelineConfig::from_env()?;
    // Two searches at most
    config.engine.pool_size = 1;

    let engines = EnginePool::from_settings(StockfishFactory::new(&config.engine), &config.engine);
    let pipeline = Pipeline::new(Arc::new(PgStore::new(db)), Arc::new(engines), Arc::new(config));

    let result = pipeline.verify_task_answer(task_id, proposed).await;
    pipeline.shutdown().await;
    let answer = result?;

    println!("{}", serde_json::to_string_pretty(&answer)?);
    Ok(())
}
