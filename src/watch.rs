//! Watch mode.
//!
//! Runs the diff workers and the triage workers as two independent loops
//! over one store. Each loop drains its queue, sleeps for
//! `pipeline.poll_interval_secs`, and repeats until Ctrl-C. Dropping a loop
//! mid-run aborts its workers; an interrupted Version keeps its
//! unprocessed status because the Diff row is written last.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use web_monitoring_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::diff_service::{DiffService, HttpDiffService};
use crate::pipeline::DiffPipeline;
use crate::sqlite_store::SqliteStore;
use crate::triage::Triage;

async fn diff_loop(pipeline: DiffPipeline, interval: Duration) -> Result<()> {
    loop {
        let report = pipeline.run(None).await?;
        if report.processed > 0 {
            tracing::info!(
                created = report.created,
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                "diff pass"
            );
        }
        tokio::time::sleep(interval).await;
    }
}

async fn triage_loop(triage: Triage, interval: Duration) -> Result<()> {
    loop {
        let report = triage.run(None).await?;
        if report.scored + report.failed > 0 {
            tracing::info!(scored = report.scored, failed = report.failed, "triage pass");
        }
        tokio::time::sleep(interval).await;
    }
}

/// Run both worker loops against `store` until Ctrl-C or a fatal error.
pub async fn watch(
    config: &Config,
    store: Arc<dyn Store>,
    service: Arc<dyn DiffService>,
) -> Result<()> {
    let interval = Duration::from_secs(config.pipeline.poll_interval_secs);
    let pipeline = DiffPipeline::from_config(config, Arc::clone(&store), service);
    let triage = Triage::from_config(config, Arc::clone(&store))?;

    tracing::info!(
        workers = config.pipeline.workers,
        interval_secs = config.pipeline.poll_interval_secs,
        scorer = triage.scorer().name(),
        "watching queues"
    );

    tokio::select! {
        result = diff_loop(pipeline, interval) => result,
        result = triage_loop(triage, interval) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping workers");
            Ok(())
        }
    }
}

/// CLI entry point for `wm watch`.
pub async fn run_watch(config: &Config) -> Result<()> {
    let store = Arc::new(SqliteStore::new(db::connect(config).await?));
    let service = Arc::new(HttpDiffService::from_config(&config.diff_service)?);

    let result = watch(config, store.clone(), service).await;
    store.close().await;
    result?;

    println!("ok");
    Ok(())
}
