//! lotsync worker process.
//!
//! - `lotsync-worker` runs the projection worker until Ctrl-C
//! - `lotsync-worker migrate` applies the schema
//! - `lotsync-worker reconcile <deltas.json>` applies one ERP delta batch;
//!   deltas to resubmit are printed to stdout as JSON

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use lotsync_backlog::LineDelta;
use lotsync_infra::LotsyncConfig;
use lotsync_infra::projection::StockProjectionCache;
use lotsync_infra::reconciliation::ReconciliationEngine;
use lotsync_infra::sources::{PostgresLedger, PostgresSchedule};
use lotsync_infra::store::PostgresStorage;
use lotsync_infra::workers::ProjectionWorker;
use lotsync_observability::LogFormat;

const SCHEMA: &str = include_str!("../../../migrations/0001_lotsync.sql");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    lotsync_observability::init(LogFormat::from_env()?);

    let config = LotsyncConfig::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(config.require_database_url()?)
        .await
        .context("failed to connect to Postgres")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["run"] => run_projection_worker(pool, config).await,
        ["migrate"] => migrate(&pool).await,
        ["reconcile", path] => reconcile(pool, config, Path::new(path)).await,
        other => bail!("unknown command {other:?}; expected run, migrate or reconcile <file>"),
    }
}

async fn run_projection_worker(pool: PgPool, config: LotsyncConfig) -> anyhow::Result<()> {
    let cache = Arc::new(StockProjectionCache::new(
        Arc::new(PostgresStorage::new(pool.clone())),
        Arc::new(PostgresLedger::new(pool.clone())),
        Arc::new(PostgresSchedule::new(pool)),
        config.projection,
    ));
    let handle = ProjectionWorker::spawn("projection", cache);

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    tracing::info!("shutdown requested");

    let stats = handle.stats();
    tracing::info!(
        cycles = stats.cycles(),
        refreshes = stats.refreshes(),
        failed_refreshes = stats.failed_refreshes(),
        failed_cycles = stats.failed_cycles(),
        "projection worker totals"
    );
    handle.shutdown().await;
    Ok(())
}

async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("failed to apply schema")?;
    tracing::info!("schema applied");
    Ok(())
}

async fn reconcile(pool: PgPool, config: LotsyncConfig, path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let batch: Vec<LineDelta> =
        serde_json::from_str(&raw).with_context(|| format!("{} is not a delta batch", path.display()))?;

    let engine = ReconciliationEngine::new(Arc::new(PostgresStorage::new(pool)), config.reconcile);
    let resubmit = match engine.run_batch(batch).await {
        Ok(report) => {
            for skipped in report.rejected.iter().chain(&report.conflicts).chain(&report.failed) {
                tracing::warn!(key = %skipped.key, reason = %skipped.reason, "delta not applied");
            }
            report.requeued
        }
        Err(aborted) => {
            tracing::error!(error = %aborted, remaining = aborted.remaining.len(), "batch aborted");
            let mut resubmit = aborted.report.requeued;
            resubmit.extend(aborted.remaining);
            resubmit
        }
    };

    if !resubmit.is_empty() {
        println!("{}", serde_json::to_string_pretty(&resubmit)?);
    }
    Ok(())
}
