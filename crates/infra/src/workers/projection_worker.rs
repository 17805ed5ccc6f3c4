use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::projection::StockProjectionCache;
use crate::sources::{ProductionSchedule, StockLedger};
use crate::store::{ChangeLogStore, ProjectionSource, ProjectionStore};

/// Counters shared between a worker and its handle.
#[derive(Debug, Default)]
pub struct WorkerStats {
    cycles: AtomicU64,
    refreshes: AtomicU64,
    failed_refreshes: AtomicU64,
    failed_cycles: AtomicU64,
}

impl WorkerStats {
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn failed_refreshes(&self) -> u64 {
        self.failed_refreshes.load(Ordering::Relaxed)
    }

    pub fn failed_cycles(&self) -> u64 {
        self.failed_cycles.load(Ordering::Relaxed)
    }
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A cycle in progress is finished first.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "projection worker task panicked");
            }
        }
    }
}

/// Change-log consumer driving [`StockProjectionCache`] refreshes.
///
/// - Polls every `poll_interval` (missed ticks are delayed, not bursted)
/// - Refreshes each dirty product once per cycle
/// - Failed cycles are logged and retried on the next tick
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    /// Spawn the polling loop on the current tokio runtime.
    pub fn spawn<S, L, P>(name: &'static str, cache: Arc<StockProjectionCache<S, L, P>>) -> WorkerHandle
    where
        S: ProjectionSource + ProjectionStore + ChangeLogStore + 'static,
        L: StockLedger + 'static,
        P: ProductionSchedule + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(WorkerStats::default());
        let poll_interval = cache.config().poll_interval;

        let join = tokio::spawn(worker_loop(name, cache, poll_interval, shutdown_rx, stats.clone()));

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

async fn worker_loop<S, L, P>(
    name: &'static str,
    cache: Arc<StockProjectionCache<S, L, P>>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<WorkerStats>,
) where
    S: ProjectionSource + ProjectionStore + ChangeLogStore + 'static,
    L: StockLedger + 'static,
    P: ProductionSchedule + 'static,
{
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(worker = name, ?poll_interval, "projection worker started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // Sender dropped counts as shutdown too.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                stats.cycles.fetch_add(1, Ordering::Relaxed);
                match cache.process_pending(Utc::now().date_naive()).await {
                    Ok(report) => {
                        stats.refreshes.fetch_add(report.refreshed.len() as u64, Ordering::Relaxed);
                        stats.failed_refreshes.fetch_add(report.failed.len() as u64, Ordering::Relaxed);
                        debug!(worker = name, refreshed = report.refreshed.len(), "cycle done");
                    }
                    Err(err) => {
                        stats.failed_cycles.fetch_add(1, Ordering::Relaxed);
                        warn!(worker = name, error = %err, "projection cycle failed");
                    }
                }
            }
        }
    }

    info!(worker = name, cycles = stats.cycles(), "projection worker stopped");
}
