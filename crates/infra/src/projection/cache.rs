use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};

use lotsync_core::{ChangeLogId, ProductCode};

use crate::sources::{LedgerBalance, ProductionSchedule, StockLedger};
use crate::store::{
    ChangeLogEntry, ChangeLogStore, ChangeOperation, ProductProjection, ProductStockSummary,
    ProjectionSource, ProjectionStore, RuptureStatus, SourceTable,
};

use super::compute::{ProjectionInputs, compute_rows, horizon, summarize};
use super::{CycleReport, ProjectionConfig, ProjectionError};

/// Incrementally refreshed 29-day stock projection.
///
/// The cache owns the projection tables. Backlog and lot state are only read.
/// Refreshes of one product are serialized in-process; the store serializes
/// them across processes.
pub struct StockProjectionCache<S, L, P> {
    store: Arc<S>,
    ledger: Arc<L>,
    schedule: Arc<P>,
    config: ProjectionConfig,
    locks: Mutex<HashMap<ProductCode, Arc<tokio::sync::Mutex<()>>>>,
    /// When each product's balance was last read in full by this process.
    full_reads: Mutex<HashMap<ProductCode, Instant>>,
}

impl<S, L, P> core::fmt::Debug for StockProjectionCache<S, L, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StockProjectionCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, L, P> StockProjectionCache<S, L, P>
where
    S: ProjectionSource + ProjectionStore + ChangeLogStore + 'static,
    L: StockLedger + 'static,
    P: ProductionSchedule + 'static,
{
    pub fn new(store: Arc<S>, ledger: Arc<L>, schedule: Arc<P>, config: ProjectionConfig) -> Self {
        Self {
            store,
            ledger,
            schedule,
            config,
            locks: Mutex::new(HashMap::new()),
            full_reads: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }

    /// Queue a refresh of `product` for the next polling cycle.
    ///
    /// Ledger writers call this after recording a movement; the reconciliation
    /// engine writes its entries inside its own unit of work instead.
    pub async fn mark_dirty(&self, product: &ProductCode) -> Result<(), ProjectionError> {
        let entry = ChangeLogEntry::new(
            SourceTable::Ledger,
            ChangeOperation::LedgerMovement,
            product.clone(),
            Utc::now(),
        );
        self.store.append(entry).await?;
        debug!(product = %product, "product marked dirty");
        Ok(())
    }

    /// Recompute and swap the product's projection as of today.
    pub async fn refresh(&self, product: &ProductCode) -> Result<ProductProjection, ProjectionError> {
        self.refresh_as_of(product, Utc::now().date_naive()).await
    }

    /// Recompute and swap the product's projection with day 0 = `today`.
    #[instrument(skip(self), fields(product = %product), err)]
    pub async fn refresh_as_of(
        &self,
        product: &ProductCode,
        today: NaiveDate,
    ) -> Result<ProductProjection, ProjectionError> {
        let lock = self.lock_for(product);
        let _guard = lock.lock().await;

        let previous = self.store.load_projection(product).await?;
        let balance = self.current_balance(product, previous.as_ref().map(|p| &p.summary)).await?;

        let lines = self.store.lines_for_product(product).await?;
        let lots = self.store.lots_for_product(product).await?;
        let inflows = self.schedule.scheduled_inflow(product, horizon(today)).await?;

        let rows = compute_rows(&ProjectionInputs {
            product_code: product,
            today,
            opening_balance: balance.balance,
            lines: &lines,
            lots: &lots,
            inflows: &inflows,
            default_lead_time_days: self.config.default_lead_time_days,
        });
        let summary = summarize(
            product,
            &rows,
            balance.balance,
            balance.cursor,
            self.config.warning_threshold,
            Utc::now(),
        );
        let projection = ProductProjection { summary, rows };

        if !self.store.replace_projection(projection.clone()).await? {
            debug!("a newer projection is already stored; keeping it");
        }
        info!(
            balance = %projection.summary.current_balance,
            status = %projection.summary.rupture_status,
            min_7d = %projection.summary.rupture_prediction_7d,
            "projection refreshed"
        );
        Ok(projection)
    }

    /// Fold new ledger movements into the cached balance when a cursor is
    /// known; otherwise, and at least every `ledger_resync_interval`, read the
    /// full balance.
    async fn current_balance(
        &self,
        product: &ProductCode,
        cached: Option<&ProductStockSummary>,
    ) -> Result<LedgerBalance, ProjectionError> {
        if let Some(summary) = cached {
            if let Some(cursor) = summary.ledger_cursor {
                if !self.resync_due(product) {
                    let movements = self.ledger.movements_since(product, Some(cursor)).await?;
                    let delta: Decimal = movements.iter().map(|m| m.quantity).sum();
                    let cursor = movements.last().map_or(cursor, |m| m.cursor);
                    return Ok(LedgerBalance {
                        balance: summary.current_balance + delta,
                        cursor: Some(cursor),
                    });
                }
            }
        }

        let full = self.ledger.balance(product).await?;
        debug!(product = %product, balance = %full.balance, "ledger balance read in full");
        self.full_reads_guard().insert(product.clone(), Instant::now());
        Ok(full)
    }

    fn resync_due(&self, product: &ProductCode) -> bool {
        self.full_reads_guard()
            .get(product)
            .is_none_or(|at| at.elapsed() >= self.config.ledger_resync_interval)
    }

    fn full_reads_guard(&self) -> std::sync::MutexGuard<'_, HashMap<ProductCode, Instant>> {
        match self.full_reads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_for(&self, product: &ProductCode) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(product.clone()).or_default().clone()
    }

    /// The stored projection; may be stale while refreshes are failing.
    pub async fn projection(&self, product: &ProductCode) -> Result<Option<ProductProjection>, ProjectionError> {
        Ok(self.store.load_projection(product).await?)
    }

    pub async fn summary(&self, product: &ProductCode) -> Result<Option<ProductStockSummary>, ProjectionError> {
        Ok(self.projection(product).await?.map(|p| p.summary))
    }

    pub async fn status(&self, product: &ProductCode) -> Result<Option<RuptureStatus>, ProjectionError> {
        Ok(self.summary(product).await?.map(|s| s.rupture_status))
    }

    pub async fn list_by_status(&self, status: RuptureStatus) -> Result<Vec<ProductStockSummary>, ProjectionError> {
        Ok(self.store.summaries_by_status(status).await?)
    }

    /// One polling cycle: refresh each dirty product once and mark its entries
    /// processed. A product whose refresh fails keeps its entries for the next
    /// cycle.
    #[instrument(skip(self), err)]
    pub async fn process_pending(&self, today: NaiveDate) -> Result<CycleReport, ProjectionError> {
        let entries = self
            .store
            .unprocessed(self.config.batch_limit, self.config.shard)
            .await?;

        let mut by_product: BTreeMap<ProductCode, Vec<ChangeLogId>> = BTreeMap::new();
        for entry in &entries {
            by_product
                .entry(entry.product_code.clone())
                .or_default()
                .push(entry.id);
        }

        let mut report = CycleReport::default();
        for (product, ids) in by_product {
            match self.refresh_as_of(&product, today).await {
                Ok(_) => {
                    report.entries_processed += self.store.mark_processed(&ids, Utc::now()).await?;
                    report.refreshed.push(product);
                }
                Err(err) if err.is_storage_unavailable() => return Err(err),
                Err(err) => {
                    warn!(product = %product, entries = ids.len(), error = %err, "refresh failed; entries left for the next cycle");
                    report.failed.push(product);
                }
            }
        }

        if !entries.is_empty() {
            info!(
                entries = entries.len(),
                refreshed = report.refreshed.len(),
                failed = report.failed.len(),
                "projection cycle finished"
            );
        }
        Ok(report)
    }
}
