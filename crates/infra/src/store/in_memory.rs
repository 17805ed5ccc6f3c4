//! In-memory storage for tests and local development.
//!
//! A transaction stages its writes privately and reads through them, so a unit
//! of work sees its own changes while other readers keep seeing committed state.
//! Commit takes the table write lock, validates the version of every lot the
//! transaction touched and applies everything in one step.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use lotsync_backlog::{BacklogLine, LineKey};
use lotsync_core::{AlertId, ChangeLogId, ExpectedVersion, LotId, OrderNumber, ProductCode, Quantity};
use lotsync_separation::{LotPhase, LotRowKey, LotStatus, SeparationLot};

use super::{
    AckOutcome, AlertFilter, AlertStore, BacklogStore, ChangeLogEntry, ChangeLogStore,
    ProductProjection, ProductStockSummary, ProjectionSource, ProjectionStore, ReconcileTx,
    ReconciliationAlert, RemoveOutcome, RuptureStatus, SeparationStore, Shard, Storage, StoreError,
    UpsertOutcome,
};

#[derive(Debug, Default)]
struct Tables {
    backlog: BTreeMap<LineKey, BacklogLine>,
    lots: BTreeMap<LotRowKey, SeparationLot>,
    change_log: Vec<ChangeLogEntry>,
    alerts: Vec<ReconciliationAlert>,
}

/// Injected failures, used to exercise outage and conflict handling.
#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    commit_failures: VecDeque<StoreError>,
    commit_delay: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<RwLock<Tables>>,
    projections: Arc<RwLock<HashMap<ProductCode, ProductProjection>>>,
    faults: Arc<Mutex<Faults>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read()
        .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write()
        .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
}

fn check_available(faults: &Mutex<Faults>) -> Result<(), StoreError> {
    let faults = faults
        .lock()
        .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
    if faults.unavailable {
        return Err(StoreError::Unavailable("in-memory storage switched off".to_string()));
    }
    Ok(())
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a backend outage: every operation fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.unavailable = !available;
        }
    }

    /// Make the next commit fail with `err` (queued, one per call).
    pub fn fail_next_commit(&self, err: StoreError) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.commit_failures.push_back(err);
        }
    }

    /// Delay every commit, e.g. to trip a per-delta timeout.
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.commit_delay = delay;
        }
    }

    /// Insert a committed backlog line directly.
    pub fn seed_line(&self, line: BacklogLine) -> Result<(), StoreError> {
        write(&self.tables)?.backlog.insert(line.key.clone(), line);
        Ok(())
    }

    /// Insert a committed lot row directly, as if written by an earlier unit of work.
    pub fn seed_lot(&self, mut lot: SeparationLot) -> Result<(), StoreError> {
        lot.version = lot.version.max(1);
        write(&self.tables)?.lots.insert(lot.key.clone(), lot);
        Ok(())
    }

    pub fn line(&self, key: &LineKey) -> Option<BacklogLine> {
        read(&self.tables).ok()?.backlog.get(key).cloned()
    }

    pub fn lot(&self, key: &LotRowKey) -> Option<SeparationLot> {
        read(&self.tables).ok()?.lots.get(key).cloned()
    }

    pub fn lots(&self) -> Vec<SeparationLot> {
        read(&self.tables)
            .map(|t| t.lots.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn alerts(&self) -> Vec<ReconciliationAlert> {
        read(&self.tables).map(|t| t.alerts.clone()).unwrap_or_default()
    }

    pub fn change_log(&self) -> Vec<ChangeLogEntry> {
        read(&self.tables).map(|t| t.change_log.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Storage for InMemoryStorage {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, StoreError> {
        check_available(&self.faults)?;
        Ok(InMemoryTx {
            tables: self.tables.clone(),
            faults: self.faults.clone(),
            backlog: BTreeMap::new(),
            lots: BTreeMap::new(),
            changes: Vec::new(),
            alerts: Vec::new(),
        })
    }
}

#[derive(Debug)]
struct StagedLot {
    /// Committed version this write is based on; `None` when the row must not exist.
    base_version: Option<u64>,
    /// `None` stages a delete.
    value: Option<SeparationLot>,
}

/// Unit of work over [`InMemoryStorage`]. Dropping it discards every staged write.
#[derive(Debug)]
pub struct InMemoryTx {
    tables: Arc<RwLock<Tables>>,
    faults: Arc<Mutex<Faults>>,
    backlog: BTreeMap<LineKey, Option<BacklogLine>>,
    lots: BTreeMap<LotRowKey, StagedLot>,
    changes: Vec<ChangeLogEntry>,
    alerts: Vec<ReconciliationAlert>,
}

impl InMemoryTx {
    fn visible_line(&self, key: &LineKey) -> Result<Option<BacklogLine>, StoreError> {
        if let Some(staged) = self.backlog.get(key) {
            return Ok(staged.clone());
        }
        Ok(read(&self.tables)?.backlog.get(key).cloned())
    }

    fn visible_lot(&self, key: &LotRowKey) -> Result<Option<SeparationLot>, StoreError> {
        if let Some(staged) = self.lots.get(key) {
            return Ok(staged.value.clone());
        }
        Ok(read(&self.tables)?.lots.get(key).cloned())
    }

    fn visible_lots(&self, wanted: impl Fn(&LotRowKey) -> bool) -> Result<Vec<SeparationLot>, StoreError> {
        let mut merged: BTreeMap<LotRowKey, SeparationLot> = read(&self.tables)?
            .lots
            .iter()
            .filter(|(key, _)| wanted(*key))
            .map(|(key, lot)| (key.clone(), lot.clone()))
            .collect();
        for (key, staged) in self.lots.iter().filter(|(key, _)| wanted(*key)) {
            match &staged.value {
                Some(lot) => merged.insert(key.clone(), lot.clone()),
                None => merged.remove(key),
            };
        }
        Ok(merged.into_values().collect())
    }

    fn base_version(&self, key: &LotRowKey) -> Result<Option<u64>, StoreError> {
        if let Some(staged) = self.lots.get(key) {
            return Ok(staged.base_version);
        }
        Ok(read(&self.tables)?.lots.get(key).map(|lot| lot.version))
    }

    fn current_for_write(&self, key: &LotRowKey, expected: ExpectedVersion) -> Result<SeparationLot, StoreError> {
        let current = self
            .visible_lot(key)?
            .ok_or_else(|| StoreError::NotFound(format!("lot row {key}")))?;
        expected.check(current.version)?;
        Ok(current)
    }
}

#[async_trait::async_trait]
impl BacklogStore for InMemoryTx {
    async fn upsert_line(&mut self, line: BacklogLine) -> Result<UpsertOutcome, StoreError> {
        let previous = self.visible_line(&line.key)?;
        self.backlog.insert(line.key.clone(), Some(line));
        Ok(UpsertOutcome {
            created: previous.is_none(),
            previous_qty: previous.map_or(Quantity::ZERO, |l| l.demanded_qty),
        })
    }

    async fn remove_line(&mut self, key: &LineKey) -> Result<RemoveOutcome, StoreError> {
        let previous = self.visible_line(key)?;
        if previous.is_some() {
            self.backlog.insert(key.clone(), None);
        }
        Ok(RemoveOutcome {
            existed: previous.is_some(),
            previous_qty: previous.map_or(Quantity::ZERO, |l| l.demanded_qty),
        })
    }

    async fn get_line(&mut self, key: &LineKey) -> Result<Option<BacklogLine>, StoreError> {
        self.visible_line(key)
    }
}

#[async_trait::async_trait]
impl SeparationStore for InMemoryTx {
    async fn lots_for_line(&mut self, key: &LineKey) -> Result<Vec<SeparationLot>, StoreError> {
        self.visible_lots(|k| k.order_number == key.order_number && k.product_code == key.product_code)
    }

    async fn lots_for_lot(&mut self, lot_id: &LotId) -> Result<Vec<SeparationLot>, StoreError> {
        self.visible_lots(|k| &k.lot_id == lot_id)
    }

    async fn lots_for_order(&mut self, order: &OrderNumber) -> Result<Vec<SeparationLot>, StoreError> {
        self.visible_lots(|k| &k.order_number == order)
    }

    async fn insert_lot(&mut self, mut lot: SeparationLot) -> Result<(), StoreError> {
        if self.visible_lot(&lot.key)?.is_some() {
            return Err(StoreError::Constraint(format!("lot row {} already exists", lot.key)));
        }
        if lot.status == LotStatus::Preview {
            let context = lot.preview_context();
            let clash = self
                .visible_lots(|k| k.order_number == lot.key.order_number && k.product_code == lot.key.product_code)?
                .iter()
                .any(|other| other.status == LotStatus::Preview && other.preview_context() == context);
            if clash {
                return Err(StoreError::Constraint(format!(
                    "a PREVIEW row already exists for {} with the same shipping context",
                    lot.line_key()
                )));
            }
        }
        let base_version = self.base_version(&lot.key)?;
        lot.version = base_version.map_or(1, |v| v + 1);
        self.lots.insert(
            lot.key.clone(),
            StagedLot {
                base_version,
                value: Some(lot),
            },
        );
        Ok(())
    }

    async fn update_lot(&mut self, lot: &SeparationLot, expected: ExpectedVersion) -> Result<(), StoreError> {
        let current = self.current_for_write(&lot.key, expected)?;
        let base_version = self.base_version(&lot.key)?;
        let mut staged = lot.clone();
        staged.version = current.version;
        self.lots.insert(
            lot.key.clone(),
            StagedLot {
                base_version,
                value: Some(staged),
            },
        );
        Ok(())
    }

    async fn delete_lot(&mut self, key: &LotRowKey, expected: ExpectedVersion) -> Result<(), StoreError> {
        let current = self.current_for_write(key, expected)?;
        if current.phase() != LotPhase::PreQuote {
            return Err(StoreError::Constraint(format!(
                "lot row {key} is {} and cannot be deleted",
                current.status
            )));
        }
        let base_version = self.base_version(key)?;
        self.lots.insert(
            key.clone(),
            StagedLot {
                base_version,
                value: None,
            },
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReconcileTx for InMemoryTx {
    async fn append_change(&mut self, entry: ChangeLogEntry) -> Result<(), StoreError> {
        self.changes.push(entry);
        Ok(())
    }

    async fn raise_alert(&mut self, alert: ReconciliationAlert) -> Result<(), StoreError> {
        self.alerts.push(alert);
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let delay = {
            let mut faults = self
                .faults
                .lock()
                .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
            if faults.unavailable {
                return Err(StoreError::Unavailable("in-memory storage switched off".to_string()));
            }
            if let Some(err) = faults.commit_failures.pop_front() {
                return Err(err);
            }
            faults.commit_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut tables = write(&self.tables)?;
        for (key, staged) in &self.lots {
            let committed = tables.lots.get(key).map(|lot| lot.version);
            if committed != staged.base_version {
                return Err(StoreError::Conflict(format!(
                    "lot row {key} changed concurrently (read {:?}, now {:?})",
                    staged.base_version, committed
                )));
            }
        }

        for (key, staged) in self.lots {
            match staged.value {
                Some(mut lot) => {
                    lot.version = staged.base_version.map_or(1, |v| v + 1);
                    tables.lots.insert(key, lot);
                }
                None => {
                    tables.lots.remove(&key);
                }
            }
        }
        for (key, line) in self.backlog {
            match line {
                Some(line) => tables.backlog.insert(key, line),
                None => tables.backlog.remove(&key),
            };
        }
        tables.change_log.extend(self.changes);
        tables.alerts.extend(self.alerts);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChangeLogStore for InMemoryStorage {
    async fn append(&self, entry: ChangeLogEntry) -> Result<(), StoreError> {
        check_available(&self.faults)?;
        write(&self.tables)?.change_log.push(entry);
        Ok(())
    }

    async fn unprocessed(&self, limit: usize, shard: Option<Shard>) -> Result<Vec<ChangeLogEntry>, StoreError> {
        check_available(&self.faults)?;
        Ok(read(&self.tables)?
            .change_log
            .iter()
            .filter(|e| !e.processed)
            .filter(|e| shard.is_none_or(|s| s.contains(&e.product_code)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, ids: &[ChangeLogId], at: DateTime<Utc>) -> Result<usize, StoreError> {
        check_available(&self.faults)?;
        let mut tables = write(&self.tables)?;
        let mut flipped = 0;
        for entry in tables.change_log.iter_mut() {
            if !entry.processed && ids.contains(&entry.id) {
                entry.processed = true;
                entry.processed_at = Some(at);
                flipped += 1;
            }
        }
        Ok(flipped)
    }
}

#[async_trait::async_trait]
impl AlertStore for InMemoryStorage {
    async fn insert_alert(&self, alert: ReconciliationAlert) -> Result<(), StoreError> {
        check_available(&self.faults)?;
        let mut tables = write(&self.tables)?;
        if tables.alerts.iter().any(|a| a.id == alert.id) {
            return Err(StoreError::Constraint(format!("alert {} already exists", alert.id)));
        }
        tables.alerts.push(alert);
        Ok(())
    }

    async fn get_alert(&self, id: AlertId) -> Result<Option<ReconciliationAlert>, StoreError> {
        check_available(&self.faults)?;
        Ok(read(&self.tables)?.alerts.iter().find(|a| a.id == id).cloned())
    }

    async fn acknowledge(&self, id: AlertId, by: &str, at: DateTime<Utc>) -> Result<AckOutcome, StoreError> {
        check_available(&self.faults)?;
        let mut tables = write(&self.tables)?;
        let alert = tables
            .alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("alert {id}")))?;
        if alert.resolved {
            return Ok(AckOutcome::AlreadyAcknowledged(alert.clone()));
        }
        alert.resolved = true;
        alert.resolved_at = Some(at);
        alert.resolved_by = Some(by.to_string());
        Ok(AckOutcome::Acknowledged(alert.clone()))
    }

    async fn list_unresolved(&self, filter: &AlertFilter) -> Result<Vec<ReconciliationAlert>, StoreError> {
        check_available(&self.faults)?;
        Ok(read(&self.tables)?
            .alerts
            .iter()
            .filter(|a| !a.resolved && filter.matches(a))
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl ProjectionSource for InMemoryStorage {
    async fn lines_for_product(&self, product: &ProductCode) -> Result<Vec<BacklogLine>, StoreError> {
        check_available(&self.faults)?;
        Ok(read(&self.tables)?
            .backlog
            .values()
            .filter(|l| l.product_code() == product)
            .cloned()
            .collect())
    }

    async fn lots_for_product(&self, product: &ProductCode) -> Result<Vec<SeparationLot>, StoreError> {
        check_available(&self.faults)?;
        Ok(read(&self.tables)?
            .lots
            .values()
            .filter(|l| &l.key.product_code == product)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl ProjectionStore for InMemoryStorage {
    async fn replace_projection(&self, projection: ProductProjection) -> Result<bool, StoreError> {
        check_available(&self.faults)?;
        let mut projections = write(&self.projections)?;
        if let Some(existing) = projections.get(projection.product_code()) {
            if existing.summary.refreshed_at > projection.summary.refreshed_at {
                return Ok(false);
            }
        }
        projections.insert(projection.product_code().clone(), projection);
        Ok(true)
    }

    async fn load_projection(&self, product: &ProductCode) -> Result<Option<ProductProjection>, StoreError> {
        check_available(&self.faults)?;
        Ok(read(&self.projections)?.get(product).cloned())
    }

    async fn summaries_by_status(&self, status: RuptureStatus) -> Result<Vec<ProductStockSummary>, StoreError> {
        check_available(&self.faults)?;
        let mut summaries: Vec<ProductStockSummary> = read(&self.projections)?
            .values()
            .filter(|p| p.summary.rupture_status == status)
            .map(|p| p.summary.clone())
            .collect();
        summaries.sort_by(|a, b| a.product_code.cmp(&b.product_code));
        Ok(summaries)
    }
}
