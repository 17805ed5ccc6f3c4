//! Storage abstractions.
//!
//! Writes that must be atomic (one reconciliation delta, one lot status change,
//! one preview creation) go through a [`ReconcileTx`] opened with
//! [`Storage::begin`]. Nothing is visible to other readers until
//! [`ReconcileTx::commit`]; dropping the transaction discards it.
//!
//! Reads and writes that stand alone (change-log polling, alert review,
//! projection swaps) are separate traits implemented by the storage itself.
//!
//! Backends:
//! - [`InMemoryStorage`]: staged transactions, optimistic lot versions (tests/dev)
//! - [`PostgresStorage`]: one `sqlx::Transaction` per unit of work

pub mod in_memory;
pub mod postgres;
pub mod records;

use chrono::{DateTime, Utc};
use thiserror::Error;

use lotsync_backlog::{BacklogLine, LineKey};
use lotsync_core::{AlertId, ChangeLogId, DomainError, ExpectedVersion, LotId, OrderNumber, ProductCode, Quantity};
use lotsync_separation::{LotRowKey, SeparationLot};

pub use in_memory::{InMemoryStorage, InMemoryTx};
pub use postgres::{PostgresStorage, PostgresTx};
pub use records::{
    AckOutcome, AlertFilter, ChangeLogEntry, ChangeOperation, HORIZON_DAYS, ProductProjection,
    ProductStockSummary, ReconciliationAlert, RuptureStatus, STATUS_WINDOW_DAYS, Shard, SourceTable,
    StockProjectionRow, product_hash,
};

/// Storage-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend cannot be reached. Fatal for a reconciliation batch.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A row changed since it was read (lost update detected).
    #[error("concurrency conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness or lifecycle rule rejected the write.
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// A stored row could not be mapped back to a domain value.
    #[error("failed to decode row: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Conflict(msg) => StoreError::Conflict(msg),
            DomainError::NotFound => StoreError::NotFound("row".to_string()),
            other => StoreError::Decode(other.to_string()),
        }
    }
}

/// Outcome of [`BacklogStore::upsert_line`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub created: bool,
    /// Zero when the line was created.
    pub previous_qty: Quantity,
}

/// Outcome of [`BacklogStore::remove_line`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub existed: bool,
    pub previous_qty: Quantity,
}

/// Backlog table, accessed inside a unit of work.
#[async_trait::async_trait]
pub trait BacklogStore: Send {
    async fn upsert_line(&mut self, line: BacklogLine) -> Result<UpsertOutcome, StoreError>;

    async fn remove_line(&mut self, key: &LineKey) -> Result<RemoveOutcome, StoreError>;

    async fn get_line(&mut self, key: &LineKey) -> Result<Option<BacklogLine>, StoreError>;
}

/// Separation lot table, accessed inside a unit of work.
///
/// Every returned list is ordered by [`LotRowKey`].
#[async_trait::async_trait]
pub trait SeparationStore: Send {
    /// All lot rows for one backlog line, invoiced ones included.
    async fn lots_for_line(&mut self, key: &LineKey) -> Result<Vec<SeparationLot>, StoreError>;

    /// All rows of one lot.
    async fn lots_for_lot(&mut self, lot_id: &LotId) -> Result<Vec<SeparationLot>, StoreError>;

    async fn lots_for_order(&mut self, order: &OrderNumber) -> Result<Vec<SeparationLot>, StoreError>;

    /// Insert a new row. Fails with `Constraint` on a duplicate key or a
    /// duplicate PREVIEW shipping context.
    async fn insert_lot(&mut self, lot: SeparationLot) -> Result<(), StoreError>;

    /// Persist a mutated row. `expected` is checked against the stored version.
    async fn update_lot(&mut self, lot: &SeparationLot, expected: ExpectedVersion) -> Result<(), StoreError>;

    /// Hard-delete a pre-quote row. Quoted or later rows are refused.
    async fn delete_lot(&mut self, key: &LotRowKey, expected: ExpectedVersion) -> Result<(), StoreError>;
}

/// Atomic unit of work spanning backlog, lots, change log and alerts.
#[async_trait::async_trait]
pub trait ReconcileTx: BacklogStore + SeparationStore + Send {
    async fn append_change(&mut self, entry: ChangeLogEntry) -> Result<(), StoreError>;

    async fn raise_alert(&mut self, alert: ReconciliationAlert) -> Result<(), StoreError>;

    /// Make every staged write visible at once. Fails with `Conflict` when a
    /// lot read by this unit of work was changed by someone else.
    async fn commit(self) -> Result<(), StoreError>;
}

/// Factory for units of work.
#[async_trait::async_trait]
pub trait Storage: Send + Sync + 'static {
    type Tx: ReconcileTx + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// Change-log queue: many producers, one consumer per shard.
#[async_trait::async_trait]
pub trait ChangeLogStore: Send + Sync {
    async fn append(&self, entry: ChangeLogEntry) -> Result<(), StoreError>;

    /// Oldest unprocessed entries first.
    async fn unprocessed(&self, limit: usize, shard: Option<Shard>) -> Result<Vec<ChangeLogEntry>, StoreError>;

    /// Returns how many entries flipped to processed.
    async fn mark_processed(&self, ids: &[ChangeLogId], at: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[async_trait::async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert_alert(&self, alert: ReconciliationAlert) -> Result<(), StoreError>;

    async fn get_alert(&self, id: AlertId) -> Result<Option<ReconciliationAlert>, StoreError>;

    /// Resolve once. Unknown ids are `NotFound`.
    async fn acknowledge(&self, id: AlertId, by: &str, at: DateTime<Utc>) -> Result<AckOutcome, StoreError>;

    /// Unresolved alerts matching `filter`, oldest first.
    async fn list_unresolved(&self, filter: &AlertFilter) -> Result<Vec<ReconciliationAlert>, StoreError>;
}

/// Committed backlog and lot state, as read by the projection refresh.
#[async_trait::async_trait]
pub trait ProjectionSource: Send + Sync {
    async fn lines_for_product(&self, product: &ProductCode) -> Result<Vec<BacklogLine>, StoreError>;

    async fn lots_for_product(&self, product: &ProductCode) -> Result<Vec<SeparationLot>, StoreError>;
}

/// Projection tables. Rows and summary of a product are always swapped together.
#[async_trait::async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Atomically replace the product's rows and summary. A projection older
    /// than the stored one is ignored; returns whether it was written.
    async fn replace_projection(&self, projection: ProductProjection) -> Result<bool, StoreError>;

    async fn load_projection(&self, product: &ProductCode) -> Result<Option<ProductProjection>, StoreError>;

    async fn summaries_by_status(&self, status: RuptureStatus) -> Result<Vec<ProductStockSummary>, StoreError>;
}
