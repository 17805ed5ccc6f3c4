//! Read-only collaborators consumed by the projection refresh.
//!
//! The stock ledger and the production schedule belong to other systems; the
//! cache only reads them. Both may be unavailable, in which case the refresh
//! fails and the triggering change-log entries stay unprocessed.

pub mod in_memory;
pub mod postgres;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use lotsync_core::ProductCode;

pub use in_memory::{InMemoryLedger, InMemorySchedule};
pub use postgres::{PostgresLedger, PostgresSchedule};

/// Position in the ledger's movement sequence. Strictly increasing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerCursor(pub i64);

/// A signed stock movement (positive = receipt, negative = issue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub cursor: LedgerCursor,
    pub product_code: ProductCode,
    pub quantity: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Balance together with the last movement it includes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LedgerBalance {
    pub balance: Decimal,
    pub cursor: Option<LedgerCursor>,
}

/// Planned production receipt for one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledInflow {
    pub date: NaiveDate,
    pub quantity: Decimal,
}

/// Inclusive date range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("failed to decode source row: {0}")]
    Decode(String),
}

#[async_trait::async_trait]
pub trait StockLedger: Send + Sync {
    /// Movements strictly after `cursor` (all movements when `None`), in order.
    async fn movements_since(
        &self,
        product: &ProductCode,
        cursor: Option<LedgerCursor>,
    ) -> Result<Vec<StockMovement>, SourceError>;

    async fn balance(&self, product: &ProductCode) -> Result<LedgerBalance, SourceError>;
}

#[async_trait::async_trait]
pub trait ProductionSchedule: Send + Sync {
    async fn scheduled_inflow(
        &self,
        product: &ProductCode,
        range: DateRange,
    ) -> Result<Vec<ScheduledInflow>, SourceError>;
}
