//! Rolling stock projection per product.
//!
//! Refreshes are driven by the change log: every write that can move a
//! product's availability appends an entry, and a single consumer per shard
//! coalesces them into one recomputation per product and cycle.

pub mod cache;
pub mod compute;

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

use lotsync_core::ProductCode;

use crate::sources::SourceError;
use crate::store::{Shard, StoreError};

pub use cache::StockProjectionCache;
pub use compute::{ProjectionInputs, compute_rows, day_offset, derive_status, horizon};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionConfig {
    pub poll_interval: Duration,
    /// Maximum change-log entries read per cycle.
    pub batch_limit: usize,
    /// Minimum first-week closing stock below which a product is WARNING.
    pub warning_threshold: Decimal,
    pub default_lead_time_days: u32,
    pub shard: Option<Shard>,
    /// Maximum time a product's balance is carried forward by folding ledger
    /// movements before it is re-read in full. Ledger ids are assigned at
    /// insert, so a movement can become visible behind the cursor.
    pub ledger_resync_interval: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_limit: 500,
            warning_threshold: Decimal::ZERO,
            default_lead_time_days: 3,
            shard: None,
            ledger_resync_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    /// Ledger or production schedule could not be read.
    #[error("refresh failed: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl ProjectionError {
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, ProjectionError::Storage(err) if err.is_unavailable())
    }
}

/// What one polling cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub refreshed: Vec<ProductCode>,
    pub entries_processed: usize,
    /// Products whose entries stay unprocessed.
    pub failed: Vec<ProductCode>,
}
