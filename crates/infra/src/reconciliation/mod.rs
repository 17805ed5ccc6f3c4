//! Reconciliation of ERP line deltas against backlog lines and separation lots.
//!
//! Each delta runs in its own unit of work: the backlog line, the affected lot
//! rows, the change-log entries and the alerts are committed together or not at
//! all. Lots that are already quoted are never silently changed; every touch
//! raises a [`ReconciliationAlert`](crate::store::ReconciliationAlert).

pub mod engine;
pub mod plan;
pub mod report;

use std::time::Duration;

use thiserror::Error;

use lotsync_core::DomainError;

use crate::store::StoreError;

pub use engine::{ReconcileConfig, ReconciliationEngine};
pub use plan::{CutPlan, CutPolicy, LotCut, plan_cuts};
pub use report::{BatchAborted, BatchReport, DeltaOutcome, SkippedDelta};

/// Why a single delta was not applied. `key` is `order/product`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Malformed delta or a lifecycle rule refused the change. Skipped, never retried.
    #[error("{key}: rejected: {source}")]
    Validation {
        key: String,
        #[source]
        source: DomainError,
    },

    /// Lots kept changing underneath the delta.
    #[error("{key}: concurrency conflict after {attempts} attempts")]
    ConcurrencyConflict { key: String, attempts: u32 },

    /// Nothing was committed; the delta should be requeued.
    #[error("{key}: timed out after {after:?}")]
    Timeout { key: String, after: Duration },

    #[error("{key}: storage error: {source}")]
    Storage {
        key: String,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    pub fn key(&self) -> &str {
        match self {
            ReconcileError::Validation { key, .. }
            | ReconcileError::ConcurrencyConflict { key, .. }
            | ReconcileError::Timeout { key, .. }
            | ReconcileError::Storage { key, .. } => key,
        }
    }

    /// Storage unavailability ends the whole batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::Storage { source, .. } if source.is_unavailable())
    }
}
