use thiserror::Error;

use lotsync_backlog::{DeltaKind, LineDelta, LineKey};
use lotsync_core::Quantity;
use lotsync_separation::LotRowKey;

use crate::store::ReconciliationAlert;

use super::{LotCut, ReconcileError};

/// What one applied delta did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub key: LineKey,
    pub declared: DeltaKind,
    /// Kind derived from stored state; `None` when the delta was a no-op.
    pub applied: Option<DeltaKind>,
    pub previous_qty: Quantity,
    pub new_qty: Quantity,
    /// Reductions, in the order they were applied (DECREASE).
    pub cuts: Vec<LotCut>,
    /// Pre-quote rows removed with the line (REMOVE).
    pub deleted: Vec<LotRowKey>,
    pub alerts: Vec<ReconciliationAlert>,
    /// Shortfall no lot could absorb.
    pub unabsorbed: Quantity,
    pub attempts: u32,
}

impl DeltaOutcome {
    pub fn is_noop(&self) -> bool {
        self.applied.is_none()
    }

    pub fn was_reclassified(&self) -> bool {
        self.applied.is_some_and(|kind| kind != self.declared)
    }
}

/// A delta that did not make it, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDelta {
    pub key: String,
    pub reason: String,
}

impl From<&ReconcileError> for SkippedDelta {
    fn from(err: &ReconcileError) -> Self {
        Self {
            key: err.key().to_string(),
            reason: err.to_string(),
        }
    }
}

/// Per-key results of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: Vec<DeltaOutcome>,
    /// Validation failures; skipped for good.
    pub rejected: Vec<SkippedDelta>,
    /// Conflicts that outlived the retry budget. Batch-level warnings.
    pub conflicts: Vec<SkippedDelta>,
    /// Non-fatal storage failures.
    pub failed: Vec<SkippedDelta>,
    /// Timed out; hand back to the feed for the next cycle.
    pub requeued: Vec<LineDelta>,
}

impl BatchReport {
    pub fn alerts_raised(&self) -> usize {
        self.applied.iter().map(|o| o.alerts.len()).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.conflicts.is_empty() && self.failed.is_empty() && self.requeued.is_empty()
    }
}

/// The batch stopped because storage became unavailable.
///
/// `remaining` holds the failing delta and everything after it, untouched.
#[derive(Debug, Error)]
#[error("reconciliation batch aborted after {} applied deltas: {cause}", .report.applied.len())]
pub struct BatchAborted {
    #[source]
    pub cause: ReconcileError,
    pub report: Box<BatchReport>,
    pub remaining: Vec<LineDelta>,
}
