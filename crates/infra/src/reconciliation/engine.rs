use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use lotsync_backlog::{BacklogLine, DeltaKind, EffectiveChange, LineDelta, LineKey, ValidDelta};
use lotsync_core::{Aggregate, DomainError, ExpectedVersion, Quantity};
use lotsync_separation::{LotCommand, LotPhase, LotStatus, ReduceAllocation, SeparationLot};

use crate::retry::RetryPolicy;
use crate::store::{
    BacklogStore, ChangeLogEntry, ReconcileTx, ReconciliationAlert, SeparationStore, SourceTable, Storage, StoreError,
};

use super::plan::{CutPolicy, plan_cuts};
use super::report::{BatchAborted, BatchReport, DeltaOutcome, SkippedDelta};
use super::ReconcileError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Upper bound for one delta, retries included.
    pub delta_timeout: Duration,
    /// Applied to concurrency conflicts only.
    pub retry: RetryPolicy,
    pub cut_policy: CutPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            delta_timeout: Duration::from_secs(5),
            retry: RetryPolicy::fixed(3, Duration::from_millis(25)),
            cut_policy: CutPolicy::FullDelta,
        }
    }
}

/// Single-writer applier of ERP deltas.
///
/// Deltas of a batch run strictly in order, so a DECREASE sees the line left
/// by an earlier ADD of the same batch. Callers must not run two batches over
/// the same dataset concurrently.
#[derive(Debug)]
pub struct ReconciliationEngine<S: Storage> {
    storage: Arc<S>,
    config: ReconcileConfig,
}

enum ApplyFailure {
    Store(StoreError),
    Domain(DomainError),
}

impl From<StoreError> for ApplyFailure {
    fn from(err: StoreError) -> Self {
        ApplyFailure::Store(err)
    }
}

impl From<DomainError> for ApplyFailure {
    fn from(err: DomainError) -> Self {
        ApplyFailure::Domain(err)
    }
}

impl<S: Storage> ReconciliationEngine<S> {
    pub fn new(storage: Arc<S>, config: ReconcileConfig) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Apply a batch in order.
    ///
    /// Per-delta failures are recorded in the report and the batch moves on.
    /// Storage unavailability stops the batch; nothing after the failing delta
    /// is attempted.
    #[instrument(skip(self, deltas), fields(batch_size = deltas.len()))]
    pub async fn run_batch(&self, deltas: Vec<LineDelta>) -> Result<BatchReport, BatchAborted> {
        let mut report = BatchReport::default();
        let mut pending = deltas.into_iter();

        while let Some(delta) = pending.next() {
            match self.apply_delta(&delta).await {
                Ok(outcome) => report.applied.push(outcome),
                Err(err) if err.is_fatal() => {
                    error!(key = err.key(), error = %err, "storage unavailable; aborting reconciliation batch");
                    let mut remaining = vec![delta];
                    remaining.extend(pending);
                    return Err(BatchAborted {
                        cause: err,
                        report: Box::new(report),
                        remaining,
                    });
                }
                Err(err @ ReconcileError::Validation { .. }) => {
                    warn!(key = err.key(), error = %err, "delta rejected");
                    report.rejected.push(SkippedDelta::from(&err));
                }
                Err(err @ ReconcileError::ConcurrencyConflict { .. }) => {
                    warn!(key = err.key(), error = %err, "delta skipped after repeated conflicts");
                    report.conflicts.push(SkippedDelta::from(&err));
                }
                Err(err @ ReconcileError::Timeout { .. }) => {
                    warn!(key = err.key(), error = %err, "delta timed out; requeued");
                    report.requeued.push(delta);
                }
                Err(err) => {
                    warn!(key = err.key(), error = %err, "delta failed");
                    report.failed.push(SkippedDelta::from(&err));
                }
            }
        }

        info!(
            applied = report.applied.len(),
            rejected = report.rejected.len(),
            conflicts = report.conflicts.len(),
            failed = report.failed.len(),
            requeued = report.requeued.len(),
            alerts = report.alerts_raised(),
            "reconciliation batch finished"
        );
        Ok(report)
    }

    /// Apply one delta in its own unit of work, retrying on conflicts.
    #[instrument(
        skip(self, delta),
        fields(order = %delta.order_number.trim(), product = %delta.product_code.trim(), kind = %delta.kind)
    )]
    pub async fn apply_delta(&self, delta: &LineDelta) -> Result<DeltaOutcome, ReconcileError> {
        let valid = delta.validate().map_err(|source| ReconcileError::Validation {
            key: delta.raw_key(),
            source,
        })?;
        let key = valid.key.to_string();

        match tokio::time::timeout(self.config.delta_timeout, self.apply_with_retry(&valid, &key)).await {
            Ok(result) => result,
            Err(_) => Err(ReconcileError::Timeout {
                key,
                after: self.config.delta_timeout,
            }),
        }
    }

    async fn apply_with_retry(&self, delta: &ValidDelta, key: &str) -> Result<DeltaOutcome, ReconcileError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_apply(delta).await {
                Ok(mut outcome) => {
                    outcome.attempts = attempt;
                    return Ok(outcome);
                }
                Err(ApplyFailure::Store(err)) if err.is_conflict() => {
                    if !self.config.retry.should_retry(attempt) {
                        return Err(ReconcileError::ConcurrencyConflict {
                            key: key.to_string(),
                            attempts: attempt,
                        });
                    }
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    debug!(attempt, ?delay, error = %err, "conflict while applying delta; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(ApplyFailure::Store(source)) => {
                    return Err(ReconcileError::Storage {
                        key: key.to_string(),
                        source,
                    });
                }
                Err(ApplyFailure::Domain(source)) => {
                    return Err(ReconcileError::Validation {
                        key: key.to_string(),
                        source,
                    });
                }
            }
        }
    }

    async fn try_apply(&self, delta: &ValidDelta) -> Result<DeltaOutcome, ApplyFailure> {
        let now = Utc::now();
        let mut tx = self.storage.begin().await?;

        let stored = tx.get_line(&delta.key).await?;
        let previous_qty = stored.as_ref().map_or(Quantity::ZERO, |l| l.demanded_qty);
        let change = delta.effective_change(stored.as_ref().map(|l| l.demanded_qty));
        if let Some(applied) = change.kind() {
            if applied != delta.kind {
                warn!(
                    declared = %delta.kind,
                    applied = %applied,
                    stored = %previous_qty,
                    new_qty = %delta.new_qty,
                    "delta kind disagrees with stored state; re-classified"
                );
            }
        }

        let mut outcome = DeltaOutcome {
            key: delta.key.clone(),
            declared: delta.kind,
            applied: change.kind(),
            previous_qty,
            new_qty: delta.new_qty,
            cuts: Vec::new(),
            deleted: Vec::new(),
            alerts: Vec::new(),
            unabsorbed: Quantity::ZERO,
            attempts: 0,
        };
        let product = delta.key.product_code.clone();

        match change {
            EffectiveChange::Unchanged => {
                debug!("stored state already matches the delta; recording audit entry");
                outcome.new_qty = previous_qty;
                tx.append_change(ChangeLogEntry::audit(product, now)).await?;
            }
            EffectiveChange::Add { new } => {
                tx.upsert_line(next_line(stored, delta, new, now)).await?;
                tx.append_change(ChangeLogEntry::reconcile(SourceTable::Backlog, product, now))
                    .await?;
            }
            EffectiveChange::Increase { old, new } => {
                tx.upsert_line(next_line(stored, delta, new, now)).await?;
                tx.append_change(ChangeLogEntry::reconcile(SourceTable::Backlog, product, now))
                    .await?;
                for lot in active_lots(&mut tx, &delta.key).await? {
                    if lot.phase() == LotPhase::Committed {
                        let alert = ReconciliationAlert::raise(&lot.key, DeltaKind::Increase, old, new, now);
                        tx.raise_alert(alert.clone()).await?;
                        outcome.alerts.push(alert);
                    }
                }
            }
            EffectiveChange::Decrease { new, shortfall, .. } => {
                tx.upsert_line(next_line(stored, delta, new, now)).await?;
                tx.append_change(ChangeLogEntry::reconcile(SourceTable::Backlog, product.clone(), now))
                    .await?;

                let lots = active_lots(&mut tx, &delta.key).await?;
                let amount = self.config.cut_policy.cut_amount(&lots, new, shortfall);
                let plan = plan_cuts(&lots, amount);

                for cut in &plan.cuts {
                    let Some(lot) = lots.iter().find(|l| l.key == cut.key) else {
                        continue;
                    };
                    let expected = ExpectedVersion::Exact(lot.version);
                    if cut.deleted {
                        tx.delete_lot(&cut.key, expected).await?;
                    } else {
                        let mut reduced = lot.clone();
                        reduced.execute(&LotCommand::ReduceAllocation(ReduceAllocation {
                            by: cut.absorbed(),
                            occurred_at: now,
                        }))?;
                        tx.update_lot(&reduced, expected).await?;
                    }
                    tx.append_change(ChangeLogEntry::reconcile(SourceTable::Separation, product.clone(), now))
                        .await?;

                    if cut.raises_alert() {
                        let alert = ReconciliationAlert::raise(&cut.key, DeltaKind::Decrease, cut.before, cut.after, now);
                        tx.raise_alert(alert.clone()).await?;
                        outcome.alerts.push(alert);
                    }
                    debug!(lot = %cut.key, before = %cut.before, after = %cut.after, deleted = cut.deleted, "lot cut");
                }

                if !plan.unabsorbed.is_zero() {
                    debug!(unabsorbed = %plan.unabsorbed, "shortfall larger than allocated quantity");
                }
                outcome.cuts = plan.cuts;
                outcome.unabsorbed = plan.unabsorbed;
            }
            EffectiveChange::Remove { .. } => {
                for lot in active_lots(&mut tx, &delta.key).await? {
                    match lot.phase() {
                        LotPhase::PreQuote => {
                            tx.delete_lot(&lot.key, ExpectedVersion::Exact(lot.version)).await?;
                            tx.append_change(ChangeLogEntry::reconcile(SourceTable::Separation, product.clone(), now))
                                .await?;
                            outcome.deleted.push(lot.key);
                        }
                        LotPhase::Committed => {
                            let alert = ReconciliationAlert::raise(
                                &lot.key,
                                DeltaKind::Remove,
                                lot.allocated_qty,
                                Quantity::ZERO,
                                now,
                            );
                            tx.raise_alert(alert.clone()).await?;
                            outcome.alerts.push(alert);
                        }
                        LotPhase::Closed => {}
                    }
                }
                tx.remove_line(&delta.key).await?;
                tx.append_change(ChangeLogEntry::reconcile(SourceTable::Backlog, product, now))
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }
}

/// Lots of a line that reconciliation may touch (everything but INVOICED).
async fn active_lots<T: SeparationStore>(tx: &mut T, key: &LineKey) -> Result<Vec<SeparationLot>, StoreError> {
    let mut lots = tx.lots_for_line(key).await?;
    lots.retain(|lot| lot.status != LotStatus::Invoiced);
    Ok(lots)
}

/// The line as it should be stored after the delta.
fn next_line(stored: Option<BacklogLine>, delta: &ValidDelta, qty: Quantity, now: DateTime<Utc>) -> BacklogLine {
    let mut line = stored.unwrap_or_else(|| BacklogLine::new(delta.key.clone(), qty, now));
    if let Some(attributes) = &delta.attributes {
        line = line.with_attributes(attributes.clone());
    }
    line.demanded_qty = qty;
    line.updated_at = now;
    line
}
