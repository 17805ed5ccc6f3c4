//! Exposed write path for lot lifecycle changes made outside reconciliation.
//!
//! A lot spans several lot rows; a status change applies to all of them in one
//! unit of work or to none.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, instrument};

use lotsync_core::{Aggregate, DomainError, ExpectedVersion, LotId, ProductCode};
use lotsync_separation::{AdvanceStatus, LotCommand, LotStatus, MarkReturnedToYard, SeparationLot};

use crate::store::{ChangeLogEntry, ChangeOperation, ReconcileTx, SeparationStore, SourceTable, Storage, StoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuotingError {
    #[error("lot {lot_id}: invalid transition from {from} to {to}")]
    InvalidTransition { lot_id: LotId, from: String, to: String },

    #[error("lot {0} not found")]
    NotFound(LotId),

    /// The lot's rows do not agree with the request (e.g. one row is frozen).
    #[error("lot {lot_id}: {reason}")]
    Rejected { lot_id: LotId, reason: String },

    /// Someone else changed the lot since it was read; reload and retry.
    #[error("lot {0} changed concurrently")]
    Conflict(LotId),

    #[error(transparent)]
    Storage(StoreError),
}

impl QuotingError {
    fn from_domain(lot_id: &LotId, err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { from, to } => QuotingError::InvalidTransition {
                lot_id: lot_id.clone(),
                from,
                to,
            },
            DomainError::NotFound => QuotingError::NotFound(lot_id.clone()),
            DomainError::Conflict(_) => QuotingError::Conflict(lot_id.clone()),
            other => QuotingError::Rejected {
                lot_id: lot_id.clone(),
                reason: other.to_string(),
            },
        }
    }

    fn from_store(lot_id: &LotId, err: StoreError) -> Self {
        match err {
            StoreError::Conflict(_) => QuotingError::Conflict(lot_id.clone()),
            StoreError::NotFound(_) => QuotingError::NotFound(lot_id.clone()),
            other => QuotingError::Storage(other),
        }
    }
}

#[derive(Debug)]
pub struct QuotingService<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> QuotingService<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Move every row of `lot_id` from `from` to `to`.
    ///
    /// Only the single forward step of the lifecycle is accepted; anything else
    /// fails with `InvalidTransition` and changes nothing.
    #[instrument(skip(self), fields(lot_id = %lot_id, from = %from, to = %to), err)]
    pub async fn advance_status(
        &self,
        lot_id: &LotId,
        from: LotStatus,
        to: LotStatus,
    ) -> Result<Vec<SeparationLot>, QuotingError> {
        LotStatus::check_transition(from, to).map_err(|err| QuotingError::from_domain(lot_id, err))?;
        let now = Utc::now();
        let command = LotCommand::AdvanceStatus(AdvanceStatus {
            from,
            to,
            occurred_at: now,
        });
        let rows = advance_lot_rows(self.storage.as_ref(), lot_id, &command, now).await?;
        info!(rows = rows.len(), "lot status advanced");
        Ok(rows)
    }

    /// Flag a SHIPPED lot whose invoice was issued but whose cargo never left.
    #[instrument(skip(self), fields(lot_id = %lot_id), err)]
    pub async fn mark_returned_to_yard(&self, lot_id: &LotId) -> Result<Vec<SeparationLot>, QuotingError> {
        let now = Utc::now();
        let command = LotCommand::MarkReturnedToYard(MarkReturnedToYard { occurred_at: now });
        let rows = advance_lot_rows(self.storage.as_ref(), lot_id, &command, now).await?;
        info!(rows = rows.len(), "lot returned to yard");
        Ok(rows)
    }
}

/// Apply `command` to every row of `lot_id` in one unit of work and append one
/// STATUS_CHANGE entry per product touched.
pub(crate) async fn advance_lot_rows<S: Storage>(
    storage: &S,
    lot_id: &LotId,
    command: &LotCommand,
    now: DateTime<Utc>,
) -> Result<Vec<SeparationLot>, QuotingError> {
    let mut tx = storage
        .begin()
        .await
        .map_err(|err| QuotingError::from_store(lot_id, err))?;
    let rows = tx
        .lots_for_lot(lot_id)
        .await
        .map_err(|err| QuotingError::from_store(lot_id, err))?;
    if rows.is_empty() {
        return Err(QuotingError::NotFound(lot_id.clone()));
    }

    let mut updated = Vec::with_capacity(rows.len());
    let mut products: BTreeSet<ProductCode> = BTreeSet::new();
    for row in rows {
        let mut next = row.clone();
        next.execute(command)
            .map_err(|err| QuotingError::from_domain(lot_id, err))?;
        tx.update_lot(&next, ExpectedVersion::Exact(row.version))
            .await
            .map_err(|err| QuotingError::from_store(lot_id, err))?;
        products.insert(next.key.product_code.clone());
        updated.push(next);
    }

    for product in products {
        let entry = ChangeLogEntry::new(SourceTable::Separation, ChangeOperation::StatusChange, product, now);
        tx.append_change(entry)
            .await
            .map_err(|err| QuotingError::from_store(lot_id, err))?;
    }
    tx.commit().await.map_err(|err| QuotingError::from_store(lot_id, err))?;

    for row in &mut updated {
        row.version += 1;
    }
    Ok(updated)
}
