//! Planner-side lot creation: splitting backlog lines into PREVIEW lots.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument};

use lotsync_backlog::LineKey;
use lotsync_core::{DomainError, LotId, OrderNumber, ProductCode, Quantity};
use lotsync_separation::{
    AdvanceStatus, LotCommand, LotStatus, OrderLotSummary, SeparationLot, summarize_by_order,
};

use crate::quoting::{QuotingError, advance_lot_rows};
use crate::store::{
    BacklogStore, ChangeLogEntry, ChangeOperation, ReconcileTx, SeparationStore, SourceTable, Storage, StoreError,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("invalid allocation: {0}")]
    Validation(String),

    #[error("backlog line {0} not found")]
    LineNotFound(LineKey),

    #[error("{key}: requested {requested} but only {available} is unallocated")]
    OverAllocation {
        key: LineKey,
        requested: Quantity,
        available: Quantity,
    },

    /// Duplicate row or duplicate PREVIEW shipping context.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Quoting(#[from] QuotingError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<DomainError> for PlanningError {
    fn from(err: DomainError) -> Self {
        PlanningError::Validation(err.to_string())
    }
}

fn store_error(err: StoreError) -> PlanningError {
    match err {
        StoreError::Constraint(msg) => PlanningError::Rejected(msg),
        other => PlanningError::Storage(other),
    }
}

#[derive(Debug)]
pub struct LotPlanner<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> LotPlanner<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Create PREVIEW rows of `lot_id`, one per allocation.
    ///
    /// Each row snapshots the line's scheduling and derives weight, pallets
    /// and value from the line's unit metrics. The whole lot is created or
    /// nothing is.
    #[instrument(skip(self, allocations), fields(lot_id = %lot_id, rows = allocations.len()), err)]
    pub async fn create_preview(
        &self,
        lot_id: &LotId,
        allocations: Vec<(LineKey, Quantity)>,
    ) -> Result<Vec<SeparationLot>, PlanningError> {
        if allocations.is_empty() {
            return Err(PlanningError::Validation(format!("lot {lot_id} has no allocations")));
        }
        let now = Utc::now();
        let mut tx = self.storage.begin().await?;

        let existing = tx.lots_for_lot(lot_id).await?;
        if let Some(row) = existing.iter().find(|row| row.status != LotStatus::Preview) {
            return Err(PlanningError::Rejected(format!(
                "lot {lot_id} is already {}; rows can only be added while it is PREVIEW",
                row.status
            )));
        }

        let mut created = Vec::with_capacity(allocations.len());
        let mut products: BTreeSet<ProductCode> = BTreeSet::new();
        for (key, qty) in allocations {
            if qty.is_zero() {
                return Err(PlanningError::Validation(format!("{key}: allocation must be positive")));
            }
            let line = tx
                .get_line(&key)
                .await?
                .ok_or_else(|| PlanningError::LineNotFound(key.clone()))?;

            let allocated: Quantity = tx
                .lots_for_line(&key)
                .await?
                .iter()
                .filter(|lot| lot.holds_demand())
                .map(|lot| lot.allocated_qty)
                .sum();
            let available = line.demanded_qty.saturating_sub(allocated);
            if qty > available {
                return Err(PlanningError::OverAllocation {
                    key,
                    requested: qty,
                    available,
                });
            }

            let lot = SeparationLot::preview(lot_id.clone(), &line, qty, now)?;
            tx.insert_lot(lot.clone()).await.map_err(store_error)?;
            products.insert(key.product_code.clone());
            created.push(lot);
        }

        for product in products {
            tx.append_change(ChangeLogEntry::new(SourceTable::Separation, ChangeOperation::Planning, product, now))
                .await?;
        }
        tx.commit().await?;

        for lot in &mut created {
            lot.version = 1;
        }
        info!("preview lot created");
        Ok(created)
    }

    /// PREVIEW -> OPEN for every row of the lot.
    #[instrument(skip(self), fields(lot_id = %lot_id), err)]
    pub async fn confirm(&self, lot_id: &LotId) -> Result<Vec<SeparationLot>, PlanningError> {
        let now = Utc::now();
        let command = LotCommand::AdvanceStatus(AdvanceStatus {
            from: LotStatus::Preview,
            to: LotStatus::Open,
            occurred_at: now,
        });
        Ok(advance_lot_rows(self.storage.as_ref(), lot_id, &command, now).await?)
    }

    /// Lots of an order, one summary per (lot, order).
    pub async fn order_summaries(&self, order: &OrderNumber) -> Result<Vec<OrderLotSummary>, PlanningError> {
        let mut tx = self.storage.begin().await?;
        let rows = tx.lots_for_order(order).await?;
        Ok(summarize_by_order(&rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStorage;
    use crate::test_support::{day, key_for, line_for, lot_for, qty};
    use rust_decimal_macros::dec;

    fn lot_id(raw: &str) -> LotId {
        LotId::parse(raw).unwrap()
    }

    fn seeded() -> Arc<InMemoryStorage> {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .seed_line(line_for(key_for("100", "P1"), dec!(50)).with_expedition_date(day(2026, 3, 10)))
            .unwrap();
        storage.seed_line(line_for(key_for("100", "P2"), dec!(20))).unwrap();
        storage
    }

    #[tokio::test]
    async fn preview_snapshots_line_and_derives_figures() {
        let storage = seeded();
        let planner = LotPlanner::new(storage.clone());

        let rows = planner
            .create_preview(
                &lot_id("L1"),
                vec![(key_for("100", "P1"), qty(dec!(20))), (key_for("100", "P2"), qty(dec!(5)))],
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        let p1 = &rows[0];
        assert_eq!(p1.status, LotStatus::Preview);
        assert_eq!(p1.scheduling.expedition_date, Some(day(2026, 3, 10)));
        assert_eq!(p1.weight, dec!(40));
        assert_eq!(p1.pallet_count, dec!(2));
        assert_eq!(p1.value_total, dec!(60));
        assert_eq!(storage.lots().len(), 2);
        assert_eq!(storage.change_log().len(), 2);
    }

    #[tokio::test]
    async fn allocation_cannot_exceed_unallocated_demand() {
        let storage = seeded();
        storage
            .seed_lot(lot_for("L0", key_for("100", "P1"), dec!(40), LotStatus::Quoted))
            .unwrap();
        let planner = LotPlanner::new(storage.clone());

        let err = planner
            .create_preview(&lot_id("L1"), vec![(key_for("100", "P1"), qty(dec!(11)))])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PlanningError::OverAllocation {
                key: key_for("100", "P1"),
                requested: qty(dec!(11)),
                available: qty(dec!(10)),
            }
        );
        assert_eq!(storage.lots().len(), 1);
    }

    #[tokio::test]
    async fn invoiced_lots_do_not_hold_demand() {
        let storage = seeded();
        storage
            .seed_lot(lot_for("L0", key_for("100", "P2"), dec!(20), LotStatus::Invoiced))
            .unwrap();
        let planner = LotPlanner::new(storage);
        planner
            .create_preview(&lot_id("L1"), vec![(key_for("100", "P2"), qty(dec!(20)))])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_preview_context_is_rejected() {
        let storage = seeded();
        let planner = LotPlanner::new(storage.clone());
        planner
            .create_preview(&lot_id("L1"), vec![(key_for("100", "P1"), qty(dec!(5)))])
            .await
            .unwrap();

        let err = planner
            .create_preview(&lot_id("L2"), vec![(key_for("100", "P1"), qty(dec!(5)))])
            .await
            .unwrap_err();
        assert!(matches!(err, PlanningError::Rejected(_)));
    }

    #[tokio::test]
    async fn missing_line_and_zero_quantity_are_refused() {
        let planner = LotPlanner::new(seeded());
        assert!(matches!(
            planner
                .create_preview(&lot_id("L1"), vec![(key_for("999", "P1"), qty(dec!(1)))])
                .await,
            Err(PlanningError::LineNotFound(_))
        ));
        assert!(matches!(
            planner
                .create_preview(&lot_id("L1"), vec![(key_for("100", "P1"), Quantity::ZERO)])
                .await,
            Err(PlanningError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn confirm_opens_the_lot_and_summaries_group_rows() {
        let storage = seeded();
        let planner = LotPlanner::new(storage.clone());
        planner
            .create_preview(
                &lot_id("L1"),
                vec![(key_for("100", "P1"), qty(dec!(20))), (key_for("100", "P2"), qty(dec!(5)))],
            )
            .await
            .unwrap();

        let opened = planner.confirm(&lot_id("L1")).await.unwrap();
        assert!(opened.iter().all(|row| row.status == LotStatus::Open));
        assert!(matches!(
            planner.confirm(&lot_id("L1")).await,
            Err(PlanningError::Quoting(QuotingError::InvalidTransition { .. }))
        ));

        let summaries = planner
            .order_summaries(&OrderNumber::parse("100").unwrap())
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].line_count, 2);
        assert_eq!(summaries[0].allocated_qty, qty(dec!(25)));
        assert_eq!(summaries[0].expedition_date, Some(day(2026, 3, 10)));
        assert_eq!(summaries[0].status, LotStatus::Open);
    }
}
