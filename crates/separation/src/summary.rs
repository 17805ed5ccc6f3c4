//! Order-level read model over lot rows.
//!
//! A lot spans several product lines of the same order. Screens want one row
//! per (lot, order): quantities summed, the earliest expedition date, whether
//! any line has a confirmed appointment, and the least advanced status.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lotsync_core::{LotId, OrderNumber, Quantity};

use crate::lot::SeparationLot;
use crate::status::LotStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLotSummary {
    pub lot_id: LotId,
    pub order_number: OrderNumber,
    pub line_count: usize,
    pub allocated_qty: Quantity,
    pub weight: Decimal,
    pub pallet_count: Decimal,
    pub value_total: Decimal,
    /// MIN over the rows that carry a date.
    pub expedition_date: Option<NaiveDate>,
    /// BOOL_OR over the rows.
    pub appointment_confirmed: bool,
    /// Least advanced status among the rows.
    pub status: LotStatus,
    /// BOOL_OR of the returned-to-yard flag.
    pub returned_to_yard: bool,
}

/// Collapse lot rows into one summary per (lot, order), sorted by key.
pub fn summarize_by_order(lots: &[SeparationLot]) -> Vec<OrderLotSummary> {
    let mut groups: BTreeMap<(LotId, OrderNumber), OrderLotSummary> = BTreeMap::new();

    for lot in lots {
        let key = (lot.key.lot_id.clone(), lot.key.order_number.clone());
        let entry = groups.entry(key).or_insert_with(|| OrderLotSummary {
            lot_id: lot.key.lot_id.clone(),
            order_number: lot.key.order_number.clone(),
            line_count: 0,
            allocated_qty: Quantity::ZERO,
            weight: Decimal::ZERO,
            pallet_count: Decimal::ZERO,
            value_total: Decimal::ZERO,
            expedition_date: None,
            appointment_confirmed: false,
            status: lot.status,
            returned_to_yard: false,
        });

        entry.line_count += 1;
        entry.allocated_qty = entry.allocated_qty + lot.allocated_qty;
        entry.weight += lot.weight;
        entry.pallet_count += lot.pallet_count;
        entry.value_total += lot.value_total;
        entry.expedition_date = match (entry.expedition_date, lot.scheduling.expedition_date) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        entry.appointment_confirmed |= lot.scheduling.appointment_confirmed;
        entry.status = entry.status.min(lot.status);
        entry.returned_to_yard |= lot.returned_to_yard;
    }

    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lotsync_backlog::{BacklogLine, LineKey};
    use lotsync_core::ProductCode;
    use rust_decimal_macros::dec;

    fn lot(lot_id: &str, order: &str, product: &str, q: Decimal, status: LotStatus, day: u32) -> SeparationLot {
        let key = LineKey::new(OrderNumber::parse(order).unwrap(), ProductCode::parse(product).unwrap());
        let line = BacklogLine::new(key, Quantity::new(dec!(1000)).unwrap(), Utc::now())
            .with_expedition_date(NaiveDate::from_ymd_opt(2025, 3, day).unwrap());
        let mut lot = SeparationLot::preview(
            LotId::parse(lot_id).unwrap(),
            &line,
            Quantity::new(q).unwrap(),
            Utc::now(),
        )
        .unwrap();
        lot.status = status;
        lot
    }

    #[test]
    fn rows_of_the_same_order_collapse() {
        let mut a = lot("L1", "100", "P1", dec!(10), LotStatus::Quoted, 12);
        let b = lot("L1", "100", "P2", dec!(5), LotStatus::Open, 10);
        let c = lot("L1", "200", "P1", dec!(7), LotStatus::Quoted, 11);
        a.scheduling.appointment_confirmed = true;

        let summaries = summarize_by_order(&[a, b, c]);
        assert_eq!(summaries.len(), 2);

        let first = &summaries[0];
        assert_eq!(first.order_number.as_str(), "100");
        assert_eq!(first.line_count, 2);
        assert_eq!(first.allocated_qty, Quantity::new(dec!(15)).unwrap());
        assert_eq!(first.expedition_date, NaiveDate::from_ymd_opt(2025, 3, 10));
        assert!(first.appointment_confirmed);
        assert_eq!(first.status, LotStatus::Open);

        assert_eq!(summaries[1].order_number.as_str(), "200");
        assert!(!summaries[1].appointment_confirmed);
    }
}
