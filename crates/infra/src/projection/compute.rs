//! Pure 29-day stock projection.
//!
//! Given the opening balance and the product's demand and supply, every day
//! gets `closing = opening - outflow + inflow`, and the next day opens at the
//! previous close. No IO.

use std::collections::HashMap;

use chrono::{DateTime, Days, NaiveDate, Utc};
use rust_decimal::Decimal;

use lotsync_backlog::{BacklogLine, LineKey};
use lotsync_core::{ProductCode, Quantity};
use lotsync_separation::SeparationLot;

use crate::sources::{DateRange, LedgerCursor, ScheduledInflow};
use crate::store::{HORIZON_DAYS, ProductStockSummary, RuptureStatus, STATUS_WINDOW_DAYS, StockProjectionRow};

/// Everything one refresh reads.
#[derive(Debug, Clone)]
pub struct ProjectionInputs<'a> {
    pub product_code: &'a ProductCode,
    pub today: NaiveDate,
    pub opening_balance: Decimal,
    pub lines: &'a [BacklogLine],
    pub lots: &'a [SeparationLot],
    pub inflows: &'a [ScheduledInflow],
    /// Used for lines and lots that carry no expedition date.
    pub default_lead_time_days: u32,
}

/// Dates covered by a projection starting `today`.
pub fn horizon(today: NaiveDate) -> DateRange {
    let end = today
        .checked_add_days(Days::new(HORIZON_DAYS as u64 - 1))
        .unwrap_or(NaiveDate::MAX);
    DateRange::new(today, end)
}

/// Day bucket for `date`: past dates land on day 0, dates past the horizon
/// are dropped.
pub fn day_offset(today: NaiveDate, date: NaiveDate) -> Option<usize> {
    if date <= today {
        return Some(0);
    }
    let days = (date - today).num_days();
    usize::try_from(days).ok().filter(|d| *d < HORIZON_DAYS)
}

fn bucket_for(today: NaiveDate, date: Option<NaiveDate>, lead_days: u32) -> Option<usize> {
    match date {
        Some(date) => day_offset(today, date),
        None => usize::try_from(lead_days).ok().filter(|d| *d < HORIZON_DAYS),
    }
}

/// Compute the product's projection rows, day 0 first.
pub fn compute_rows(inputs: &ProjectionInputs<'_>) -> Vec<StockProjectionRow> {
    let mut outflow = [Decimal::ZERO; HORIZON_DAYS];
    let mut inflow = [Decimal::ZERO; HORIZON_DAYS];

    let mut allocated: HashMap<LineKey, Quantity> = HashMap::new();
    for lot in inputs.lots {
        if lot.holds_demand() {
            let entry = allocated.entry(lot.line_key()).or_insert(Quantity::ZERO);
            *entry = *entry + lot.allocated_qty;
        }

        if !lot.is_outbound() {
            continue;
        }
        if let Some(day) = bucket_for(inputs.today, lot.scheduling.expedition_date, inputs.default_lead_time_days) {
            outflow[day] += lot.allocated_qty.value();
        }
    }

    for line in inputs.lines {
        let covered = allocated.get(&line.key).copied().unwrap_or(Quantity::ZERO);
        let remainder = line.demanded_qty.saturating_sub(covered);
        if remainder.is_zero() {
            continue;
        }
        if let Some(day) = bucket_for(inputs.today, line.scheduling.expedition_date, inputs.default_lead_time_days) {
            outflow[day] += remainder.value();
        }
    }

    for planned in inputs.inflows {
        if let Some(day) = day_offset(inputs.today, planned.date) {
            inflow[day] += planned.quantity;
        }
    }

    let mut rows = Vec::with_capacity(HORIZON_DAYS);
    let mut opening = inputs.opening_balance;
    for day in 0..HORIZON_DAYS {
        let closing = opening - outflow[day] + inflow[day];
        rows.push(StockProjectionRow {
            product_code: inputs.product_code.clone(),
            day_offset: day as u8,
            date: inputs
                .today
                .checked_add_days(Days::new(day as u64))
                .unwrap_or(NaiveDate::MAX),
            opening_stock: opening,
            planned_outflow: outflow[day],
            planned_inflow: inflow[day],
            closing_stock: closing,
        });
        opening = closing;
    }
    rows
}

/// Status over the first week of `rows`.
///
/// Returns the status and the week's minimum closing stock.
pub fn derive_status(rows: &[StockProjectionRow], warning_threshold: Decimal) -> (RuptureStatus, Decimal) {
    let window = &rows[..rows.len().min(STATUS_WINDOW_DAYS)];
    let minimum = window
        .iter()
        .map(|row| row.closing_stock)
        .min()
        .unwrap_or(Decimal::ZERO);

    let status = if window.iter().any(|row| row.closing_stock <= Decimal::ZERO) {
        RuptureStatus::Critical
    } else if minimum < warning_threshold {
        RuptureStatus::Warning
    } else {
        RuptureStatus::Ok
    };
    (status, minimum)
}

pub fn first_rupture_day(rows: &[StockProjectionRow]) -> Option<u8> {
    rows.iter()
        .find(|row| row.closing_stock <= Decimal::ZERO)
        .map(|row| row.day_offset)
}

pub fn summarize(
    product_code: &ProductCode,
    rows: &[StockProjectionRow],
    current_balance: Decimal,
    ledger_cursor: Option<LedgerCursor>,
    warning_threshold: Decimal,
    refreshed_at: DateTime<Utc>,
) -> ProductStockSummary {
    let (rupture_status, rupture_prediction_7d) = derive_status(rows, warning_threshold);
    ProductStockSummary {
        product_code: product_code.clone(),
        current_balance,
        rupture_prediction_7d,
        rupture_status,
        first_rupture_day: first_rupture_day(rows),
        ledger_cursor,
        refreshed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{day, key_for, line_for, lot_for, product};
    use lotsync_separation::LotStatus;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn today() -> NaiveDate {
        day(2026, 3, 2)
    }

    fn inputs<'a>(
        product: &'a ProductCode,
        opening: Decimal,
        lines: &'a [BacklogLine],
        lots: &'a [SeparationLot],
        inflows: &'a [ScheduledInflow],
    ) -> ProjectionInputs<'a> {
        ProjectionInputs {
            product_code: product,
            today: today(),
            opening_balance: opening,
            lines,
            lots,
            inflows,
            default_lead_time_days: 3,
        }
    }

    #[test]
    fn day_offsets_clamp_past_and_drop_far_future() {
        assert_eq!(day_offset(today(), day(2026, 2, 1)), Some(0));
        assert_eq!(day_offset(today(), day(2026, 3, 5)), Some(3));
        assert_eq!(day_offset(today(), day(2026, 3, 30)), Some(28));
        assert_eq!(day_offset(today(), day(2026, 3, 31)), None);
        assert_eq!(horizon(today()).end, day(2026, 3, 30));
    }

    #[test]
    fn lots_and_unallocated_remainder_both_count_as_outflow() {
        let p1 = product("P1");
        let key = key_for("100", "P1");
        let lines = vec![line_for(key.clone(), dec!(50)).with_expedition_date(day(2026, 3, 4))];
        let mut open = lot_for("L1", key.clone(), dec!(20), LotStatus::Open);
        open.scheduling.expedition_date = Some(day(2026, 3, 3));
        let lots = vec![open];

        let rows = compute_rows(&inputs(&p1, dec!(100), &lines, &lots, &[]));
        assert_eq!(rows.len(), HORIZON_DAYS);
        assert_eq!(rows[1].planned_outflow, dec!(20));
        assert_eq!(rows[2].planned_outflow, dec!(30));
        assert_eq!(rows[28].closing_stock, dec!(50));
    }

    #[test]
    fn invoiced_lots_release_demand_and_returned_lots_keep_it() {
        let p1 = product("P1");
        let key = key_for("100", "P1");
        let lines = vec![line_for(key.clone(), dec!(30))];
        let invoiced = lot_for("L1", key.clone(), dec!(10), LotStatus::Invoiced);
        let mut returned = lot_for("L2", key.clone(), dec!(20), LotStatus::Shipped);
        returned.returned_to_yard = true;
        let lots = vec![invoiced, returned];

        // Neither lot leaves stock; the invoiced 10 is unallocated again.
        let rows = compute_rows(&inputs(&p1, dec!(5), &lines, &lots, &[]));
        assert_eq!(rows[3].planned_outflow, dec!(10));
        assert_eq!(rows.iter().map(|r| r.planned_outflow).sum::<Decimal>(), dec!(10));
        assert_eq!(rows[28].closing_stock, dec!(-5));
    }

    #[test]
    fn undated_lines_use_the_default_lead_time() {
        let p1 = product("P1");
        let lines = vec![line_for(key_for("100", "P1"), dec!(8))];
        let rows = compute_rows(&inputs(&p1, dec!(10), &lines, &[], &[]));
        assert_eq!(rows[3].planned_outflow, dec!(8));
        assert_eq!(rows[3].closing_stock, dec!(2));
    }

    #[test]
    fn inflows_are_bucketed_by_date() {
        let p1 = product("P1");
        let inflows = vec![
            ScheduledInflow { date: day(2026, 3, 2), quantity: dec!(4) },
            ScheduledInflow { date: day(2026, 3, 2), quantity: dec!(6) },
            ScheduledInflow { date: day(2026, 5, 1), quantity: dec!(99) },
        ];
        let rows = compute_rows(&inputs(&p1, dec!(0), &[], &[], &inflows));
        assert_eq!(rows[0].planned_inflow, dec!(10));
        assert_eq!(rows[28].closing_stock, dec!(10));
    }

    #[test]
    fn status_follows_the_first_week() {
        let p1 = product("P1");
        let key = key_for("100", "P1");

        let healthy = compute_rows(&inputs(&p1, dec!(100), &[], &[], &[]));
        assert_eq!(derive_status(&healthy, dec!(10)).0, RuptureStatus::Ok);
        assert_eq!(derive_status(&healthy, dec!(150)), (RuptureStatus::Warning, dec!(100)));

        let lines = vec![line_for(key.clone(), dec!(100)).with_expedition_date(day(2026, 3, 8))];
        let rows = compute_rows(&inputs(&p1, dec!(100), &lines, &[], &[]));
        assert_eq!(derive_status(&rows, Decimal::ZERO).0, RuptureStatus::Critical);
        assert_eq!(first_rupture_day(&rows), Some(6));

        // A rupture after the first week does not make the product critical.
        let lines = vec![line_for(key, dec!(100)).with_expedition_date(day(2026, 3, 9))];
        let rows = compute_rows(&inputs(&p1, dec!(100), &lines, &[], &[]));
        assert_eq!(derive_status(&rows, Decimal::ZERO).0, RuptureStatus::Ok);
        assert_eq!(first_rupture_day(&rows), Some(7));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: each day opens at the previous close, and the last close
        /// equals opening minus total outflow plus total inflow.
        #[test]
        fn projection_is_continuous(
            opening in -1_000i64..1_000,
            demands in prop::collection::vec((1i64..200, 0u64..40), 0..5),
            inflows in prop::collection::vec((0i64..200, 0u64..40), 0..5),
        ) {
            let p1 = product("P1");
            let lines: Vec<BacklogLine> = demands
                .iter()
                .enumerate()
                .map(|(i, (qty, offset))| {
                    let date = today().checked_add_days(Days::new(*offset)).unwrap();
                    line_for(key_for(&format!("{}", 100 + i), "P1"), Decimal::from(*qty))
                        .with_expedition_date(date)
                })
                .collect();
            let inflows: Vec<ScheduledInflow> = inflows
                .iter()
                .map(|(qty, offset)| ScheduledInflow {
                    date: today().checked_add_days(Days::new(*offset)).unwrap(),
                    quantity: Decimal::from(*qty),
                })
                .collect();

            let rows = compute_rows(&inputs(&p1, Decimal::from(opening), &lines, &[], &inflows));
            prop_assert_eq!(rows.len(), HORIZON_DAYS);
            for pair in rows.windows(2) {
                prop_assert_eq!(pair[1].opening_stock, pair[0].closing_stock);
            }
            for row in &rows {
                prop_assert_eq!(row.closing_stock, row.opening_stock - row.planned_outflow + row.planned_inflow);
            }
            let total_out: Decimal = rows.iter().map(|r| r.planned_outflow).sum();
            let total_in: Decimal = rows.iter().map(|r| r.planned_inflow).sum();
            prop_assert_eq!(rows[HORIZON_DAYS - 1].closing_stock, Decimal::from(opening) - total_out + total_in);
        }
    }
}
