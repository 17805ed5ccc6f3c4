//! Fixtures shared by the unit and integration tests of this crate.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use lotsync_backlog::{BacklogLine, LineKey, UnitMetrics};
use lotsync_core::{LotId, OrderNumber, ProductCode, Quantity};
use lotsync_separation::{LotStatus, SeparationLot};

pub fn qty(v: Decimal) -> Quantity {
    Quantity::new(v).unwrap()
}

pub fn product(code: &str) -> ProductCode {
    ProductCode::parse(code).unwrap()
}

pub fn key_for(order: &str, product_code: &str) -> LineKey {
    LineKey::new(OrderNumber::parse(order).unwrap(), product(product_code))
}

/// Order 100, product P1.
pub fn line_key() -> LineKey {
    key_for("100", "P1")
}

pub fn at() -> DateTime<Utc> {
    Utc::now()
}

pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn line_for(key: LineKey, demanded: Decimal) -> BacklogLine {
    let mut line = BacklogLine::new(key, qty(demanded), at());
    line.metrics = UnitMetrics {
        unit_price: Decimal::from(3),
        unit_weight: Decimal::from(2),
        units_per_pallet: Some(Decimal::from(10)),
    };
    line
}

pub fn line(demanded: Decimal) -> BacklogLine {
    line_for(line_key(), demanded)
}

/// Lot row on `key` in the given status, created through the PREVIEW path.
pub fn lot_for(id: &str, key: LineKey, allocated: Decimal, status: LotStatus) -> SeparationLot {
    let source = line_for(key, allocated.max(Decimal::ONE));
    let mut lot = SeparationLot::preview(LotId::parse(id).unwrap(), &source, qty(allocated.max(Decimal::ONE)), at())
        .unwrap();
    lot.allocated_qty = qty(allocated);
    lot.status = status;
    // Distinct lots on one line must not collide on the PREVIEW context.
    lot.scheduling.protocol = Some(format!("PROTO-{id}"));
    lot
}

pub fn lot(id: &str, allocated: Decimal, status: LotStatus) -> SeparationLot {
    lot_for(id, line_key(), allocated, status)
}
