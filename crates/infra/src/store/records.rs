//! Rows owned by the infra layer: change log, alerts and projection tables.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lotsync_backlog::DeltaKind;
use lotsync_core::{AlertId, ChangeLogId, DomainError, LotId, OrderNumber, ProductCode, Quantity};
use lotsync_separation::LotRowKey;

use crate::sources::LedgerCursor;

/// Table whose mutation produced a change-log entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceTable {
    Backlog,
    Separation,
    Ledger,
}

impl SourceTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTable::Backlog => "BACKLOG",
            SourceTable::Separation => "SEPARATION",
            SourceTable::Ledger => "LEDGER",
        }
    }
}

impl core::str::FromStr for SourceTable {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BACKLOG" => Ok(SourceTable::Backlog),
            "SEPARATION" => Ok(SourceTable::Separation),
            "LEDGER" => Ok(SourceTable::Ledger),
            other => Err(DomainError::validation(format!("unknown source table '{other}'"))),
        }
    }
}

/// What kind of write produced a change-log entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOperation {
    Reconcile,
    /// Re-delivered delta that changed nothing. Never triggers a refresh.
    Audit,
    StatusChange,
    LedgerMovement,
    Planning,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Reconcile => "RECONCILE",
            ChangeOperation::Audit => "AUDIT",
            ChangeOperation::StatusChange => "STATUS_CHANGE",
            ChangeOperation::LedgerMovement => "LEDGER_MOVEMENT",
            ChangeOperation::Planning => "PLANNING",
        }
    }
}

impl core::str::FromStr for ChangeOperation {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECONCILE" => Ok(ChangeOperation::Reconcile),
            "AUDIT" => Ok(ChangeOperation::Audit),
            "STATUS_CHANGE" => Ok(ChangeOperation::StatusChange),
            "LEDGER_MOVEMENT" => Ok(ChangeOperation::LedgerMovement),
            "PLANNING" => Ok(ChangeOperation::Planning),
            other => Err(DomainError::validation(format!("unknown change operation '{other}'"))),
        }
    }
}

/// Append-only record that a product's projection inputs changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: ChangeLogId,
    pub source_table: SourceTable,
    pub operation: ChangeOperation,
    pub product_code: ProductCode,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl ChangeLogEntry {
    /// New entry. AUDIT entries are recorded as already processed.
    pub fn new(
        source_table: SourceTable,
        operation: ChangeOperation,
        product_code: ProductCode,
        at: DateTime<Utc>,
    ) -> Self {
        let processed = operation == ChangeOperation::Audit;
        Self {
            id: ChangeLogId::new(),
            source_table,
            operation,
            product_code,
            processed,
            created_at: at,
            processed_at: processed.then_some(at),
        }
    }

    pub fn reconcile(source_table: SourceTable, product_code: ProductCode, at: DateTime<Utc>) -> Self {
        Self::new(source_table, ChangeOperation::Reconcile, product_code, at)
    }

    pub fn audit(product_code: ProductCode, at: DateTime<Utc>) -> Self {
        Self::new(SourceTable::Backlog, ChangeOperation::Audit, product_code, at)
    }
}

/// Human-reviewable record of a post-quotation change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationAlert {
    pub id: AlertId,
    pub lot_id: LotId,
    pub order_number: OrderNumber,
    pub product_code: ProductCode,
    pub delta_kind: DeltaKind,
    pub qty_before: Quantity,
    pub qty_after: Quantity,
    pub raised_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl ReconciliationAlert {
    pub fn raise(
        lot: &LotRowKey,
        delta_kind: DeltaKind,
        qty_before: Quantity,
        qty_after: Quantity,
        raised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            lot_id: lot.lot_id.clone(),
            order_number: lot.order_number.clone(),
            product_code: lot.product_code.clone(),
            delta_kind,
            qty_before,
            qty_after,
            raised_at,
            resolved: false,
            resolved_at: None,
            resolved_by: None,
        }
    }
}

/// Filter for the alert review read path. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertFilter {
    pub order_number: Option<OrderNumber>,
    pub product_code: Option<ProductCode>,
    pub lot_id: Option<LotId>,
    pub delta_kind: Option<DeltaKind>,
}

impl AlertFilter {
    pub fn for_order(order_number: OrderNumber) -> Self {
        Self {
            order_number: Some(order_number),
            ..Self::default()
        }
    }

    pub fn for_product(product_code: ProductCode) -> Self {
        Self {
            product_code: Some(product_code),
            ..Self::default()
        }
    }

    pub fn matches(&self, alert: &ReconciliationAlert) -> bool {
        self.order_number.as_ref().is_none_or(|o| *o == alert.order_number)
            && self.product_code.as_ref().is_none_or(|p| *p == alert.product_code)
            && self.lot_id.as_ref().is_none_or(|l| *l == alert.lot_id)
            && self.delta_kind.is_none_or(|k| k == alert.delta_kind)
    }
}

/// Result of an acknowledgement. Acknowledging twice is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged(ReconciliationAlert),
    AlreadyAcknowledged(ReconciliationAlert),
}

impl AckOutcome {
    pub fn alert(&self) -> &ReconciliationAlert {
        match self {
            AckOutcome::Acknowledged(a) | AckOutcome::AlreadyAcknowledged(a) => a,
        }
    }
}

/// Number of daily rows in a product projection (today plus 28 days).
pub const HORIZON_DAYS: usize = 29;

/// Days considered by the rupture status.
pub const STATUS_WINDOW_DAYS: usize = 7;

/// One day of a product's rolling stock projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockProjectionRow {
    pub product_code: ProductCode,
    pub day_offset: u8,
    pub date: NaiveDate,
    pub opening_stock: Decimal,
    pub planned_outflow: Decimal,
    pub planned_inflow: Decimal,
    pub closing_stock: Decimal,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuptureStatus {
    Ok,
    Warning,
    Critical,
}

impl RuptureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuptureStatus::Ok => "OK",
            RuptureStatus::Warning => "WARNING",
            RuptureStatus::Critical => "CRITICAL",
        }
    }
}

impl core::fmt::Display for RuptureStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for RuptureStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OK" => Ok(RuptureStatus::Ok),
            "WARNING" => Ok(RuptureStatus::Warning),
            "CRITICAL" => Ok(RuptureStatus::Critical),
            other => Err(DomainError::validation(format!("unknown rupture status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStockSummary {
    pub product_code: ProductCode,
    pub current_balance: Decimal,
    /// Minimum closing stock over the first [`STATUS_WINDOW_DAYS`] days.
    pub rupture_prediction_7d: Decimal,
    pub rupture_status: RuptureStatus,
    /// First day offset whose closing stock is `<= 0`, within the horizon.
    pub first_rupture_day: Option<u8>,
    /// Last ledger movement folded into `current_balance`.
    pub ledger_cursor: Option<LedgerCursor>,
    pub refreshed_at: DateTime<Utc>,
}

/// Everything a refresh writes for one product, swapped as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductProjection {
    pub summary: ProductStockSummary,
    pub rows: Vec<StockProjectionRow>,
}

impl ProductProjection {
    pub fn product_code(&self) -> &ProductCode {
        &self.summary.product_code
    }

    pub fn row(&self, day_offset: usize) -> Option<&StockProjectionRow> {
        self.rows.get(day_offset)
    }
}

/// Subset of the product space a worker is responsible for.
///
/// Products are assigned by a stable FNV-1a hash of the code, so every process
/// agrees on the assignment without coordination.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub index: u32,
    pub count: u32,
}

impl Shard {
    pub fn new(index: u32, count: u32) -> Result<Self, DomainError> {
        if count == 0 || index >= count {
            return Err(DomainError::validation(format!(
                "invalid shard {index}/{count}: index must be below a non-zero count"
            )));
        }
        Ok(Self { index, count })
    }

    pub fn contains(&self, product: &ProductCode) -> bool {
        product_hash(product) % self.count == self.index
    }
}

/// FNV-1a over the product code bytes.
pub fn product_hash(product: &ProductCode) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    product
        .as_str()
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(code: &str) -> ProductCode {
        ProductCode::parse(code).unwrap()
    }

    #[test]
    fn audit_entries_are_born_processed() {
        let now = Utc::now();
        let audit = ChangeLogEntry::audit(product("P1"), now);
        assert!(audit.processed);
        assert_eq!(audit.processed_at, Some(now));

        let reconcile = ChangeLogEntry::reconcile(SourceTable::Separation, product("P1"), now);
        assert!(!reconcile.processed);
        assert!(reconcile.processed_at.is_none());
    }

    #[test]
    fn shards_partition_the_product_space() {
        let shards: Vec<Shard> = (0..4).map(|i| Shard::new(i, 4).unwrap()).collect();
        for code in ["P1", "P2", "4410-22", "XK-9", "ABC"] {
            let owners = shards.iter().filter(|s| s.contains(&product(code))).count();
            assert_eq!(owners, 1, "{code} must belong to exactly one shard");
        }
        assert!(Shard::new(4, 4).is_err());
        assert!(Shard::new(0, 0).is_err());
    }

    #[test]
    fn product_hash_is_stable() {
        // Reference FNV-1a value for "a".
        assert_eq!(product_hash(&product("a")), 0xe40c_292c);
    }

    #[test]
    fn alert_filter_matches_on_every_set_field() {
        let key = LotRowKey {
            lot_id: LotId::parse("L1").unwrap(),
            order_number: OrderNumber::parse("100").unwrap(),
            product_code: product("P1"),
        };
        let alert = ReconciliationAlert::raise(
            &key,
            DeltaKind::Decrease,
            Quantity::ZERO,
            Quantity::ZERO,
            Utc::now(),
        );
        assert!(AlertFilter::default().matches(&alert));
        assert!(AlertFilter::for_product(product("P1")).matches(&alert));
        assert!(!AlertFilter::for_product(product("P2")).matches(&alert));
        let by_kind = AlertFilter {
            delta_kind: Some(DeltaKind::Remove),
            ..AlertFilter::default()
        };
        assert!(!by_kind.matches(&alert));
    }
}
