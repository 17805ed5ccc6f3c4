use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lotsync_backlog::{BacklogLine, LineKey, Scheduling};
use lotsync_core::{Aggregate, AggregateRoot, DomainError, LotId, OrderNumber, ProductCode, Quantity};

use crate::status::{LotPhase, LotStatus};

/// Key of one lot row: a lot groups several (order, product) lines.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LotRowKey {
    pub lot_id: LotId,
    pub order_number: OrderNumber,
    pub product_code: ProductCode,
}

impl LotRowKey {
    pub fn new(lot_id: LotId, line: &LineKey) -> Self {
        Self {
            lot_id,
            order_number: line.order_number.clone(),
            product_code: line.product_code.clone(),
        }
    }

    pub fn line_key(&self) -> LineKey {
        LineKey::new(self.order_number.clone(), self.product_code.clone())
    }
}

impl core::fmt::Display for LotRowKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}/{}", self.lot_id, self.order_number, self.product_code)
    }
}

/// Aggregate root: one row of a separation lot.
///
/// Fields are public for storage adapters; state changes go through
/// [`Aggregate::execute`] so the lifecycle rules are applied in one place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeparationLot {
    pub key: LotRowKey,
    pub allocated_qty: Quantity,
    pub weight: Decimal,
    pub pallet_count: Decimal,
    pub value_total: Decimal,
    /// Copied from the backlog line at allocation time; not a reference.
    pub scheduling: Scheduling,
    pub status: LotStatus,
    pub returned_to_yard: bool,
    /// Storage revision; bumped on every committed write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SeparationLot {
    /// New PREVIEW row allocating `qty` of `line`.
    pub fn preview(
        lot_id: LotId,
        line: &BacklogLine,
        qty: Quantity,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if qty.is_zero() {
            return Err(DomainError::validation(format!(
                "{}: allocation must be positive",
                line.key
            )));
        }
        Ok(Self {
            key: LotRowKey::new(lot_id, &line.key),
            allocated_qty: qty,
            weight: line.metrics.weight_for(qty),
            pallet_count: line.metrics.pallets_for(qty),
            value_total: line.metrics.value_for(qty),
            scheduling: line.scheduling.clone(),
            status: LotStatus::Preview,
            returned_to_yard: false,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn phase(&self) -> LotPhase {
        self.status.phase()
    }

    pub fn line_key(&self) -> LineKey {
        self.key.line_key()
    }

    /// Counts toward planned outbound stock.
    pub fn is_outbound(&self) -> bool {
        self.status != LotStatus::Invoiced && !self.returned_to_yard
    }

    /// Counts against its line's demand. Invoiced lots are settled and release
    /// it; returned-to-yard lots still hold it.
    pub fn holds_demand(&self) -> bool {
        self.status != LotStatus::Invoiced
    }

    /// Identity of the shipping context used by the PREVIEW uniqueness rule.
    pub fn preview_context(&self) -> PreviewContext {
        PreviewContext {
            order_number: self.key.order_number.clone(),
            product_code: self.key.product_code.clone(),
            expedition_date: self.scheduling.expedition_date,
            appointment_date: self.scheduling.appointment_date,
            protocol: self.scheduling.protocol.clone(),
        }
    }
}

/// (order, product, expedition, appointment, protocol); unique among PREVIEW rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreviewContext {
    pub order_number: OrderNumber,
    pub product_code: ProductCode,
    pub expedition_date: Option<chrono::NaiveDate>,
    pub appointment_date: Option<chrono::NaiveDate>,
    pub protocol: Option<String>,
}

impl AggregateRoot for SeparationLot {
    type Id = LotRowKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: Advance the lot to the next lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvanceStatus {
    pub from: LotStatus,
    pub to: LotStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReduceAllocation (reconciliation cut). Clamped at zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceAllocation {
    pub by: Quantity,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkReturnedToYard (invoice issued, cargo never left).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkReturnedToYard {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LotCommand {
    AdvanceStatus(AdvanceStatus),
    ReduceAllocation(ReduceAllocation),
    MarkReturnedToYard(MarkReturnedToYard),
}

/// Event: StatusAdvanced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusAdvanced {
    pub from: LotStatus,
    pub to: LotStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AllocationReduced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReduced {
    pub before: Quantity,
    pub after: Quantity,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReturnedToYard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnedToYard {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LotEvent {
    StatusAdvanced(StatusAdvanced),
    AllocationReduced(AllocationReduced),
    ReturnedToYard(ReturnedToYard),
}

impl LotEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LotEvent::StatusAdvanced(_) => "separation.lot.status_advanced",
            LotEvent::AllocationReduced(_) => "separation.lot.allocation_reduced",
            LotEvent::ReturnedToYard(_) => "separation.lot.returned_to_yard",
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LotEvent::StatusAdvanced(e) => e.occurred_at,
            LotEvent::AllocationReduced(e) => e.occurred_at,
            LotEvent::ReturnedToYard(e) => e.occurred_at,
        }
    }
}

impl Aggregate for SeparationLot {
    type Command = LotCommand;
    type Event = LotEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LotEvent::StatusAdvanced(e) => {
                self.status = e.to;
            }
            LotEvent::AllocationReduced(e) => {
                let factor = if e.before.is_zero() {
                    Decimal::ZERO
                } else {
                    e.after.value() / e.before.value()
                };
                self.allocated_qty = e.after;
                self.weight = rescale(self.weight, factor);
                self.pallet_count = rescale(self.pallet_count, factor);
                self.value_total = rescale(self.value_total, factor);
            }
            LotEvent::ReturnedToYard(_) => {
                self.returned_to_yard = true;
            }
        }
        self.updated_at = event.occurred_at();
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            LotCommand::AdvanceStatus(cmd) => self.handle_advance(cmd),
            LotCommand::ReduceAllocation(cmd) => self.handle_reduce(cmd),
            LotCommand::MarkReturnedToYard(cmd) => self.handle_returned(cmd),
        }
    }
}

fn rescale(value: Decimal, factor: Decimal) -> Decimal {
    (value * factor).round_dp(6).normalize()
}

impl SeparationLot {
    fn handle_advance(&self, cmd: &AdvanceStatus) -> Result<Vec<LotEvent>, DomainError> {
        if self.status != cmd.from {
            return Err(DomainError::invalid_transition(self.status, cmd.to));
        }
        LotStatus::check_transition(cmd.from, cmd.to)?;
        if self.returned_to_yard {
            return Err(DomainError::invariant(format!(
                "{}: lot was returned to yard; status is frozen",
                self.key
            )));
        }

        Ok(vec![LotEvent::StatusAdvanced(StatusAdvanced {
            from: cmd.from,
            to: cmd.to,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reduce(&self, cmd: &ReduceAllocation) -> Result<Vec<LotEvent>, DomainError> {
        if self.phase() == LotPhase::Closed {
            return Err(DomainError::invariant(format!(
                "{}: invoiced lots are immutable",
                self.key
            )));
        }
        if cmd.by.is_zero() {
            return Ok(vec![]);
        }

        Ok(vec![LotEvent::AllocationReduced(AllocationReduced {
            before: self.allocated_qty,
            after: self.allocated_qty.saturating_sub(cmd.by),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_returned(&self, cmd: &MarkReturnedToYard) -> Result<Vec<LotEvent>, DomainError> {
        if self.status != LotStatus::Shipped {
            return Err(DomainError::invalid_transition(self.status, "RETURNED_TO_YARD"));
        }
        if self.returned_to_yard {
            return Ok(vec![]);
        }

        Ok(vec![LotEvent::ReturnedToYard(ReturnedToYard {
            occurred_at: cmd.occurred_at,
        })])
    }
}
