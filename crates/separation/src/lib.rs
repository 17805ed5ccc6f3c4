//! Separation domain module.
//!
//! A separation lot is a planner's allocation of backlog quantity into a
//! shippable group. This crate holds the lot aggregate, its closed lifecycle
//! ([`LotStatus`]) and the order-level read model. No IO.

pub mod lot;
pub mod status;
pub mod summary;

pub use lot::{
    AdvanceStatus, AllocationReduced, LotCommand, LotEvent, LotRowKey, MarkReturnedToYard,
    PreviewContext, ReduceAllocation, ReturnedToYard, SeparationLot, StatusAdvanced,
};
pub use status::{LotPhase, LotStatus};
pub use summary::{OrderLotSummary, summarize_by_order};
