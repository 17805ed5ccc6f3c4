//! Backlog domain module.
//!
//! The order backlog as the ERP sees it: one [`BacklogLine`] per
//! (order, product), and the [`LineDelta`] records the connector emits when a
//! line is added, resized or cancelled. Pure domain logic, no storage.

pub mod delta;
pub mod line;

pub use delta::{DeltaKind, EffectiveChange, LineDelta, ValidDelta};
pub use line::{BacklogLine, LineAttributes, LineKey, Routing, Scheduling, UnitMetrics};
