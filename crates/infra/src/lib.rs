//! Infrastructure layer: storage, reconciliation, projections, workers.
//!
//! The domain crates (`lotsync-backlog`, `lotsync-separation`) hold the pure
//! rules; everything here wires them to storage and time:
//!
//! - [`reconciliation`] applies ERP line deltas to backlog and lots
//! - [`projection`] keeps the 29-day stock projection per product
//! - [`alerts`], [`planning`] and [`quoting`] are the planner-facing services
//! - [`workers`] drives the projection from the change log

pub mod alerts;
pub mod config;
pub mod planning;
pub mod projection;
pub mod quoting;
pub mod reconciliation;
pub mod retry;
pub mod sources;
pub mod store;
pub mod workers;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, LotsyncConfig};
