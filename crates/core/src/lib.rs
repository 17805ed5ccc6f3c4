//! `lotsync-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the non-negative [`Quantity`] value object, the aggregate
//! pattern and the shared [`DomainError`].

pub mod aggregate;
pub mod error;
pub mod id;
pub mod quantity;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AlertId, ChangeLogId, LotId, OrderNumber, ProductCode};
pub use quantity::Quantity;
