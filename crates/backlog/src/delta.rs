//! ERP line deltas and their classification against stored state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lotsync_core::{DomainError, OrderNumber, ProductCode, Quantity};

use crate::line::{LineAttributes, LineKey};

/// Kind of change the ERP reports for a backlog line.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeltaKind {
    Add,
    Increase,
    Decrease,
    Remove,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Add => "ADD",
            DeltaKind::Increase => "INCREASE",
            DeltaKind::Decrease => "DECREASE",
            DeltaKind::Remove => "REMOVE",
        }
    }
}

impl core::fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for DeltaKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADD" => Ok(DeltaKind::Add),
            "INCREASE" => Ok(DeltaKind::Increase),
            "DECREASE" => Ok(DeltaKind::Decrease),
            "REMOVE" => Ok(DeltaKind::Remove),
            other => Err(DomainError::validation(format!("unknown delta kind '{other}'"))),
        }
    }
}

/// Raw delta as delivered by the ERP connector (unvalidated).
///
/// `attributes` carries the line's descriptive fields; the connector sends it
/// for ADD and may send it for quantity changes when scheduling moved too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDelta {
    pub order_number: String,
    pub product_code: String,
    pub kind: DeltaKind,
    pub new_qty: Decimal,
    pub old_qty: Decimal,
    #[serde(default)]
    pub attributes: Option<LineAttributes>,
}

impl LineDelta {
    pub fn new(
        order_number: impl Into<String>,
        product_code: impl Into<String>,
        kind: DeltaKind,
        old_qty: Decimal,
        new_qty: Decimal,
    ) -> Self {
        Self {
            order_number: order_number.into(),
            product_code: product_code.into(),
            kind,
            new_qty,
            old_qty,
            attributes: None,
        }
    }

    pub fn with_attributes(mut self, attributes: LineAttributes) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Human-readable key, available even when the codes are malformed.
    pub fn raw_key(&self) -> String {
        format!("{}/{}", self.order_number.trim(), self.product_code.trim())
    }

    /// Validate shape and quantities.
    pub fn validate(&self) -> Result<ValidDelta, DomainError> {
        let key = LineKey::new(
            OrderNumber::parse(&self.order_number)?,
            ProductCode::parse(&self.product_code)?,
        );
        let new_qty = Quantity::new(self.new_qty)
            .map_err(|_| DomainError::validation(format!("{key}: new_qty cannot be negative")))?;
        let old_qty = Quantity::new(self.old_qty)
            .map_err(|_| DomainError::validation(format!("{key}: old_qty cannot be negative")))?;

        match self.kind {
            DeltaKind::Remove if !new_qty.is_zero() => {
                return Err(DomainError::validation(format!(
                    "{key}: REMOVE delta must carry new_qty = 0 (got {new_qty})"
                )));
            }
            DeltaKind::Increase if new_qty <= old_qty => {
                return Err(DomainError::validation(format!(
                    "{key}: INCREASE delta requires new_qty > old_qty ({old_qty} -> {new_qty})"
                )));
            }
            DeltaKind::Decrease if new_qty >= old_qty => {
                return Err(DomainError::validation(format!(
                    "{key}: DECREASE delta requires new_qty < old_qty ({old_qty} -> {new_qty})"
                )));
            }
            _ => {}
        }

        Ok(ValidDelta {
            key,
            kind: self.kind,
            new_qty,
            old_qty,
            attributes: self.attributes.clone(),
        })
    }
}

/// A delta that passed [`LineDelta::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidDelta {
    pub key: LineKey,
    pub kind: DeltaKind,
    pub new_qty: Quantity,
    /// As reported by the ERP. Informational only: the applied change is always
    /// derived from the stored quantity.
    pub old_qty: Quantity,
    pub attributes: Option<LineAttributes>,
}

/// The change that will actually be applied, derived from stored state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EffectiveChange {
    /// Line did not exist; it will be created.
    Add { new: Quantity },
    Increase { old: Quantity, new: Quantity },
    Decrease { old: Quantity, new: Quantity, shortfall: Quantity },
    Remove { old: Quantity },
    /// Stored state already matches the delta (re-delivery).
    Unchanged,
}

impl EffectiveChange {
    pub fn kind(&self) -> Option<DeltaKind> {
        match self {
            EffectiveChange::Add { .. } => Some(DeltaKind::Add),
            EffectiveChange::Increase { .. } => Some(DeltaKind::Increase),
            EffectiveChange::Decrease { .. } => Some(DeltaKind::Decrease),
            EffectiveChange::Remove { .. } => Some(DeltaKind::Remove),
            EffectiveChange::Unchanged => None,
        }
    }
}

impl ValidDelta {
    /// Classify this delta against the currently stored demand (`None` when
    /// the line does not exist).
    pub fn effective_change(&self, stored: Option<Quantity>) -> EffectiveChange {
        match (self.kind, stored) {
            (DeltaKind::Remove, None) => EffectiveChange::Unchanged,
            (DeltaKind::Remove, Some(old)) => EffectiveChange::Remove { old },
            (_, None) => EffectiveChange::Add { new: self.new_qty },
            (_, Some(old)) if old == self.new_qty => EffectiveChange::Unchanged,
            (_, Some(old)) if self.new_qty > old => EffectiveChange::Increase {
                old,
                new: self.new_qty,
            },
            (_, Some(old)) => EffectiveChange::Decrease {
                old,
                new: self.new_qty,
                shortfall: old.saturating_sub(self.new_qty),
            },
        }
    }
}
