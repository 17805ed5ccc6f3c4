use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lotsync_core::{OrderNumber, ProductCode, Quantity};

/// Composite key of a backlog line: one row per (order, product).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineKey {
    pub order_number: OrderNumber,
    pub product_code: ProductCode,
}

impl LineKey {
    pub fn new(order_number: OrderNumber, product_code: ProductCode) -> Self {
        Self {
            order_number,
            product_code,
        }
    }
}

impl core::fmt::Display for LineKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.order_number, self.product_code)
    }
}

/// Shipping context of a line (and, snapshotted, of a lot row).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Scheduling {
    pub expedition_date: Option<NaiveDate>,
    pub appointment_date: Option<NaiveDate>,
    pub protocol: Option<String>,
    pub appointment_confirmed: bool,
}

/// Denormalized customer/geography fields used for routing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Routing {
    pub customer_name: Option<String>,
    pub city: Option<String>,
    /// Two-letter state code (UF).
    pub state: Option<String>,
    pub route: Option<String>,
}

/// Per-unit figures used to derive lot weight, pallets and value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnitMetrics {
    pub unit_price: Decimal,
    pub unit_weight: Decimal,
    /// Units that fit on one pallet; `None` when the product is not palletized.
    pub units_per_pallet: Option<Decimal>,
}

impl UnitMetrics {
    pub fn value_for(&self, qty: Quantity) -> Decimal {
        self.unit_price * qty.value()
    }

    pub fn weight_for(&self, qty: Quantity) -> Decimal {
        self.unit_weight * qty.value()
    }

    pub fn pallets_for(&self, qty: Quantity) -> Decimal {
        match self.units_per_pallet {
            Some(per_pallet) if !per_pallet.is_zero() => qty.value() / per_pallet,
            _ => Decimal::ZERO,
        }
    }
}

/// Descriptive attributes the ERP sends alongside a line's quantity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineAttributes {
    pub cnpj: String,
    pub scheduling: Scheduling,
    pub routing: Routing,
    pub metrics: UnitMetrics,
}

/// One (order, product) demand row from the ERP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogLine {
    pub key: LineKey,
    pub demanded_qty: Quantity,
    pub cnpj: String,
    pub scheduling: Scheduling,
    pub routing: Routing,
    pub metrics: UnitMetrics,
    pub updated_at: DateTime<Utc>,
}

impl BacklogLine {
    pub fn new(key: LineKey, demanded_qty: Quantity, updated_at: DateTime<Utc>) -> Self {
        Self {
            key,
            demanded_qty,
            cnpj: String::new(),
            scheduling: Scheduling::default(),
            routing: Routing::default(),
            metrics: UnitMetrics::default(),
            updated_at,
        }
    }

    pub fn with_attributes(mut self, attributes: LineAttributes) -> Self {
        self.cnpj = attributes.cnpj;
        self.scheduling = attributes.scheduling;
        self.routing = attributes.routing;
        self.metrics = attributes.metrics;
        self
    }

    pub fn with_expedition_date(mut self, date: NaiveDate) -> Self {
        self.scheduling.expedition_date = Some(date);
        self
    }

    pub fn attributes(&self) -> LineAttributes {
        LineAttributes {
            cnpj: self.cnpj.clone(),
            scheduling: self.scheduling.clone(),
            routing: self.routing.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn order_number(&self) -> &OrderNumber {
        &self.key.order_number
    }

    pub fn product_code(&self) -> &ProductCode {
        &self.key.product_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn pallets_are_zero_when_not_palletized() {
        let metrics = UnitMetrics {
            unit_price: dec!(10),
            unit_weight: dec!(1.5),
            units_per_pallet: None,
        };
        let qty = Quantity::new(dec!(40)).unwrap();
        assert_eq!(metrics.pallets_for(qty), Decimal::ZERO);
        assert_eq!(metrics.weight_for(qty), dec!(60));
        assert_eq!(metrics.value_for(qty), dec!(400));
    }

    #[test]
    fn pallets_divide_by_units_per_pallet() {
        let metrics = UnitMetrics {
            units_per_pallet: Some(dec!(20)),
            ..UnitMetrics::default()
        };
        assert_eq!(metrics.pallets_for(Quantity::new(dec!(50)).unwrap()), dec!(2.5));
    }
}
