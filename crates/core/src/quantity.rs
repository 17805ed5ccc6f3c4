//! Non-negative decimal quantity.

use core::ops::Add;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A quantity of product units. Always `>= 0`.
///
/// Construction goes through [`Quantity::new`], so a negative value can never be
/// stored in a backlog line or a lot row. Deserialization validates too.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(DomainError::validation(format!(
                "quantity cannot be negative (got {value})"
            )));
        }
        Ok(Self(value.normalize()))
    }

    pub fn value(self) -> Decimal {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// `self - other`, clamped at zero.
    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        if other.0 >= self.0 {
            Quantity::ZERO
        } else {
            Quantity((self.0 - other.0).normalize())
        }
    }

    /// `self - other` when it stays non-negative.
    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        if other.0 > self.0 {
            None
        } else {
            Some(Quantity((self.0 - other.0).normalize()))
        }
    }

    pub fn min(self, other: Quantity) -> Quantity {
        if self.0 <= other.0 { self } else { other }
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Self) -> Self::Output {
        Quantity((self.0 + rhs.0).normalize())
    }
}

impl core::iter::Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Self {
        iter.fold(Quantity::ZERO, |acc, q| acc + q)
    }
}

impl TryFrom<Decimal> for Quantity {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Quantity::new(value)
    }
}

impl From<Quantity> for Decimal {
    fn from(value: Quantity) -> Self {
        value.0
    }
}

impl core::fmt::Display for Quantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn negative_quantity_is_rejected() {
        assert!(Quantity::new(dec!(-0.5)).is_err());
        assert!(Quantity::new(dec!(0)).is_ok());
    }

    #[test]
    fn equal_values_with_different_scale_compare_equal() {
        let a = Quantity::new(dec!(30)).unwrap();
        let b = Quantity::new(dec!(30.000)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn deserialization_validates_sign() {
        let err = serde_json::from_str::<Quantity>("\"-3\"");
        assert!(err.is_err());
        let ok: Quantity = serde_json::from_str("\"12.5\"").unwrap();
        assert_eq!(ok.value(), dec!(12.5));
    }

    proptest! {
        #[test]
        fn saturating_sub_never_goes_negative(a in 0i64..1_000_000, b in 0i64..1_000_000) {
            let qa = Quantity::new(Decimal::new(a, 2)).unwrap();
            let qb = Quantity::new(Decimal::new(b, 2)).unwrap();
            let diff = qa.saturating_sub(qb);
            prop_assert!(diff.value() >= Decimal::ZERO);
            prop_assert!(diff <= qa);
        }
    }
}
