//! Pure shortfall distribution over a line's lots.

use serde::{Deserialize, Serialize};

use lotsync_core::{DomainError, Quantity};
use lotsync_separation::{LotPhase, LotRowKey, SeparationLot};

/// How much of a demand decrease is taken out of existing lots.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutPolicy {
    /// Cut the whole shortfall (stored demand minus new demand).
    #[default]
    FullDelta,
    /// Cut only what no longer fits under the new demand, capped by the shortfall.
    ExcessOnly,
}

impl CutPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CutPolicy::FullDelta => "full_delta",
            CutPolicy::ExcessOnly => "excess_only",
        }
    }

    /// Quantity to remove from `lots` after demand dropped to `new_demand`.
    pub fn cut_amount(&self, lots: &[SeparationLot], new_demand: Quantity, shortfall: Quantity) -> Quantity {
        match self {
            CutPolicy::FullDelta => shortfall,
            CutPolicy::ExcessOnly => {
                let allocated: Quantity = lots
                    .iter()
                    .filter(|lot| lot.phase() != LotPhase::Closed)
                    .map(|lot| lot.allocated_qty)
                    .sum();
                allocated.saturating_sub(new_demand).min(shortfall)
            }
        }
    }
}

impl core::str::FromStr for CutPolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full_delta" => Ok(CutPolicy::FullDelta),
            "excess_only" => Ok(CutPolicy::ExcessOnly),
            other => Err(DomainError::validation(format!("unknown cut policy '{other}'"))),
        }
    }
}

/// One planned reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotCut {
    pub key: LotRowKey,
    pub phase: LotPhase,
    pub before: Quantity,
    pub after: Quantity,
    /// Pre-quote rows that reach zero are deleted instead of kept at zero.
    pub deleted: bool,
}

impl LotCut {
    pub fn absorbed(&self) -> Quantity {
        self.before.saturating_sub(self.after)
    }

    /// Quoted or shipped lots are touched only with a human-visible alert.
    pub fn raises_alert(&self) -> bool {
        self.phase == LotPhase::Committed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CutPlan {
    pub cuts: Vec<LotCut>,
    /// Part of the amount no lot could absorb.
    pub unabsorbed: Quantity,
}

/// Distribute `amount` over `lots`.
///
/// Pre-quote lots are consumed first, then quoted-or-later lots; within each
/// group smallest allocation first, ties by lot id. Invoiced lots are never
/// touched. Empty pre-quote lots are always deleted, whatever the amount;
/// empty quoted lots are left as they are.
pub fn plan_cuts(lots: &[SeparationLot], amount: Quantity) -> CutPlan {
    let mut cuts: Vec<LotCut> = lots
        .iter()
        .filter(|lot| lot.phase() == LotPhase::PreQuote && lot.allocated_qty.is_zero())
        .map(|lot| LotCut {
            key: lot.key.clone(),
            phase: LotPhase::PreQuote,
            before: Quantity::ZERO,
            after: Quantity::ZERO,
            deleted: true,
        })
        .collect();
    cuts.sort_by(|a, b| a.key.cmp(&b.key));

    let mut ordered: Vec<&SeparationLot> = lots
        .iter()
        .filter(|lot| lot.phase() != LotPhase::Closed && !lot.allocated_qty.is_zero())
        .collect();
    ordered.sort_by(|a, b| {
        phase_rank(a.phase())
            .cmp(&phase_rank(b.phase()))
            .then(a.allocated_qty.cmp(&b.allocated_qty))
            .then_with(|| a.key.cmp(&b.key))
    });

    let mut remaining = amount;
    for lot in ordered {
        if remaining.is_zero() {
            break;
        }
        let take = remaining.min(lot.allocated_qty);
        let after = lot.allocated_qty.saturating_sub(take);
        remaining = remaining.saturating_sub(take);
        cuts.push(LotCut {
            key: lot.key.clone(),
            phase: lot.phase(),
            before: lot.allocated_qty,
            after,
            deleted: lot.phase() == LotPhase::PreQuote && after.is_zero(),
        });
    }

    CutPlan {
        cuts,
        unabsorbed: remaining,
    }
}

fn phase_rank(phase: LotPhase) -> u8 {
    match phase {
        LotPhase::PreQuote => 0,
        LotPhase::Committed => 1,
        LotPhase::Closed => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{lot, qty};
    use lotsync_separation::LotStatus;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[test]
    fn pre_quote_lots_absorb_first() {
        let lots = vec![
            lot("L2", dec!(40), LotStatus::Quoted),
            lot("L1", dec!(10), LotStatus::Preview),
        ];
        let plan = plan_cuts(&lots, qty(dec!(5)));
        assert_eq!(plan.cuts.len(), 1);
        assert_eq!(plan.cuts[0].key.lot_id.as_str(), "L1");
        assert_eq!(plan.cuts[0].after, qty(dec!(5)));
        assert!(!plan.cuts[0].deleted);
    }

    #[test]
    fn exhausted_pre_quote_lots_are_deleted_and_quoted_lots_kept() {
        let lots = vec![
            lot("L1", dec!(10), LotStatus::Preview),
            lot("L2", dec!(40), LotStatus::Quoted),
        ];
        let plan = plan_cuts(&lots, qty(dec!(45)));
        assert_eq!(plan.cuts.len(), 2);
        assert!(plan.cuts[0].deleted);
        assert_eq!(plan.cuts[1].before, qty(dec!(40)));
        assert_eq!(plan.cuts[1].after, qty(dec!(5)));
        assert!(plan.cuts[1].raises_alert());
        assert!(plan.unabsorbed.is_zero());

        // Quoted lots bottom out at zero but stay.
        let plan = plan_cuts(&lots, qty(dec!(80)));
        assert!(!plan.cuts[1].deleted);
        assert_eq!(plan.cuts[1].after, Quantity::ZERO);
        assert_eq!(plan.unabsorbed, qty(dec!(30)));
    }

    #[test]
    fn ties_break_on_lot_id() {
        let lots = vec![
            lot("L9", dec!(10), LotStatus::Open),
            lot("L3", dec!(10), LotStatus::Preview),
        ];
        let plan = plan_cuts(&lots, qty(dec!(4)));
        assert_eq!(plan.cuts[0].key.lot_id.as_str(), "L3");
    }

    #[test]
    fn empty_pre_quote_lots_are_deleted_even_without_a_cut() {
        let lots = vec![
            lot("L1", dec!(0), LotStatus::Preview),
            lot("L2", dec!(0), LotStatus::Quoted),
            lot("L3", dec!(10), LotStatus::Open),
        ];

        let plan = plan_cuts(&lots, Quantity::ZERO);
        assert_eq!(plan.cuts.len(), 1);
        assert_eq!(plan.cuts[0].key.lot_id.as_str(), "L1");
        assert!(plan.cuts[0].deleted);
        assert!(plan.cuts[0].absorbed().is_zero());

        let plan = plan_cuts(&lots, qty(dec!(4)));
        let ids: Vec<&str> = plan.cuts.iter().map(|c| c.key.lot_id.as_str()).collect();
        assert_eq!(ids, ["L1", "L3"]);
        assert_eq!(plan.cuts[1].after, qty(dec!(6)));
        assert!(plan.unabsorbed.is_zero());
    }

    #[test]
    fn invoiced_lots_are_ignored() {
        let lots = vec![lot("L1", dec!(10), LotStatus::Invoiced)];
        let plan = plan_cuts(&lots, qty(dec!(4)));
        assert!(plan.cuts.is_empty());
        assert_eq!(plan.unabsorbed, qty(dec!(4)));
    }

    #[test]
    fn excess_only_leaves_fitting_lots_alone() {
        // Demand 100 -> 60, but only 50 is allocated: nothing to cut.
        let lots = vec![lot("L1", dec!(50), LotStatus::Open)];
        let amount = CutPolicy::ExcessOnly.cut_amount(&lots, qty(dec!(60)), qty(dec!(40)));
        assert!(amount.is_zero());
        let amount = CutPolicy::ExcessOnly.cut_amount(&lots, qty(dec!(30)), qty(dec!(70)));
        assert_eq!(amount, qty(dec!(20)));
        let amount = CutPolicy::FullDelta.cut_amount(&lots, qty(dec!(60)), qty(dec!(40)));
        assert_eq!(amount, qty(dec!(40)));
    }

    #[test]
    fn cut_policy_parses_config_values() {
        assert_eq!("EXCESS_ONLY".parse::<CutPolicy>().unwrap(), CutPolicy::ExcessOnly);
        assert!("half".parse::<CutPolicy>().is_err());
    }

    fn status_strategy() -> impl Strategy<Value = LotStatus> {
        prop_oneof![
            Just(LotStatus::Preview),
            Just(LotStatus::Open),
            Just(LotStatus::Quoted),
            Just(LotStatus::Shipped),
            Just(LotStatus::Invoiced),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the plan absorbs exactly min(amount, cuttable), never goes
        /// negative, and touches quoted lots only once pre-quote lots are gone.
        #[test]
        fn plan_conserves_quantity(
            lots in prop::collection::vec((0i64..500, status_strategy()), 0..6),
            amount in 0i64..2_000,
        ) {
            let lots: Vec<SeparationLot> = lots
                .into_iter()
                .enumerate()
                .map(|(i, (allocated, status))| lot(&format!("L{i}"), Decimal::from(allocated), status))
                .collect();
            let amount = qty(Decimal::from(amount));
            let plan = plan_cuts(&lots, amount);

            let cuttable: Quantity = lots
                .iter()
                .filter(|l| l.phase() != LotPhase::Closed)
                .map(|l| l.allocated_qty)
                .sum();
            let absorbed: Quantity = plan.cuts.iter().map(|c| c.absorbed()).sum();
            prop_assert_eq!(absorbed, amount.min(cuttable));
            prop_assert_eq!(absorbed + plan.unabsorbed, amount);

            for cut in &plan.cuts {
                prop_assert!(cut.after <= cut.before);
                prop_assert!(cut.phase != LotPhase::Closed);
                prop_assert!(!cut.deleted || (cut.phase == LotPhase::PreQuote && cut.after.is_zero()));
            }

            if plan.cuts.iter().any(|c| c.phase == LotPhase::Committed) {
                let pre_quote_left: Quantity = lots
                    .iter()
                    .filter(|l| l.phase() == LotPhase::PreQuote)
                    .map(|l| {
                        plan.cuts
                            .iter()
                            .find(|c| c.key == l.key)
                            .map_or(l.allocated_qty, |c| c.after)
                    })
                    .sum();
                prop_assert!(pre_quote_left.is_zero());
            }
        }
    }
}
