//! Risk calculator: maps a sentiment score to leverage and stop parameters.
//!
//! Leverage and trailing callback widen as the score moves away from
//! neutral. The fixed stop is sized so the loss when it fires is the same
//! fraction of margin at every leverage: its price distance is
//! `max_account_loss_pct / leverage`.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::{Score, Side};

/// Leverage and trailing callback (percent) by distance from neutral.
const BUCKETS: [(u32, Decimal); 5] = [
    (3, dec!(2.0)),   // slight (4/6)
    (10, dec!(1.5)),  // somewhat (3/7)
    (15, dec!(1.0)),  // moderate (2/8)
    (30, dec!(0.75)), // very (1/9)
    (50, dec!(0.5)),  // extreme (0/10)
];

/// Derived risk parameters for one score. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub leverage: u32,

    /// Loss bound at the fixed stop, percent of margin
    pub fixed_stop_loss_pct: Decimal,

    /// Trailing stop callback, percent of price
    pub trailing_callback_pct: Decimal,
}

impl RiskProfile {
    /// Adverse price move, as a fraction of entry, at which the fixed
    /// stop fires.
    pub fn stop_distance(&self) -> Decimal {
        self.fixed_stop_loss_pct / dec!(100) / Decimal::from(self.leverage)
    }

    /// Fixed stop trigger for a fill, rounded toward the entry so the
    /// loss never exceeds the bound.
    pub fn fixed_stop_price(&self, side: Side, entry_price: Decimal, price_dp: u32) -> Decimal {
        let distance = entry_price * self.stop_distance();
        match side {
            Side::Long => (entry_price - distance)
                .round_dp_with_strategy(price_dp, RoundingStrategy::ToPositiveInfinity),
            Side::Short => (entry_price + distance)
                .round_dp_with_strategy(price_dp, RoundingStrategy::ToNegativeInfinity),
        }
    }

    /// Contract quantity committing the whole free balance as margin.
    pub fn quantity_for(&self, available: Decimal, mark_price: Decimal, quantity_dp: u32) -> Decimal {
        if available <= Decimal::ZERO || mark_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (available * Decimal::from(self.leverage) / mark_price)
            .round_dp_with_strategy(quantity_dp, RoundingStrategy::ToZero)
    }
}

/// Pure score → profile mapping.
#[derive(Debug, Clone, Copy)]
pub struct RiskCalculator {
    max_account_loss_pct: Decimal,
}

impl Default for RiskCalculator {
    fn default() -> Self {
        Self::new(dec!(1.0))
    }
}

impl RiskCalculator {
    pub fn new(max_account_loss_pct: Decimal) -> Self {
        Self {
            max_account_loss_pct,
        }
    }

    /// `None` iff the score is neutral.
    pub fn derive(&self, score: Score) -> Option<RiskProfile> {
        let intensity = score.intensity();
        if intensity == 0 {
            return None;
        }
        let (leverage, callback) = BUCKETS[(intensity - 1) as usize];
        Some(RiskProfile {
            leverage,
            fixed_stop_loss_pct: self.max_account_loss_pct,
            trailing_callback_pct: callback,
        })
    }

    /// Direction implied by a score; `None` when neutral.
    pub fn side_for(score: Score) -> Option<Side> {
        match score.value() {
            0..=4 => Some(Side::Short),
            6..=10 => Some(Side::Long),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TradeError;

    fn score(v: i64) -> Score {
        Score::new(v).unwrap()
    }

    #[test]
    fn test_neutral_only_yields_none() {
        let calc = RiskCalculator::default();
        for s in 0..=10 {
            assert_eq!(calc.derive(score(s)).is_none(), s == 5, "score {}", s);
        }
    }

    #[test]
    fn test_table_is_symmetric() {
        let calc = RiskCalculator::default();
        for d in 1..=5 {
            assert_eq!(calc.derive(score(5 - d)), calc.derive(score(5 + d)));
        }
        let extreme = calc.derive(score(10)).unwrap();
        assert_eq!(extreme.leverage, 50);
        assert_eq!(extreme.trailing_callback_pct, dec!(0.5));
        let slight = calc.derive(score(4)).unwrap();
        assert_eq!(slight.leverage, 3);
        assert_eq!(slight.trailing_callback_pct, dec!(2.0));
    }

    #[test]
    fn test_monotonic_in_distance_from_neutral() {
        let calc = RiskCalculator::default();
        for s in 6..10 {
            let inner = calc.derive(score(s)).unwrap();
            let outer = calc.derive(score(s + 1)).unwrap();
            assert!(outer.leverage > inner.leverage);
            assert!(outer.trailing_callback_pct < inner.trailing_callback_pct);
            assert_eq!(outer.fixed_stop_loss_pct, inner.fixed_stop_loss_pct);
        }
    }

    #[test]
    fn test_loss_at_fixed_stop_is_bounded() {
        let calc = RiskCalculator::default();
        let margin = dec!(1000);
        let entry = dec!(60000);
        for s in [0, 1, 2, 3, 4, 6, 7, 8, 9, 10] {
            let profile = calc.derive(score(s)).unwrap();
            let notional = margin * Decimal::from(profile.leverage);
            let loss = notional * profile.stop_distance();
            assert_eq!(loss.round_dp(8), dec!(10), "score {}", s);

            let qty = profile.quantity_for(margin, entry, 3);
            let stop = profile.fixed_stop_price(Side::Long, entry, 1);
            assert!((entry - stop) * qty <= dec!(10));
        }
    }

    #[test]
    fn test_score_eight_stop_distance() {
        let profile = RiskCalculator::default().derive(score(8)).unwrap();
        assert_eq!(profile.leverage, 15);
        assert_eq!(profile.trailing_callback_pct, dec!(1.0));
        // 1% / 15 ≈ 0.0667% of price
        assert_eq!(profile.fixed_stop_price(Side::Long, dec!(60000), 1), dec!(59960));
        assert_eq!(profile.fixed_stop_price(Side::Short, dec!(60000), 1), dec!(60040));
    }

    #[test]
    fn test_invalid_score_rejected() {
        assert!(matches!(Score::new(11), Err(TradeError::InvalidScore(11))));
        assert!(RiskCalculator::default().derive(score(5)).is_none());
    }

    #[test]
    fn test_quantity_truncates_to_step() {
        let profile = RiskCalculator::default().derive(score(7)).unwrap();
        // 1000 * 10 / 64321 = 0.15547...
        assert_eq!(profile.quantity_for(dec!(1000), dec!(64321), 3), dec!(0.155));
        assert_eq!(profile.quantity_for(Decimal::ZERO, dec!(64321), 3), Decimal::ZERO);
    }
}
