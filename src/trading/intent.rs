//! Decides what a sentiment event should do given the current position.

use std::fmt;

use crate::models::{Position, PositionStatus, Score, Side};

use super::config::SignalPolicy;
use super::risk::{RiskCalculator, RiskProfile};

/// Why an event produced no trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Post id already processed
    Duplicate,
    Neutral,
    /// A position is already live
    PositionLive(PositionStatus),
    /// Another writer claimed the slot first
    Raced,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Duplicate => write!(f, "duplicate event"),
            SkipReason::Neutral => write!(f, "neutral score"),
            SkipReason::PositionLive(status) => write!(f, "position already {}", status),
            SkipReason::Raced => write!(f, "position slot claimed concurrently"),
        }
    }
}

/// Outcome of evaluating one score.
#[derive(Debug, Clone, PartialEq)]
pub enum TradeIntent {
    Skip(SkipReason),
    Open { side: Side, profile: RiskProfile },
    /// Close the live position, then evaluate the event again
    CloseThenReevaluate,
}

impl TradeIntent {
    pub fn evaluate(
        score: Score,
        current: Option<&Position>,
        policy: SignalPolicy,
        calculator: &RiskCalculator,
    ) -> Self {
        let side = RiskCalculator::side_for(score);

        if let Some(pos) = current {
            let opposite = side.is_some_and(|s| s != pos.side);
            if policy == SignalPolicy::CloseOnOpposite
                && pos.status == PositionStatus::Open
                && opposite
            {
                return TradeIntent::CloseThenReevaluate;
            }
            return TradeIntent::Skip(SkipReason::PositionLive(pos.status));
        }

        match (side, calculator.derive(score)) {
            (Some(side), Some(profile)) => TradeIntent::Open { side, profile },
            _ => TradeIntent::Skip(SkipReason::Neutral),
        }
    }
}
