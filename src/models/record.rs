//! Audit records emitted on every state transition.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Position;

/// What the core did in response to an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordAction {
    Skip,
    OpenLong,
    OpenShort,
    Close,
    Abort,
    EmergencyClose,
    DriftCorrected,
    Adopted,
}

impl fmt::Display for RecordAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordAction::Skip => "SKIP",
            RecordAction::OpenLong => "OPEN_LONG",
            RecordAction::OpenShort => "OPEN_SHORT",
            RecordAction::Close => "CLOSE",
            RecordAction::Abort => "ABORT",
            RecordAction::EmergencyClose => "EMERGENCY_CLOSE",
            RecordAction::DriftCorrected => "DRIFT_CORRECTED",
            RecordAction::Adopted => "ADOPTED",
        };
        write!(f, "{}", s)
    }
}

/// Realized result of a close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseSummary {
    pub exit_price: Decimal,
    pub pnl_usd: Decimal,
    /// Return on margin in percent
    pub pnl_pct: Decimal,
    pub reason: String,
}

impl CloseSummary {
    /// Settle `position` at `exit_price`.
    pub fn settle(position: &Position, exit_price: Decimal, reason: impl ToString) -> Self {
        Self {
            exit_price,
            pnl_usd: position.unrealized_pnl(exit_price),
            pnl_pct: (position.roe(exit_price) * Decimal::from(100)).round_dp(2),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for CloseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exit {} | PnL {} USDT ({}%) | {}",
            self.exit_price,
            self.pnl_usd.round_dp(2),
            self.pnl_pct,
            self.reason
        )
    }
}

/// One row of transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub timestamp: DateTime<Utc>,

    /// Source post id, or a synthetic id for reconciler/operator actions
    pub event_id: String,

    pub action: RecordAction,

    /// Resulting position snapshot, `None` when flat
    pub position: Option<Position>,

    pub error: Option<String>,

    /// Exit price and realized PnL for completed closes
    pub close: Option<CloseSummary>,
}

impl TransitionRecord {
    pub fn new(event_id: impl Into<String>, action: RecordAction, position: Option<Position>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id: event_id.into(),
            action,
            position,
            error: None,
            close: None,
        }
    }

    pub fn with_close(mut self, close: Option<CloseSummary>) -> Self {
        self.close = close;
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::models::{PositionStatus, Side};

    fn position(side: Side) -> Position {
        let mut pos = Position::opening(side, 10, None);
        pos.entry_price = dec!(60000);
        pos.quantity = dec!(0.1);
        pos.status = PositionStatus::Closed;
        pos
    }

    #[test]
    fn test_settle_long_profit() {
        let close = CloseSummary::settle(&position(Side::Long), dec!(61000), "operator request");
        assert_eq!(close.pnl_usd, dec!(100));
        // margin 600, so +100 is 16.67% on margin
        assert_eq!(close.pnl_pct, dec!(16.67));
        assert_eq!(close.reason, "operator request");
    }

    #[test]
    fn test_settle_short_loss() {
        let close = CloseSummary::settle(&position(Side::Short), dec!(60060), "stop");
        assert_eq!(close.pnl_usd, dec!(-6));
        assert_eq!(close.pnl_pct, dec!(-1));
    }
}
