//! Trading configuration.

use std::fmt;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::api::RetryPolicy;

/// What to do with a signal that arrives while a position is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SignalPolicy {
    /// Ignore new signals until the stops close the position
    #[default]
    SkipWhileOpen,
    /// Close on an opposite-side signal, then open the new side
    CloseOnOpposite,
}

impl fmt::Display for SignalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalPolicy::SkipWhileOpen => write!(f, "skip-while-open"),
            SignalPolicy::CloseOnOpposite => write!(f, "close-on-opposite"),
        }
    }
}

/// Configuration for sizing, protection and lifecycle handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Futures symbol traded
    pub symbol: String,

    /// Maximum loss at the fixed stop, in percent of allocated margin
    pub max_account_loss_pct: Decimal,

    /// Resubmission policy for a failed protective order
    pub stop_retry: RetryPolicy,

    /// How many recent post ids are remembered for replay protection
    pub dedupe_capacity: usize,

    /// Seconds between reconciliation passes
    pub reconcile_interval_secs: u64,

    pub signal_policy: SignalPolicy,

    /// Decimal places of the quantity step
    pub quantity_dp: u32,

    /// Decimal places of the price tick
    pub price_dp: u32,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            max_account_loss_pct: dec!(1.0),  // 1% of margin at the fixed stop
            stop_retry: RetryPolicy {
                max_attempts: 3,
                initial_interval: Duration::from_millis(500),
                max_interval: Duration::from_secs(4),
                multiplier: 2.0,
                call_timeout: Duration::from_secs(10),
            },
            dedupe_capacity: 1024,
            reconcile_interval_secs: 60,
            signal_policy: SignalPolicy::SkipWhileOpen,
            quantity_dp: 3,                   // 0.001 BTC step
            price_dp: 1,                      // 0.1 USDT tick
        }
    }
}

impl TradingConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}
