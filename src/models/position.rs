//! Position model for the single leveraged futures position the bot holds.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of the futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => f.pad("LONG"),
            Side::Short => f.pad("SHORT"),
        }
    }
}

/// Lifecycle status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    /// Orders are being placed; not yet protected
    Opening,
    /// Entry filled and both stops registered
    Open,
    /// A close has been issued
    Closing,
    Closed,
}

impl PositionStatus {
    /// Anything but CLOSED counts toward the single-position limit.
    pub fn is_live(self) -> bool {
        !matches!(self, PositionStatus::Closed)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionStatus::Opening => "OPENING",
            PositionStatus::Open => "OPEN",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::Closed => "CLOSED",
        };
        f.pad(s)
    }
}

/// The position tracked by Position State.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,

    /// Average fill price; zero until the entry fills
    pub entry_price: Decimal,

    /// Contract quantity in base asset
    pub quantity: Decimal,

    pub leverage: u32,

    pub fixed_stop_order_id: Option<String>,
    pub trailing_stop_order_id: Option<String>,

    /// Trigger price of the fixed stop
    #[serde(default)]
    pub fixed_stop_price: Option<Decimal>,

    /// Trailing callback in percent (1.0 = 1%)
    #[serde(default)]
    pub trailing_callback_pct: Option<Decimal>,

    #[serde(default)]
    pub entry_order_id: Option<String>,

    /// Post that triggered the open; `None` for adopted positions
    #[serde(default)]
    pub source_event_id: Option<String>,

    pub opened_at: DateTime<Utc>,

    pub status: PositionStatus,
}

impl Position {
    /// Fresh OPENING record before any order has been placed.
    pub fn opening(side: Side, leverage: u32, source_event_id: Option<String>) -> Self {
        Self {
            side,
            entry_price: Decimal::ZERO,
            quantity: Decimal::ZERO,
            leverage,
            fixed_stop_order_id: None,
            trailing_stop_order_id: None,
            fixed_stop_price: None,
            trailing_callback_pct: None,
            entry_order_id: None,
            source_event_id,
            opened_at: Utc::now(),
            status: PositionStatus::Opening,
        }
    }

    /// Both protective orders are registered.
    pub fn is_protected(&self) -> bool {
        self.fixed_stop_order_id.is_some() && self.trailing_stop_order_id.is_some()
    }

    /// Notional value at entry.
    pub fn notional(&self) -> Decimal {
        self.entry_price * self.quantity
    }

    /// Margin committed at entry.
    pub fn margin(&self) -> Decimal {
        if self.leverage == 0 {
            return self.notional();
        }
        self.notional() / Decimal::from(self.leverage)
    }

    /// Unrealized P&L in quote currency at the given mark.
    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Decimal {
        let diff = match self.side {
            Side::Long => mark_price - self.entry_price,
            Side::Short => self.entry_price - mark_price,
        };
        diff * self.quantity
    }

    /// Return on margin as a fraction (0.1 = 10%).
    pub fn roe(&self, mark_price: Decimal) -> Decimal {
        let margin = self.margin();
        if margin.is_zero() {
            return Decimal::ZERO;
        }
        self.unrealized_pnl(mark_price) / margin
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}x @ {} [{}]",
            self.side, self.quantity, self.leverage, self.entry_price, self.status
        )
    }
}
