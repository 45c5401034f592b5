//! Exchange gateway contract.
//!
//! The gateway executes order, position and account operations and reports
//! raw results. It holds no authoritative position data; Position State
//! owns that.

use std::sync::Arc;

use futures::future::BoxFuture;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::GatewayResult;
use crate::models::Side;

/// Order side on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that opens a position in the given direction.
    pub fn entry(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Side that reduces a position in the given direction.
    pub fn exit(side: Side) -> Self {
        Self::entry(side.opposite())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Which protective order is being placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StopKind {
    Fixed,
    Trailing,
}

impl std::fmt::Display for StopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopKind::Fixed => write!(f, "FIXED"),
            StopKind::Trailing => write!(f, "TRAILING"),
        }
    }
}

/// Market order request. The client order id is reused verbatim on
/// retries so the exchange can reject a double submission.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrder {
    pub client_order_id: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub reduce_only: bool,
}

/// Trigger condition of a protective order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopTrigger {
    /// Fire at an absolute price
    Price(Decimal),
    /// Trail the best price by a callback in percent
    Callback(Decimal),
}

/// Reduce-only protective order request.
#[derive(Debug, Clone, PartialEq)]
pub struct StopOrder {
    pub client_order_id: String,
    pub kind: StopKind,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub trigger: StopTrigger,
}

/// Exchange acknowledgement for a submitted order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    /// Average fill price when the exchange reports one
    pub avg_price: Option<Decimal>,
    pub executed_qty: Decimal,
}

/// Account balances in the margin asset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balance {
    pub total: Decimal,
    pub available: Decimal,
}

/// Exchange view of the open position, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
}

/// Resting order on the book.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub order_id: String,
    pub client_order_id: String,
    /// `None` for order types that are not protective stops
    pub stop_kind: Option<StopKind>,
    pub side: OrderSide,
    pub stop_price: Option<Decimal>,
    pub callback_rate: Option<Decimal>,
}

/// Operations the trading core needs from an exchange.
///
/// Implementations classify failures into [`GatewayError`](crate::error::GatewayError)
/// variants; retrying is the job of [`RetryingGateway`](super::RetryingGateway).
pub trait ExchangeGateway: Send + Sync {
    fn set_leverage(&self, leverage: u32) -> BoxFuture<'_, GatewayResult<()>>;

    fn mark_price(&self) -> BoxFuture<'_, GatewayResult<Decimal>>;

    fn balance(&self) -> BoxFuture<'_, GatewayResult<Balance>>;

    fn place_market_order(&self, order: MarketOrder) -> BoxFuture<'_, GatewayResult<OrderAck>>;

    fn place_stop_order(&self, order: StopOrder) -> BoxFuture<'_, GatewayResult<OrderAck>>;

    fn position(&self) -> BoxFuture<'_, GatewayResult<Option<PositionSnapshot>>>;

    fn open_orders(&self) -> BoxFuture<'_, GatewayResult<Vec<OpenOrder>>>;

    fn cancel_all_orders(&self) -> BoxFuture<'_, GatewayResult<()>>;

    /// Flatten whatever position exists with a reduce-only market order.
    /// Returns `None` when there was nothing to close.
    fn close_position(&self, client_order_id: String) -> BoxFuture<'_, GatewayResult<Option<OrderAck>>>;
}

pub type DynGateway = Arc<dyn ExchangeGateway>;

/// Client order id accepted by the exchange (at most 36 characters).
pub fn new_client_order_id() -> String {
    format!("st-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_sides() {
        assert_eq!(OrderSide::entry(Side::Long), OrderSide::Buy);
        assert_eq!(OrderSide::exit(Side::Long), OrderSide::Sell);
        assert_eq!(OrderSide::entry(Side::Short), OrderSide::Sell);
        assert_eq!(OrderSide::exit(Side::Short), OrderSide::Buy);
    }

    #[test]
    fn test_client_order_id_fits_exchange_limit() {
        let id = new_client_order_id();
        assert!(id.len() <= 36);
        assert_ne!(id, new_client_order_id());
    }
}
