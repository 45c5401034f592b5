//! Exchange access: gateway contract, Binance futures client, retry
//! decorator and paper exchange.

mod binance;
mod gateway;
pub mod paper;
mod retry;

pub use binance::{BinanceClient, BinanceConfig};
pub use gateway::{
    new_client_order_id, DynGateway, ExchangeGateway, MarketOrder, OrderSide, PositionSnapshot,
    StopKind, StopOrder, StopTrigger,
};
pub use paper::PaperExchange;
pub use retry::{retry_bounded, RetryPolicy, RetryingGateway};
