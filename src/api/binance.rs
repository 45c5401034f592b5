//! Binance USDⓈ-M futures REST client.
//!
//! Handles:
//! - HMAC-SHA256 request signing (`X-MBX-APIKEY` header + `signature` param)
//! - Error classification from HTTP status and Binance error codes
//! - Exchange precision (0.001 quantity step, 0.1 price tick)

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info};

use crate::error::{GatewayError, GatewayResult};
use crate::models::Side;

use super::gateway::{
    Balance, ExchangeGateway, MarketOrder, OpenOrder, OrderAck, OrderSide, PositionSnapshot,
    StopKind, StopOrder, StopTrigger,
};

/// Futures API base URLs
pub const MAINNET_URL: &str = "https://fapi.binance.com";
pub const TESTNET_URL: &str = "https://testnet.binancefuture.com";

const RECV_WINDOW_MS: u64 = 5000;
const QUANTITY_DP: u32 = 3;
const PRICE_DP: u32 = 1;

type HmacSha256 = Hmac<Sha256>;

/// Credentials and endpoint selection.
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
    pub symbol: String,
}

impl BinanceConfig {
    /// Create from environment variables:
    /// - BINANCE_API_KEY
    /// - BINANCE_API_SECRET
    /// - BINANCE_TESTNET (defaults to true)
    /// - TRADING_SYMBOL (defaults to BTCUSDT)
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY not set")?;
        let api_secret =
            std::env::var("BINANCE_API_SECRET").context("BINANCE_API_SECRET not set")?;
        let testnet = std::env::var("BINANCE_TESTNET")
            .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(true);
        let symbol = std::env::var("TRADING_SYMBOL").unwrap_or_else(|_| "BTCUSDT".to_string());

        Ok(Self {
            api_key,
            api_secret,
            testnet,
            symbol,
        })
    }

    pub fn base_url(&self) -> &'static str {
        if self.testnet {
            TESTNET_URL
        } else {
            MAINNET_URL
        }
    }
}

/// Binance error body: `{"code":-2019,"msg":"Margin is insufficient."}`
#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    mark_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountInfo {
    total_wallet_balance: Decimal,
    available_balance: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    client_order_id: String,
    #[serde(default)]
    avg_price: Option<Decimal>,
    #[serde(default)]
    executed_qty: Decimal,
}

impl From<OrderResponse> for OrderAck {
    fn from(resp: OrderResponse) -> Self {
        OrderAck {
            order_id: resp.order_id.to_string(),
            client_order_id: resp.client_order_id,
            avg_price: resp.avg_price.filter(|p| !p.is_zero()),
            executed_qty: resp.executed_qty,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    position_amt: Decimal,
    entry_price: Decimal,
    mark_price: Decimal,
    #[serde(default)]
    un_realized_profit: Decimal,
    leverage: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestingOrder {
    order_id: u64,
    client_order_id: String,
    #[serde(rename = "type")]
    order_type: String,
    side: OrderSide,
    #[serde(default)]
    stop_price: Option<Decimal>,
    #[serde(default)]
    price_rate: Option<Decimal>,
}

impl From<RestingOrder> for OpenOrder {
    fn from(order: RestingOrder) -> Self {
        let stop_kind = match order.order_type.as_str() {
            "STOP_MARKET" | "STOP" => Some(StopKind::Fixed),
            "TRAILING_STOP_MARKET" => Some(StopKind::Trailing),
            _ => None,
        };
        OpenOrder {
            order_id: order.order_id.to_string(),
            client_order_id: order.client_order_id,
            stop_kind,
            side: order.side,
            stop_price: order.stop_price.filter(|p| !p.is_zero()),
            callback_rate: order.price_rate,
        }
    }
}

/// Signed REST client for one futures symbol.
pub struct BinanceClient {
    http: Client,
    config: BinanceConfig,
}

impl BinanceClient {
    pub fn new(config: BinanceConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to create HTTP client")?;

        info!(
            testnet = config.testnet,
            symbol = %config.symbol,
            "Binance futures client initialized"
        );

        Ok(Self { http, config })
    }

    pub fn symbol(&self) -> &str {
        &self.config.symbol
    }

    /// Sign a query string with the API secret.
    fn sign(&self, query: &str) -> GatewayResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .map_err(|e| GatewayError::Auth(format!("invalid secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
        signed: bool,
    ) -> GatewayResult<T> {
        let mut query = encode_query(&params);
        if signed {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!(
                "recvWindow={}&timestamp={}",
                RECV_WINDOW_MS,
                Utc::now().timestamp_millis()
            ));
            let signature = self.sign(&query)?;
            query.push_str(&format!("&signature={}", signature));
        }

        let url = if query.is_empty() {
            format!("{}{}", self.config.base_url(), path)
        } else {
            format!("{}{}?{}", self.config.base_url(), path, query)
        };
        debug!(method = %method, path = path, "Binance request");

        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.config.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if !status.is_success() {
            return Err(classify(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| GatewayError::Other(format!("unexpected response on {}: {}", path, e)))
    }

    fn symbol_param(&self) -> (&'static str, String) {
        ("symbol", self.config.symbol.clone())
    }

    async fn fetch_position(&self) -> GatewayResult<Option<PositionSnapshot>> {
        let risks: Vec<PositionRisk> = self
            .request(Method::GET, "/fapi/v2/positionRisk", vec![self.symbol_param()], true)
            .await?;

        for risk in risks {
            if risk.position_amt.is_zero() {
                continue;
            }
            let side = if risk.position_amt > Decimal::ZERO {
                Side::Long
            } else {
                Side::Short
            };
            return Ok(Some(PositionSnapshot {
                side,
                quantity: risk.position_amt.abs(),
                entry_price: risk.entry_price,
                mark_price: risk.mark_price,
                leverage: parse_leverage(&risk.leverage)?,
                unrealized_pnl: risk.un_realized_profit,
            }));
        }
        Ok(None)
    }

    async fn submit_market(&self, order: MarketOrder) -> GatewayResult<OrderAck> {
        let mut params = vec![
            self.symbol_param(),
            ("side", order.side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", round_quantity(order.quantity).to_string()),
            ("newClientOrderId", order.client_order_id),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let resp: OrderResponse = self
            .request(Method::POST, "/fapi/v1/order", params, true)
            .await?;
        info!(order_id = resp.order_id, "Market order placed");
        Ok(resp.into())
    }
}

impl ExchangeGateway for BinanceClient {
    fn set_leverage(&self, leverage: u32) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            let _: serde_json::Value = self
                .request(
                    Method::POST,
                    "/fapi/v1/leverage",
                    vec![self.symbol_param(), ("leverage", leverage.to_string())],
                    true,
                )
                .await?;
            info!(leverage = leverage, "Leverage set");
            Ok(())
        })
    }

    fn mark_price(&self) -> BoxFuture<'_, GatewayResult<Decimal>> {
        Box::pin(async move {
            let index: PremiumIndex = self
                .request(Method::GET, "/fapi/v1/premiumIndex", vec![self.symbol_param()], false)
                .await?;
            Ok(index.mark_price)
        })
    }

    fn balance(&self) -> BoxFuture<'_, GatewayResult<Balance>> {
        Box::pin(async move {
            let account: AccountInfo = self
                .request(Method::GET, "/fapi/v2/account", vec![], true)
                .await?;
            Ok(Balance {
                total: account.total_wallet_balance,
                available: account.available_balance,
            })
        })
    }

    fn place_market_order(&self, order: MarketOrder) -> BoxFuture<'_, GatewayResult<OrderAck>> {
        Box::pin(self.submit_market(order))
    }

    fn place_stop_order(&self, order: StopOrder) -> BoxFuture<'_, GatewayResult<OrderAck>> {
        Box::pin(async move {
            let mut params = vec![
                self.symbol_param(),
                ("side", order.side.as_str().to_string()),
                ("quantity", round_quantity(order.quantity).to_string()),
                ("reduceOnly", "true".to_string()),
                ("workingType", "MARK_PRICE".to_string()),
                ("newClientOrderId", order.client_order_id),
            ];
            match order.trigger {
                StopTrigger::Price(price) => {
                    params.push(("type", "STOP_MARKET".to_string()));
                    params.push(("stopPrice", round_price(price).to_string()));
                }
                StopTrigger::Callback(rate) => {
                    params.push(("type", "TRAILING_STOP_MARKET".to_string()));
                    params.push(("callbackRate", rate.normalize().to_string()));
                }
            }

            let resp: OrderResponse = self
                .request(Method::POST, "/fapi/v1/order", params, true)
                .await?;
            info!(kind = %order.kind, order_id = resp.order_id, "Stop order placed");
            Ok(resp.into())
        })
    }

    fn position(&self) -> BoxFuture<'_, GatewayResult<Option<PositionSnapshot>>> {
        Box::pin(self.fetch_position())
    }

    fn open_orders(&self) -> BoxFuture<'_, GatewayResult<Vec<OpenOrder>>> {
        Box::pin(async move {
            let orders: Vec<RestingOrder> = self
                .request(Method::GET, "/fapi/v1/openOrders", vec![self.symbol_param()], true)
                .await?;
            Ok(orders.into_iter().map(OpenOrder::from).collect())
        })
    }

    fn cancel_all_orders(&self) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            let _: serde_json::Value = self
                .request(
                    Method::DELETE,
                    "/fapi/v1/allOpenOrders",
                    vec![self.symbol_param()],
                    true,
                )
                .await?;
            info!(symbol = %self.config.symbol, "Cancelled all open orders");
            Ok(())
        })
    }

    fn close_position(&self, client_order_id: String) -> BoxFuture<'_, GatewayResult<Option<OrderAck>>> {
        Box::pin(async move {
            let Some(position) = self.fetch_position().await? else {
                info!("No open position to close");
                return Ok(None);
            };
            let ack = self
                .submit_market(MarketOrder {
                    client_order_id,
                    side: OrderSide::exit(position.side),
                    quantity: position.quantity,
                    reduce_only: true,
                })
                .await?;
            info!(side = %position.side, qty = %position.quantity, "Position closed");
            Ok(Some(ack))
        })
    }
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_leverage(raw: &str) -> GatewayResult<u32> {
    raw.parse()
        .map_err(|_| GatewayError::Other(format!("unparseable leverage {:?}", raw)))
}

/// Map an unsuccessful response onto the gateway error taxonomy.
fn classify(status: StatusCode, body: &str) -> GatewayError {
    let api = serde_json::from_str::<ApiError>(body).ok();
    let code = api.as_ref().map(|e| e.code);
    let message = api.map(|e| e.msg).unwrap_or_else(|| body.to_string());

    match (status, code) {
        (_, Some(-4116)) | (_, Some(-4015)) => GatewayError::Duplicate {
            client_order_id: message,
        },
        (StatusCode::TOO_MANY_REQUESTS, _) | (_, Some(-1003)) => GatewayError::RateLimited,
        (s, _) if s.as_u16() == 418 => GatewayError::RateLimited,
        (_, Some(-1021)) => GatewayError::Transient(message),
        (StatusCode::UNAUTHORIZED, _) | (StatusCode::FORBIDDEN, _) => GatewayError::Auth(message),
        (_, Some(-2014)) | (_, Some(-2015)) | (_, Some(-1022)) => GatewayError::Auth(message),
        (s, _) if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            GatewayError::Transient(format!("{} - {}", s, message))
        }
        (_, code) => GatewayError::Rejected {
            code: code.unwrap_or(status.as_u16() as i64),
            message,
        },
    }
}

/// Truncate to the quantity step.
pub fn round_quantity(quantity: Decimal) -> Decimal {
    quantity.round_dp_with_strategy(QUANTITY_DP, RoundingStrategy::ToZero)
}

/// Round to the price tick.
pub fn round_price(price: Decimal) -> Decimal {
    price.round_dp_with_strategy(PRICE_DP, RoundingStrategy::MidpointAwayFromZero)
}
