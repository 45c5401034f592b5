//! In-memory paper exchange.
//!
//! Simulates a single-symbol futures account: balance, mark price, one
//! position and resting protective orders. Used for dry runs, and with
//! scripted faults and a call log as the gateway fake in tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use futures::future::BoxFuture;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::models::Side;

use super::gateway::{
    Balance, ExchangeGateway, MarketOrder, OpenOrder, OrderAck, OrderSide, PositionSnapshot,
    StopKind, StopOrder, StopTrigger,
};

/// Gateway operation, for fault scripting and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    SetLeverage,
    MarkPrice,
    Balance,
    MarketOrder,
    StopOrder(StopKind),
    Position,
    OpenOrders,
    CancelAll,
    ClosePosition,
}

#[derive(Debug, Clone)]
struct Fault {
    error: GatewayError,
    /// Apply the operation's effect before failing (lost response)
    after_effect: bool,
}

#[derive(Debug, Default)]
struct Book {
    wallet: Decimal,
    mark_price: Decimal,
    leverage: u32,
    position: Option<PositionSnapshot>,
    orders: Vec<OpenOrder>,
    used_client_ids: HashSet<String>,
    next_order_id: u64,
    faults: HashMap<Op, VecDeque<Fault>>,
    delays: HashMap<Op, VecDeque<Duration>>,
    calls: Vec<Op>,
}

impl Book {
    fn next_id(&mut self) -> String {
        self.next_order_id += 1;
        self.next_order_id.to_string()
    }

    fn used_margin(&self) -> Decimal {
        match &self.position {
            Some(p) if p.leverage > 0 => p.quantity * p.entry_price / Decimal::from(p.leverage),
            _ => Decimal::ZERO,
        }
    }

    fn claim_client_id(&mut self, client_order_id: &str) -> GatewayResult<()> {
        if !self.used_client_ids.insert(client_order_id.to_string()) {
            return Err(GatewayError::Duplicate {
                client_order_id: client_order_id.to_string(),
            });
        }
        Ok(())
    }

    fn fill_market(&mut self, order: &MarketOrder) -> GatewayResult<OrderAck> {
        self.claim_client_id(&order.client_order_id)?;
        let price = self.mark_price;

        if order.reduce_only {
            let Some(pos) = self.position.as_mut() else {
                return Err(rejected(-2022, "ReduceOnly Order is rejected."));
            };
            if order.side != OrderSide::exit(pos.side) {
                return Err(rejected(-2022, "ReduceOnly Order is rejected."));
            }
            let filled = order.quantity.min(pos.quantity);
            pos.quantity -= filled;
            let realized = match pos.side {
                Side::Long => (price - pos.entry_price) * filled,
                Side::Short => (pos.entry_price - price) * filled,
            };
            self.wallet += realized;
            if pos.quantity.is_zero() {
                self.position = None;
            }
            return Ok(self.ack(order.client_order_id.clone(), price, filled));
        }

        let side = match order.side {
            OrderSide::Buy => Side::Long,
            OrderSide::Sell => Side::Short,
        };
        if self.position.as_ref().is_some_and(|p| p.side != side) {
            return Err(rejected(-2022, "opposite position open"));
        }
        let leverage = self.leverage.max(1);
        let margin = order.quantity * price / Decimal::from(leverage);
        if margin > self.wallet - self.used_margin() {
            return Err(rejected(-2019, "Margin is insufficient."));
        }

        match self.position.as_mut() {
            Some(pos) => {
                let total = pos.quantity + order.quantity;
                pos.entry_price = (pos.entry_price * pos.quantity + price * order.quantity) / total;
                pos.quantity = total;
            }
            None => {
                self.position = Some(PositionSnapshot {
                    side,
                    quantity: order.quantity,
                    entry_price: price,
                    mark_price: price,
                    leverage,
                    unrealized_pnl: Decimal::ZERO,
                });
            }
        }
        Ok(self.ack(order.client_order_id.clone(), price, order.quantity))
    }

    fn rest_stop(&mut self, order: &StopOrder) -> GatewayResult<OrderAck> {
        self.claim_client_id(&order.client_order_id)?;
        let Some(pos) = self.position.as_ref() else {
            return Err(rejected(-2022, "ReduceOnly Order is rejected."));
        };
        if order.side != OrderSide::exit(pos.side) {
            return Err(rejected(-2022, "ReduceOnly Order is rejected."));
        }

        let (stop_price, callback_rate) = match order.trigger {
            StopTrigger::Price(price) => {
                let immediate = match pos.side {
                    Side::Long => price >= self.mark_price,
                    Side::Short => price <= self.mark_price,
                };
                if immediate {
                    return Err(rejected(-2021, "Order would immediately trigger."));
                }
                (Some(price), None)
            }
            StopTrigger::Callback(rate) => (None, Some(rate)),
        };

        let order_id = self.next_id();
        self.orders.push(OpenOrder {
            order_id: order_id.clone(),
            client_order_id: order.client_order_id.clone(),
            stop_kind: Some(order.kind),
            side: order.side,
            stop_price,
            callback_rate,
        });
        Ok(OrderAck {
            order_id,
            client_order_id: order.client_order_id.clone(),
            avg_price: None,
            executed_qty: Decimal::ZERO,
        })
    }

    fn ack(&mut self, client_order_id: String, price: Decimal, qty: Decimal) -> OrderAck {
        OrderAck {
            order_id: self.next_id(),
            client_order_id,
            avg_price: Some(price),
            executed_qty: qty,
        }
    }
}

fn rejected(code: i64, message: &str) -> GatewayError {
    GatewayError::Rejected {
        code,
        message: message.to_string(),
    }
}

/// Simulated exchange account.
pub struct PaperExchange {
    book: Mutex<Book>,
}

impl PaperExchange {
    /// Create a flat account with the given wallet balance and mark price.
    pub fn new(balance: Decimal, mark_price: Decimal) -> Self {
        Self {
            book: Mutex::new(Book {
                wallet: balance,
                mark_price,
                leverage: 1,
                ..Default::default()
            }),
        }
    }

    #[cfg(test)]
    pub async fn set_mark_price(&self, price: Decimal) {
        self.book.lock().await.mark_price = price;
    }

    /// Fail the next `times` calls of `op` without side effects.
    #[cfg(test)]
    pub async fn fail_next(&self, op: Op, error: GatewayError, times: usize) {
        self.push_fault(op, error, false, times).await;
    }

    /// Apply the next `times` calls of `op`, then report `error` anyway,
    /// as when a response is lost after the exchange accepted the request.
    #[cfg(test)]
    pub async fn fail_after_next(&self, op: Op, error: GatewayError, times: usize) {
        self.push_fault(op, error, true, times).await;
    }

    #[cfg(test)]
    async fn push_fault(&self, op: Op, error: GatewayError, after_effect: bool, times: usize) {
        let mut book = self.book.lock().await;
        let queue = book.faults.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(Fault {
                error: error.clone(),
                after_effect,
            });
        }
    }

    /// Delay the next `times` calls of `op`.
    #[cfg(test)]
    pub async fn delay_next(&self, op: Op, delay: Duration, times: usize) {
        let mut book = self.book.lock().await;
        let queue = book.delays.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(delay);
        }
    }

    /// Put a position on the book directly, as if opened elsewhere.
    #[cfg(test)]
    pub async fn seed_position(&self, position: PositionSnapshot) {
        let mut book = self.book.lock().await;
        book.leverage = position.leverage;
        book.position = Some(position);
    }

    /// Rest a protective order directly.
    #[cfg(test)]
    pub async fn seed_order(&self, kind: StopKind, side: OrderSide) -> String {
        let mut book = self.book.lock().await;
        let order_id = book.next_id();
        book.orders.push(OpenOrder {
            order_id: order_id.clone(),
            client_order_id: format!("seed-{}", order_id),
            stop_kind: Some(kind),
            side,
            stop_price: None,
            callback_rate: None,
        });
        order_id
    }

    /// Drop the position as if a stop had fired.
    #[cfg(test)]
    pub async fn trigger_stop(&self) {
        let mut book = self.book.lock().await;
        book.position = None;
        if let Some(idx) = book.orders.iter().position(|o| o.stop_kind.is_some()) {
            book.orders.remove(idx);
        }
    }

    #[cfg(test)]
    pub async fn calls(&self) -> Vec<Op> {
        self.book.lock().await.calls.clone()
    }

    #[cfg(test)]
    pub async fn call_count(&self, op: Op) -> usize {
        self.book.lock().await.calls.iter().filter(|c| **c == op).count()
    }

    #[cfg(test)]
    pub async fn clear_calls(&self) {
        self.book.lock().await.calls.clear();
    }

    #[cfg(test)]
    pub async fn resting_orders(&self) -> Vec<OpenOrder> {
        self.book.lock().await.orders.clone()
    }

    /// Record the call and pop any scripted delay and fault.
    async fn enter(&self, op: Op) -> Option<Fault> {
        let delay = {
            let mut book = self.book.lock().await;
            book.calls.push(op);
            book.delays.get_mut(&op).and_then(|q| q.pop_front())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut book = self.book.lock().await;
        book.faults.get_mut(&op).and_then(|q| q.pop_front())
    }

    async fn run<T>(&self, op: Op, effect: impl FnOnce(&mut Book) -> GatewayResult<T>) -> GatewayResult<T> {
        let fault = self.enter(op).await;
        if let Some(Fault { error, after_effect: false }) = &fault {
            debug!(?op, %error, "Paper exchange injected fault");
            return Err(error.clone());
        }

        let result = {
            let mut book = self.book.lock().await;
            effect(&mut book)
        };

        match fault {
            Some(Fault { error, .. }) => {
                debug!(?op, %error, "Paper exchange dropped response");
                Err(error)
            }
            None => result,
        }
    }
}

impl ExchangeGateway for PaperExchange {
    fn set_leverage(&self, leverage: u32) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(self.run(Op::SetLeverage, move |book| {
            if !(1..=125).contains(&leverage) {
                return Err(rejected(-4028, "Leverage is not valid"));
            }
            book.leverage = leverage;
            Ok(())
        }))
    }

    fn mark_price(&self) -> BoxFuture<'_, GatewayResult<Decimal>> {
        Box::pin(self.run(Op::MarkPrice, |book| Ok(book.mark_price)))
    }

    fn balance(&self) -> BoxFuture<'_, GatewayResult<Balance>> {
        Box::pin(self.run(Op::Balance, |book| {
            let used = book.used_margin();
            Ok(Balance {
                total: book.wallet,
                available: (book.wallet - used).max(Decimal::ZERO),
            })
        }))
    }

    fn place_market_order(&self, order: MarketOrder) -> BoxFuture<'_, GatewayResult<OrderAck>> {
        Box::pin(self.run(Op::MarketOrder, move |book| book.fill_market(&order)))
    }

    fn place_stop_order(&self, order: StopOrder) -> BoxFuture<'_, GatewayResult<OrderAck>> {
        Box::pin(self.run(Op::StopOrder(order.kind), move |book| book.rest_stop(&order)))
    }

    fn position(&self) -> BoxFuture<'_, GatewayResult<Option<PositionSnapshot>>> {
        Box::pin(self.run(Op::Position, |book| {
            let mark = book.mark_price;
            Ok(book.position.clone().map(|mut p| {
                p.mark_price = mark;
                p.unrealized_pnl = match p.side {
                    Side::Long => (mark - p.entry_price) * p.quantity,
                    Side::Short => (p.entry_price - mark) * p.quantity,
                };
                p
            }))
        }))
    }

    fn open_orders(&self) -> BoxFuture<'_, GatewayResult<Vec<OpenOrder>>> {
        Box::pin(self.run(Op::OpenOrders, |book| Ok(book.orders.clone())))
    }

    fn cancel_all_orders(&self) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(self.run(Op::CancelAll, |book| {
            book.orders.clear();
            Ok(())
        }))
    }

    fn close_position(&self, client_order_id: String) -> BoxFuture<'_, GatewayResult<Option<OrderAck>>> {
        Box::pin(self.run(Op::ClosePosition, move |book| {
            let Some(pos) = book.position.as_ref() else {
                return Ok(None);
            };
            let order = MarketOrder {
                client_order_id,
                side: OrderSide::exit(pos.side),
                quantity: pos.quantity,
                reduce_only: true,
            };
            book.fill_market(&order).map(Some)
        }))
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn market(id: &str, side: OrderSide, qty: Decimal, reduce_only: bool) -> MarketOrder {
        MarketOrder {
            client_order_id: id.to_string(),
            side,
            quantity: qty,
            reduce_only,
        }
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let paper = PaperExchange::new(dec!(1000), dec!(50000));
        paper.set_leverage(10).await.unwrap();

        let ack = paper
            .place_market_order(market("a", OrderSide::Buy, dec!(0.2), false))
            .await
            .unwrap();
        assert_eq!(ack.avg_price, Some(dec!(50000)));

        let balance = paper.balance().await.unwrap();
        assert_eq!(balance.available, dec!(0));

        paper.set_mark_price(dec!(51000)).await;
        let closed = paper.close_position("b".into()).await.unwrap();
        assert!(closed.is_some());
        assert!(paper.position().await.unwrap().is_none());
        assert_eq!(paper.balance().await.unwrap().total, dec!(1200));
    }

    #[tokio::test]
    async fn test_margin_check() {
        let paper = PaperExchange::new(dec!(100), dec!(50000));
        paper.set_leverage(3).await.unwrap();

        let err = paper
            .place_market_order(market("a", OrderSide::Sell, dec!(1), false))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { code: -2019, .. }));
    }

    #[tokio::test]
    async fn test_duplicate_client_id() {
        let paper = PaperExchange::new(dec!(1000), dec!(50000));
        paper.set_leverage(10).await.unwrap();

        paper
            .place_market_order(market("same", OrderSide::Buy, dec!(0.01), false))
            .await
            .unwrap();
        let err = paper
            .place_market_order(market("same", OrderSide::Buy, dec!(0.01), false))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_stop_that_would_trigger_is_rejected() {
        let paper = PaperExchange::new(dec!(1000), dec!(50000));
        paper.set_leverage(10).await.unwrap();
        paper
            .place_market_order(market("a", OrderSide::Buy, dec!(0.1), false))
            .await
            .unwrap();

        let err = paper
            .place_stop_order(StopOrder {
                client_order_id: "s".into(),
                kind: StopKind::Fixed,
                side: OrderSide::Sell,
                quantity: dec!(0.1),
                trigger: StopTrigger::Price(dec!(50100)),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { code: -2021, .. }));
    }

    #[tokio::test]
    async fn test_lost_response_still_applies_effect() {
        let paper = PaperExchange::new(dec!(1000), dec!(50000));
        paper.set_leverage(10).await.unwrap();
        paper
            .fail_after_next(Op::MarketOrder, GatewayError::Timeout, 1)
            .await;

        let err = paper
            .place_market_order(market("a", OrderSide::Buy, dec!(0.1), false))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Timeout);
        assert!(paper.position().await.unwrap().is_some());
    }
}
