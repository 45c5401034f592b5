//! Trading engine: turns sentiment events into protected positions.
//!
//! Opening follows a fixed protocol. Claim the slot, size from the free
//! balance, set leverage, send the market entry, then place the fixed
//! stop and the trailing stop. The position only becomes OPEN once both
//! stops are registered. Any failure before the entry fills aborts back
//! to idle. Any failure after it closes the position at market.
//!
//! All inputs (events, operator commands, reconciliation ticks) are
//! handled one at a time by [`TradingEngine::run`].

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::api::{
    new_client_order_id, retry_bounded, DynGateway, MarketOrder, OrderSide, StopKind, StopOrder,
    StopTrigger,
};
use crate::error::{GatewayError, GatewayResult, TradeError};
use crate::models::{
    Position, PositionStatus, RecordAction, SentimentEvent, Side, TransitionRecord,
};
use crate::notify::NotificationKind;

use super::config::{SignalPolicy, TradingConfig};
use super::dedupe::RecentIds;
use super::intent::{SkipReason, TradeIntent};
use super::reconciler::{CloseReason, Reconciler};
use super::risk::{RiskCalculator, RiskProfile};
use super::sinks::Sinks;
use super::state::{PositionEvent, PositionState};

/// Event id used in records written for operator commands.
pub const OPERATOR_EVENT: &str = "operator";

/// Operator requests accepted at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperatorCommand {
    Status,
    CloseNow,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Status(Option<Position>),
    /// Final CLOSED record, `None` if nothing was tracked
    Closed(Option<Position>),
    Failed(String),
}

/// One unit of work for the engine loop.
#[derive(Debug)]
pub enum EngineInput {
    Sentiment(SentimentEvent),
    Command {
        command: OperatorCommand,
        reply: Option<oneshot::Sender<CommandReply>>,
    },
    ReconcileTick,
}

/// Result of handling one sentiment event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Skipped(SkipReason),
    Opened(Position),
    /// Nothing was filled; back to idle
    Aborted(String),
    /// Filled but unprotected; closed at market
    EmergencyClosed(String),
    /// Filled, unprotected, and the close failed too. Left CLOSING for
    /// the reconciler.
    Exposed(String),
}

struct Fill {
    order_id: String,
    price: Decimal,
    quantity: Decimal,
}

enum OpenFailure {
    /// No capital committed
    Abort(TradeError),
    /// Exposure may exist without protection
    Exposed(TradeError),
}

impl OpenFailure {
    fn abort<E: Into<TradeError>>(e: E) -> Self {
        OpenFailure::Abort(e.into())
    }

    fn exposed<E: Into<TradeError>>(e: E) -> Self {
        OpenFailure::Exposed(e.into())
    }
}

pub struct TradingEngine {
    gateway: DynGateway,
    state: Arc<PositionState>,
    reconciler: Reconciler,
    calculator: RiskCalculator,
    config: TradingConfig,
    recent: RecentIds,
    sinks: Sinks,
}

impl TradingEngine {
    pub fn new(
        gateway: DynGateway,
        state: Arc<PositionState>,
        config: TradingConfig,
        sinks: Sinks,
    ) -> Self {
        let reconciler = Reconciler::new(gateway.clone(), state.clone(), sinks.clone());
        Self {
            gateway,
            state,
            reconciler,
            calculator: RiskCalculator::new(config.max_account_loss_pct),
            recent: RecentIds::new(config.dedupe_capacity),
            config,
            sinks,
        }
    }

    /// Preload post ids that were already handled before a restart.
    pub fn seed_processed<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.recent.seed(ids);
        debug!(count = self.recent.len(), "Seeded processed event ids");
    }

    #[cfg(test)]
    pub fn state(&self) -> &Arc<PositionState> {
        &self.state
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Consume inputs until every sender is gone.
    pub async fn run(mut self, mut inputs: mpsc::Receiver<EngineInput>) {
        info!(symbol = %self.config.symbol, policy = %self.config.signal_policy, "Trading engine started");
        while let Some(input) = inputs.recv().await {
            self.handle_input(input).await;
        }
        info!("Input channel closed, trading engine stopped");
    }

    pub async fn handle_input(&mut self, input: EngineInput) {
        match input {
            EngineInput::Sentiment(event) => {
                let outcome = self.handle_event(event).await;
                debug!(?outcome, "Event handled");
            }
            EngineInput::Command { command, reply } => {
                let result = self.handle_command(command).await;
                info!(?command, ?result, "Operator command handled");
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            EngineInput::ReconcileTick => match self.reconciler.run_pass().await {
                Ok(outcome) => debug!(?outcome, "Reconciliation pass complete"),
                Err(e) => warn!(error = %e, "Reconciliation pass failed"),
            },
        }
    }

    pub async fn handle_command(&mut self, command: OperatorCommand) -> CommandReply {
        match command {
            OperatorCommand::Status => CommandReply::Status(self.state.current().await),
            OperatorCommand::CloseNow => {
                match self
                    .reconciler
                    .force_close(CloseReason::Operator, OPERATOR_EVENT)
                    .await
                {
                    Ok(closed) => CommandReply::Closed(closed),
                    Err(e) => CommandReply::Failed(e.to_string()),
                }
            }
        }
    }

    /// Evaluate one sentiment event and act on it.
    pub async fn handle_event(&mut self, event: SentimentEvent) -> EventOutcome {
        let event_id = event.source_post_id.clone();
        if !self.recent.insert(&event_id) {
            debug!(event_id = %event_id, "Duplicate event");
            return self.skip(&event_id, SkipReason::Duplicate);
        }
        info!(event_id = %event_id, score = %event.score, "Sentiment event received");

        let current = self.state.current().await;
        let mut intent = TradeIntent::evaluate(
            event.score,
            current.as_ref(),
            self.config.signal_policy,
            &self.calculator,
        );

        if intent == TradeIntent::CloseThenReevaluate {
            info!(event_id = %event_id, "Opposite signal, closing current position");
            if let Err(e) = self
                .reconciler
                .force_close(CloseReason::OppositeSignal, &event_id)
                .await
            {
                warn!(event_id = %event_id, error = %e, "Close on opposite signal failed");
                return self.skip(&event_id, SkipReason::PositionLive(PositionStatus::Closing));
            }
            let current = self.state.current().await;
            intent = TradeIntent::evaluate(
                event.score,
                current.as_ref(),
                SignalPolicy::SkipWhileOpen,
                &self.calculator,
            );
        }

        match intent {
            TradeIntent::Open { side, profile } => self.open(&event_id, side, profile).await,
            TradeIntent::Skip(reason) => self.skip(&event_id, reason),
            TradeIntent::CloseThenReevaluate => {
                self.skip(&event_id, SkipReason::PositionLive(PositionStatus::Open))
            }
        }
    }

    fn skip(&self, event_id: &str, reason: SkipReason) -> EventOutcome {
        info!(event_id, %reason, "SKIP");
        self.sinks
            .record(TransitionRecord::new(event_id, RecordAction::Skip, None));
        EventOutcome::Skipped(reason)
    }

    async fn open(&mut self, event_id: &str, side: Side, profile: RiskProfile) -> EventOutcome {
        let begin = PositionEvent::BeginOpening {
            side,
            leverage: profile.leverage,
            source_event_id: Some(event_id.to_string()),
        };
        if let Err(e) = self.state.transition(None, begin).await {
            debug!(event_id, error = %e, "Position slot already taken");
            return self.skip(event_id, SkipReason::Raced);
        }
        info!(
            event_id,
            %side,
            leverage = profile.leverage,
            callback_pct = %profile.trailing_callback_pct,
            "Opening position"
        );

        match self.open_sequence(side, &profile).await {
            Ok(position) => {
                info!(event_id, position = %position, "Position open and protected");
                self.sinks.notify(
                    NotificationKind::Open,
                    format!(
                        "{} {} {}x\nQty: {} @ {}\nFixed stop: {} ({}% of margin)\nTrailing stop: {}% callback\nPost: {}",
                        position.side,
                        self.config.symbol,
                        position.leverage,
                        position.quantity,
                        position.entry_price,
                        position
                            .fixed_stop_price
                            .map(|p| p.to_string())
                            .unwrap_or_default(),
                        profile.fixed_stop_loss_pct,
                        profile.trailing_callback_pct,
                        event_id,
                    ),
                );
                let action = match side {
                    Side::Long => RecordAction::OpenLong,
                    Side::Short => RecordAction::OpenShort,
                };
                self.sinks.record(TransitionRecord::new(
                    event_id,
                    action,
                    Some(position.clone()),
                ));
                EventOutcome::Opened(position)
            }
            Err(OpenFailure::Abort(cause)) => self.abort(event_id, cause).await,
            Err(OpenFailure::Exposed(cause)) => self.emergency_close(event_id, cause).await,
        }
    }

    async fn open_sequence(
        &self,
        side: Side,
        profile: &RiskProfile,
    ) -> Result<Position, OpenFailure> {
        let opening = Some(PositionStatus::Opening);

        let mark = self.gateway.mark_price().await.map_err(OpenFailure::abort)?;
        let balance = self.gateway.balance().await.map_err(OpenFailure::abort)?;
        let quantity = profile.quantity_for(balance.available, mark, self.config.quantity_dp);
        if quantity.is_zero() {
            return Err(OpenFailure::Abort(TradeError::InsufficientBalance));
        }
        self.gateway
            .set_leverage(profile.leverage)
            .await
            .map_err(OpenFailure::abort)?;

        let fill = self.submit_entry(side, quantity, mark).await?;
        info!(
            order_id = %fill.order_id,
            price = %fill.price,
            quantity = %fill.quantity,
            "Entry filled"
        );
        let quantity = fill.quantity;
        let entry_price = fill.price;
        self.state
            .transition(
                opening,
                PositionEvent::EntryFilled {
                    entry_price,
                    quantity,
                    order_id: fill.order_id,
                },
            )
            .await
            .map_err(OpenFailure::exposed)?;

        let stop_price = profile.fixed_stop_price(side, entry_price, self.config.price_dp);
        let fixed_id = self
            .place_stop(StopKind::Fixed, side, quantity, StopTrigger::Price(stop_price))
            .await
            .map_err(OpenFailure::exposed)?;
        self.state
            .transition(
                opening,
                PositionEvent::StopPlaced {
                    kind: StopKind::Fixed,
                    order_id: fixed_id,
                    stop_price: Some(stop_price),
                    callback_pct: None,
                },
            )
            .await
            .map_err(OpenFailure::exposed)?;

        let callback = profile.trailing_callback_pct;
        let trailing_id = self
            .place_stop(StopKind::Trailing, side, quantity, StopTrigger::Callback(callback))
            .await
            .map_err(OpenFailure::exposed)?;
        self.state
            .transition(
                opening,
                PositionEvent::StopPlaced {
                    kind: StopKind::Trailing,
                    order_id: trailing_id,
                    stop_price: None,
                    callback_pct: Some(callback),
                },
            )
            .await
            .map_err(OpenFailure::exposed)?;

        self.state
            .transition(opening, PositionEvent::Confirmed)
            .await
            .map_err(OpenFailure::exposed)
    }

    /// Send the market entry. When the outcome is unknown (lost
    /// response, duplicate id) the exchange position decides.
    async fn submit_entry(
        &self,
        side: Side,
        quantity: Decimal,
        mark: Decimal,
    ) -> Result<Fill, OpenFailure> {
        let order = MarketOrder {
            client_order_id: new_client_order_id(),
            side: OrderSide::entry(side),
            quantity,
            reduce_only: false,
        };
        let client_order_id = order.client_order_id.clone();

        let err = match self.gateway.place_market_order(order).await {
            Ok(ack) => {
                return Ok(Fill {
                    order_id: ack.order_id,
                    price: ack.avg_price.filter(|p| !p.is_zero()).unwrap_or(mark),
                    quantity: if ack.executed_qty.is_zero() {
                        quantity
                    } else {
                        ack.executed_qty
                    },
                })
            }
            Err(e @ (GatewayError::Rejected { .. } | GatewayError::Auth(_))) => {
                return Err(OpenFailure::abort(e))
            }
            Err(e) => e,
        };

        warn!(
            client_order_id = %client_order_id,
            error = %err,
            "Entry outcome unknown, checking exchange position"
        );
        match self.gateway.position().await {
            Ok(Some(snap)) if snap.side == side => {
                info!(quantity = %snap.quantity, "Entry confirmed by exchange position");
                Ok(Fill {
                    order_id: client_order_id,
                    price: snap.entry_price,
                    quantity: snap.quantity,
                })
            }
            Ok(Some(snap)) => Err(OpenFailure::Exposed(TradeError::CriticalExposure(format!(
                "unexpected {} {} position while confirming entry",
                snap.side, snap.quantity
            )))),
            Ok(None) => Err(OpenFailure::abort(err)),
            Err(confirm) => Err(OpenFailure::Exposed(TradeError::CriticalExposure(format!(
                "entry outcome unknown ({}); position check failed: {}",
                err, confirm
            )))),
        }
    }

    /// Place a protective stop, resubmitting with a fresh client id on
    /// failure up to the configured attempt count. Rejections and auth
    /// errors are final.
    async fn place_stop(
        &self,
        kind: StopKind,
        side: Side,
        quantity: Decimal,
        trigger: StopTrigger,
    ) -> GatewayResult<String> {
        retry_bounded(
            &self.config.stop_retry,
            "place_stop",
            |e: &GatewayError| {
                !matches!(e, GatewayError::Auth(_) | GatewayError::Rejected { .. })
            },
            || self.place_stop_once(kind, side, quantity, trigger),
        )
        .await
    }

    async fn place_stop_once(
        &self,
        kind: StopKind,
        side: Side,
        quantity: Decimal,
        trigger: StopTrigger,
    ) -> GatewayResult<String> {
        let order = StopOrder {
            client_order_id: new_client_order_id(),
            kind,
            side: OrderSide::exit(side),
            quantity,
            trigger,
        };
        let client_order_id = order.client_order_id.clone();

        match self.gateway.place_stop_order(order).await {
            Ok(ack) => {
                info!(%kind, order_id = %ack.order_id, "Stop placed");
                Ok(ack.order_id)
            }
            Err(e @ (GatewayError::Rejected { .. } | GatewayError::Auth(_))) => {
                warn!(%kind, error = %e, "Stop rejected");
                Err(e)
            }
            Err(e) => match self.find_resting(&client_order_id).await {
                // the response was lost but the order is on the book
                Some(order_id) => {
                    info!(%kind, %order_id, "Stop found resting after failed submission");
                    Ok(order_id)
                }
                None => Err(e),
            },
        }
    }

    async fn find_resting(&self, client_order_id: &str) -> Option<String> {
        match self.gateway.open_orders().await {
            Ok(orders) => orders
                .into_iter()
                .find(|o| o.client_order_id == client_order_id)
                .map(|o| o.order_id),
            Err(e) => {
                warn!(error = %e, "Could not list open orders");
                None
            }
        }
    }

    async fn abort(&self, event_id: &str, cause: TradeError) -> EventOutcome {
        warn!(event_id, error = %cause, "Open aborted, nothing filled");
        if let Err(e) = self
            .state
            .transition(Some(PositionStatus::Opening), PositionEvent::Aborted)
            .await
        {
            error!(event_id, error = %e, "Failed to release position slot after abort");
        }
        self.sinks.notify(
            NotificationKind::Info,
            format!("Open aborted for post {}: {}", event_id, cause),
        );
        self.sinks.record(
            TransitionRecord::new(event_id, RecordAction::Abort, None).with_error(&cause),
        );
        EventOutcome::Aborted(cause.to_string())
    }

    async fn emergency_close(&self, event_id: &str, cause: TradeError) -> EventOutcome {
        error!(event_id, error = %cause, "CRITICAL: position without protection, closing at market");
        self.sinks.notify(
            NotificationKind::Critical,
            format!(
                "Protection failed on {} after entry: {}. Emergency close issued.",
                self.config.symbol, cause
            ),
        );

        match self
            .reconciler
            .force_close(CloseReason::Emergency, event_id)
            .await
        {
            Ok(_) => EventOutcome::EmergencyClosed(cause.to_string()),
            Err(e) => {
                error!(event_id, error = %e, "CRITICAL: emergency close failed");
                EventOutcome::Exposed(format!("{}; close failed: {}", cause, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::api::paper::Op;
    use crate::api::{ExchangeGateway, PaperExchange, RetryPolicy};
    use crate::models::Score;
    use crate::trading::sinks::capture::{self, Captured};

    struct Harness {
        engine: TradingEngine,
        paper: Arc<PaperExchange>,
        captured: Captured,
    }

    fn config() -> TradingConfig {
        TradingConfig {
            stop_retry: RetryPolicy::fast(3),
            ..Default::default()
        }
    }

    fn harness_with(config: TradingConfig) -> Harness {
        let paper = Arc::new(PaperExchange::new(dec!(1000), dec!(60000)));
        let (sinks, captured) = capture::sinks();
        let engine = TradingEngine::new(
            paper.clone(),
            Arc::new(PositionState::new()),
            config,
            sinks,
        );
        Harness {
            engine,
            paper,
            captured,
        }
    }

    fn harness() -> Harness {
        harness_with(config())
    }

    fn event(id: &str, score: i64) -> SentimentEvent {
        SentimentEvent::new(id, Score::new(score).unwrap())
    }

    #[tokio::test]
    async fn test_bullish_score_opens_protected_long() {
        let mut h = harness();

        let outcome = h.engine.handle_event(event("p1", 8)).await;

        let EventOutcome::Opened(pos) = outcome else {
            panic!("expected open, got {:?}", outcome);
        };
        assert_eq!(pos.side, Side::Long);
        assert_eq!(pos.leverage, 15);
        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pos.quantity, dec!(0.25));
        assert_eq!(pos.entry_price, dec!(60000));
        // 1% of margin at 15x is a 1/15% move
        assert_eq!(pos.fixed_stop_price, Some(dec!(59960)));
        assert_eq!(pos.trailing_callback_pct, Some(dec!(1.0)));
        assert!(pos.is_protected());

        assert_eq!(h.paper.resting_orders().await.len(), 2);
        assert_eq!(h.engine.state().current().await, Some(pos));

        let notes = h.captured.drain_notifications();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, NotificationKind::Open);
        let records = h.captured.drain_records();
        assert_eq!(records[0].action, RecordAction::OpenLong);
    }

    #[tokio::test]
    async fn test_bearish_score_opens_short() {
        let mut h = harness();

        let outcome = h.engine.handle_event(event("p1", 0)).await;

        let EventOutcome::Opened(pos) = outcome else {
            panic!("expected open, got {:?}", outcome);
        };
        assert_eq!(pos.side, Side::Short);
        assert_eq!(pos.leverage, 50);
        assert_eq!(pos.trailing_callback_pct, Some(dec!(0.5)));
        assert!(pos.fixed_stop_price.unwrap() > dec!(60000));
    }

    #[tokio::test]
    async fn test_neutral_score_places_nothing() {
        let mut h = harness();

        let outcome = h.engine.handle_event(event("p1", 5)).await;

        assert_eq!(outcome, EventOutcome::Skipped(SkipReason::Neutral));
        assert!(h.paper.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_signal_while_open_is_skipped_without_gateway_calls() {
        let mut h = harness();
        h.engine.handle_event(event("p1", 8)).await;
        h.paper.clear_calls().await;

        let outcome = h.engine.handle_event(event("p2", 2)).await;

        assert_eq!(
            outcome,
            EventOutcome::Skipped(SkipReason::PositionLive(PositionStatus::Open))
        );
        assert!(h.paper.calls().await.is_empty());
        assert_eq!(h.engine.state().current().await.unwrap().side, Side::Long);
    }

    #[tokio::test]
    async fn test_replayed_event_is_skipped() {
        let mut h = harness();
        h.engine.handle_event(event("p1", 5)).await;

        let outcome = h.engine.handle_event(event("p1", 9)).await;

        assert_eq!(outcome, EventOutcome::Skipped(SkipReason::Duplicate));
        assert!(h.paper.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_seeded_ids_are_skipped() {
        let mut h = harness();
        h.engine.seed_processed(["old-post"]);

        let outcome = h.engine.handle_event(event("old-post", 9)).await;

        assert_eq!(outcome, EventOutcome::Skipped(SkipReason::Duplicate));
    }

    #[tokio::test]
    async fn test_trailing_stop_failure_triggers_emergency_close() {
        let mut h = harness();
        h.paper
            .fail_next(
                Op::StopOrder(StopKind::Trailing),
                GatewayError::Transient("503".into()),
                10,
            )
            .await;

        let outcome = h.engine.handle_event(event("p1", 8)).await;

        assert!(matches!(outcome, EventOutcome::EmergencyClosed(_)));
        assert_eq!(h.paper.call_count(Op::StopOrder(StopKind::Trailing)).await, 3);
        assert!(h.paper.position().await.unwrap().is_none());
        assert!(h.paper.resting_orders().await.is_empty());
        assert!(h.engine.state().current().await.is_none());

        let notes = h.captured.drain_notifications();
        assert!(notes.iter().any(|n| n.kind == NotificationKind::Critical));
        let records = h.captured.drain_records();
        assert_eq!(records.last().unwrap().action, RecordAction::EmergencyClose);
    }

    #[tokio::test]
    async fn test_rejected_stop_is_not_resubmitted() {
        let mut h = harness();
        h.paper
            .fail_next(
                Op::StopOrder(StopKind::Trailing),
                GatewayError::Rejected {
                    code: -2021,
                    message: "Order would immediately trigger.".into(),
                },
                10,
            )
            .await;

        let outcome = h.engine.handle_event(event("p1", 8)).await;

        assert!(matches!(outcome, EventOutcome::EmergencyClosed(_)));
        assert_eq!(h.paper.call_count(Op::StopOrder(StopKind::Trailing)).await, 1);
        assert!(h.paper.position().await.unwrap().is_none());

        let records = h.captured.drain_records();
        let last = records.last().unwrap();
        assert_eq!(last.action, RecordAction::EmergencyClose);
        let close = last.close.as_ref().unwrap();
        assert_eq!(close.exit_price, dec!(60000));
        assert!(close.pnl_usd.is_zero());
    }

    #[tokio::test]
    async fn test_auth_failure_before_entry_aborts() {
        let mut h = harness();
        h.paper
            .fail_next(Op::SetLeverage, GatewayError::Auth("-2015".into()), 1)
            .await;

        let outcome = h.engine.handle_event(event("p1", 9)).await;

        assert!(matches!(outcome, EventOutcome::Aborted(_)));
        assert!(h.engine.state().current().await.is_none());
        assert_eq!(h.paper.call_count(Op::MarketOrder).await, 0);
        let records = h.captured.drain_records();
        assert_eq!(records[0].action, RecordAction::Abort);
        assert!(records[0].error.is_some());
    }

    #[tokio::test]
    async fn test_empty_balance_aborts() {
        let paper = Arc::new(PaperExchange::new(dec!(0), dec!(60000)));
        let (sinks, _captured) = capture::sinks();
        let mut engine =
            TradingEngine::new(paper.clone(), Arc::new(PositionState::new()), config(), sinks);

        let outcome = engine.handle_event(event("p1", 9)).await;

        assert!(matches!(outcome, EventOutcome::Aborted(_)));
        assert_eq!(paper.call_count(Op::MarketOrder).await, 0);
    }

    #[tokio::test]
    async fn test_lost_entry_response_is_confirmed_from_position() {
        let mut h = harness();
        h.paper
            .fail_after_next(Op::MarketOrder, GatewayError::Timeout, 1)
            .await;

        let outcome = h.engine.handle_event(event("p1", 7)).await;

        let EventOutcome::Opened(pos) = outcome else {
            panic!("expected open, got {:?}", outcome);
        };
        assert!(pos.is_protected());
        assert_eq!(h.paper.call_count(Op::MarketOrder).await, 1);
    }

    #[tokio::test]
    async fn test_failed_entry_with_no_position_aborts() {
        let mut h = harness();
        h.paper
            .fail_next(Op::MarketOrder, GatewayError::Timeout, 1)
            .await;

        let outcome = h.engine.handle_event(event("p1", 7)).await;

        assert!(matches!(outcome, EventOutcome::Aborted(_)));
        assert!(h.engine.state().current().await.is_none());
    }

    #[tokio::test]
    async fn test_unconfirmable_entry_is_closed() {
        let mut h = harness();
        h.paper
            .fail_after_next(Op::MarketOrder, GatewayError::Timeout, 1)
            .await;
        h.paper
            .fail_next(Op::Position, GatewayError::Transient("502".into()), 1)
            .await;

        let outcome = h.engine.handle_event(event("p1", 7)).await;

        assert!(matches!(outcome, EventOutcome::EmergencyClosed(_)));
        assert!(h.paper.position().await.unwrap().is_none());
        assert!(h.engine.state().current().await.is_none());
    }

    #[tokio::test]
    async fn test_lost_stop_response_is_not_resubmitted() {
        let mut h = harness();
        h.paper
            .fail_after_next(Op::StopOrder(StopKind::Fixed), GatewayError::Timeout, 1)
            .await;

        let outcome = h.engine.handle_event(event("p1", 8)).await;

        assert!(matches!(outcome, EventOutcome::Opened(_)));
        assert_eq!(h.paper.call_count(Op::StopOrder(StopKind::Fixed)).await, 1);
        assert_eq!(h.paper.resting_orders().await.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_retry_recovers() {
        let mut h = harness();
        h.paper
            .fail_next(
                Op::StopOrder(StopKind::Fixed),
                GatewayError::Transient("503".into()),
                2,
            )
            .await;

        let outcome = h.engine.handle_event(event("p1", 8)).await;

        assert!(matches!(outcome, EventOutcome::Opened(_)));
        assert_eq!(h.paper.call_count(Op::StopOrder(StopKind::Fixed)).await, 3);
    }

    #[tokio::test]
    async fn test_concurrent_engines_open_one_position() {
        let paper = Arc::new(PaperExchange::new(dec!(1000), dec!(60000)));
        let state = Arc::new(PositionState::new());
        let (sinks_a, _ca) = capture::sinks();
        let (sinks_b, _cb) = capture::sinks();
        let mut a = TradingEngine::new(paper.clone(), state.clone(), config(), sinks_a);
        let mut b = TradingEngine::new(paper.clone(), state.clone(), config(), sinks_b);

        let (ra, rb) = tokio::join!(
            a.handle_event(event("p1", 9)),
            b.handle_event(event("p2", 1))
        );

        let opened = [&ra, &rb]
            .iter()
            .filter(|o| matches!(o, EventOutcome::Opened(_)))
            .count();
        assert_eq!(opened, 1, "{:?} / {:?}", ra, rb);
        assert_eq!(paper.call_count(Op::MarketOrder).await, 1);
        assert!(state.current().await.is_some());
    }

    #[tokio::test]
    async fn test_close_on_opposite_flips_position() {
        let mut h = harness_with(TradingConfig {
            signal_policy: SignalPolicy::CloseOnOpposite,
            ..config()
        });
        h.engine.handle_event(event("p1", 8)).await;

        let outcome = h.engine.handle_event(event("p2", 2)).await;

        let EventOutcome::Opened(pos) = outcome else {
            panic!("expected open, got {:?}", outcome);
        };
        assert_eq!(pos.side, Side::Short);
        assert_eq!(h.paper.position().await.unwrap().unwrap().side, Side::Short);
        assert_eq!(h.paper.resting_orders().await.len(), 2);
    }

    #[tokio::test]
    async fn test_close_now_command() {
        let mut h = harness();
        h.engine.handle_event(event("p1", 8)).await;

        let reply = h.engine.handle_command(OperatorCommand::CloseNow).await;

        let CommandReply::Closed(Some(pos)) = reply else {
            panic!("expected close, got {:?}", reply);
        };
        assert_eq!(pos.status, PositionStatus::Closed);
        assert!(h.paper.position().await.unwrap().is_none());
        assert!(h.paper.resting_orders().await.is_empty());
        assert_eq!(
            h.engine.handle_command(OperatorCommand::Status).await,
            CommandReply::Status(None)
        );
    }

    #[tokio::test]
    async fn test_run_loop_replies_to_commands() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(h.engine.run(rx));

        tx.send(EngineInput::Sentiment(event("p1", 3))).await.unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(EngineInput::Command {
            command: OperatorCommand::Status,
            reply: Some(reply_tx),
        })
        .await
        .unwrap();

        let CommandReply::Status(Some(pos)) = reply_rx.await.unwrap() else {
            panic!("expected a live position");
        };
        assert_eq!(pos.side, Side::Short);

        drop(tx);
        handle.await.unwrap();
    }
}
