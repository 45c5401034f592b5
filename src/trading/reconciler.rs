//! Reconciler: brings Position State in line with the exchange.
//!
//! The exchange is authoritative. A pass compares the local slot with
//! the exchange position and resting orders, then:
//!
//! - local live, exchange flat: the stops fired or someone closed the
//!   position by hand; mark it closed and cancel the orphaned stop.
//! - local idle, exchange has a position with both stops: adopt it.
//! - exchange has a position without both stops: close it now. For a
//!   tracked position this means its own stop ids must still be resting.
//! - local CLOSING, exchange still has a position: retry the close.
//!
//! A pass never runs while an open is in flight.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::api::{new_client_order_id, DynGateway, OrderSide, PositionSnapshot, StopKind};
use crate::error::{StateError, TradeError};
use crate::models::{CloseSummary, Position, PositionStatus, RecordAction, TransitionRecord};
use crate::notify::NotificationKind;

use super::sinks::Sinks;
use super::state::{PositionEvent, PositionState};

/// Event id used in records written by reconciliation passes.
pub const RECONCILE_EVENT: &str = "reconcile";

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Operator asked for it
    Operator,
    /// Protection could not be established after the entry filled
    Emergency,
    /// Found on the exchange without both stops
    Unprotected,
    /// Opposite-side signal under the close-on-opposite policy
    OppositeSignal,
    /// Earlier close did not complete
    Retry,
}

impl CloseReason {
    fn is_emergency(self) -> bool {
        matches!(self, CloseReason::Emergency | CloseReason::Unprotected)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Operator => "operator request",
            CloseReason::Emergency => "emergency, stops not placed",
            CloseReason::Unprotected => "unprotected exchange position",
            CloseReason::OppositeSignal => "opposite signal",
            CloseReason::Retry => "close retry",
        };
        write!(f, "{}", s)
    }
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    InSync,
    /// An open was in flight; nothing checked
    SkippedOpening,
    /// Local state overwritten with exchange truth
    Corrected,
    Adopted,
    /// Unprotected exchange position closed
    ForcedClose,
    CloseRetried,
    /// Local state changed during the pass; next pass will look again
    Raced,
}

pub struct Reconciler {
    gateway: DynGateway,
    state: Arc<PositionState>,
    sinks: Sinks,
}

impl Reconciler {
    pub fn new(gateway: DynGateway, state: Arc<PositionState>, sinks: Sinks) -> Self {
        Self {
            gateway,
            state,
            sinks,
        }
    }

    /// Run one reconciliation pass.
    pub async fn run_pass(&self) -> Result<PassOutcome, TradeError> {
        let (version, local) = self.state.snapshot().await;
        if local
            .as_ref()
            .is_some_and(|p| p.status == PositionStatus::Opening)
        {
            debug!("Open in progress, skipping reconciliation");
            return Ok(PassOutcome::SkippedOpening);
        }

        let remote = self.gateway.position().await?;
        match (local, remote) {
            (None, None) => Ok(PassOutcome::InSync),
            (Some(pos), None) => self.settle_flat(version, pos).await,
            (Some(pos), Some(_)) if pos.status == PositionStatus::Closing => {
                info!(position = %pos, "Exchange position still live, retrying close");
                self.force_close(CloseReason::Retry, RECONCILE_EVENT).await?;
                Ok(PassOutcome::CloseRetried)
            }
            (Some(pos), Some(snap)) if pos.side == snap.side => {
                if let Some(missing) = self.missing_stops(&pos).await? {
                    error!(
                        position = %pos,
                        missing,
                        "CRITICAL: tracked position lost its protection, closing"
                    );
                    self.sinks.notify(
                        NotificationKind::Critical,
                        format!(
                            "{} {} position is missing its {}. Closing it.",
                            pos.side, pos.quantity, missing
                        ),
                    );
                    self.force_close(CloseReason::Unprotected, RECONCILE_EVENT).await?;
                    return Ok(PassOutcome::ForcedClose);
                }
                if pos.quantity == snap.quantity {
                    return Ok(PassOutcome::InSync);
                }
                let mut truth = pos.clone();
                truth.quantity = snap.quantity;
                truth.entry_price = snap.entry_price;
                if let Err(e) = self.state.reconcile(version, Some(truth.clone())).await {
                    return raced(e);
                }
                self.sinks.notify(
                    NotificationKind::Drift,
                    format!(
                        "Quantity drift on {} position: local {}, exchange {}",
                        pos.side, pos.quantity, snap.quantity
                    ),
                );
                self.sinks.record(TransitionRecord::new(
                    RECONCILE_EVENT,
                    RecordAction::DriftCorrected,
                    Some(truth),
                ));
                Ok(PassOutcome::Corrected)
            }
            (_, Some(snap)) => self.adopt_or_close(version, snap).await,
        }
    }

    /// Exchange is flat but we thought we held a position.
    async fn settle_flat(&self, version: u64, pos: Position) -> Result<PassOutcome, TradeError> {
        // whichever stop did not fire is still resting
        if let Err(e) = self.gateway.cancel_all_orders().await {
            warn!(error = %e, "Failed to cancel orphaned orders");
        }
        if let Err(e) = self.state.reconcile(version, None).await {
            return raced(e);
        }

        let mut closed = pos.clone();
        closed.status = PositionStatus::Closed;
        // fill price unknown here, settle at mark
        if pos.status == PositionStatus::Closing {
            info!(position = %pos, "Close confirmed by exchange");
            let summary = self.settle(&closed, None, "close confirmed by exchange").await;
            self.sinks.notify(
                NotificationKind::Close,
                close_message(&closed, summary.as_ref()),
            );
            self.sinks.record(
                TransitionRecord::new(RECONCILE_EVENT, RecordAction::Close, Some(closed))
                    .with_close(summary),
            );
        } else {
            info!(position = %pos, "Position closed on exchange");
            let summary = self
                .settle(&closed, None, "stop triggered or manual close")
                .await;
            self.sinks.notify(
                NotificationKind::Drift,
                format!(
                    "{} {} position closed on exchange (stop triggered or manual close){}",
                    pos.side,
                    pos.quantity,
                    summary
                        .as_ref()
                        .map(|c| format!(": {}", c))
                        .unwrap_or_default()
                ),
            );
            self.sinks.record(
                TransitionRecord::new(RECONCILE_EVENT, RecordAction::DriftCorrected, Some(closed))
                    .with_close(summary),
            );
        }
        Ok(PassOutcome::Corrected)
    }

    /// Exchange holds a position we do not track.
    async fn adopt_or_close(
        &self,
        version: u64,
        snap: PositionSnapshot,
    ) -> Result<PassOutcome, TradeError> {
        let orders = self.gateway.open_orders().await?;
        let exit = OrderSide::exit(snap.side);
        let find = |kind: StopKind| {
            orders
                .iter()
                .find(|o| o.stop_kind == Some(kind) && o.side == exit)
        };

        match (find(StopKind::Fixed), find(StopKind::Trailing)) {
            (Some(fixed), Some(trailing)) => {
                let position = Position {
                    side: snap.side,
                    entry_price: snap.entry_price,
                    quantity: snap.quantity,
                    leverage: snap.leverage,
                    fixed_stop_order_id: Some(fixed.order_id.clone()),
                    trailing_stop_order_id: Some(trailing.order_id.clone()),
                    fixed_stop_price: fixed.stop_price,
                    trailing_callback_pct: trailing.callback_rate,
                    entry_order_id: None,
                    source_event_id: None,
                    opened_at: Utc::now(),
                    status: PositionStatus::Open,
                };
                if let Err(e) = self.state.reconcile(version, Some(position.clone())).await {
                    return raced(e);
                }
                info!(position = %position, "Adopted protected exchange position");
                self.sinks.notify(
                    NotificationKind::Drift,
                    format!("Adopted existing exchange position: {}", position),
                );
                self.sinks.record(TransitionRecord::new(
                    RECONCILE_EVENT,
                    RecordAction::Adopted,
                    Some(position),
                ));
                Ok(PassOutcome::Adopted)
            }
            (fixed, trailing) => {
                let missing = match (fixed, trailing) {
                    (None, None) => "fixed and trailing stops",
                    (None, Some(_)) => "fixed stop",
                    _ => "trailing stop",
                };
                error!(
                    side = %snap.side,
                    quantity = %snap.quantity,
                    missing,
                    "CRITICAL: unprotected exchange position, closing"
                );
                self.sinks.notify(
                    NotificationKind::Critical,
                    format!(
                        "Unprotected {} {} position found (missing {}). Closing it.",
                        snap.side, snap.quantity, missing
                    ),
                );
                self.force_close(CloseReason::Unprotected, RECONCILE_EVENT).await?;
                Ok(PassOutcome::ForcedClose)
            }
        }
    }

    /// Cancel resting orders and close whatever the exchange holds.
    ///
    /// The local position moves to CLOSING first. If the close order
    /// fails it stays there, and the next pass retries. Returns the
    /// final CLOSED record, or `None` if nothing was tracked locally.
    pub async fn force_close(
        &self,
        reason: CloseReason,
        event_id: &str,
    ) -> Result<Option<Position>, TradeError> {
        if let Some(pos) = self.state.current().await {
            if pos.status != PositionStatus::Closing {
                self.state
                    .transition(Some(pos.status), PositionEvent::BeginClosing)
                    .await?;
            }
        }

        if let Err(e) = self.gateway.cancel_all_orders().await {
            warn!(error = %e, %reason, "Failed to cancel resting orders before close");
        }

        let action = if reason.is_emergency() {
            RecordAction::EmergencyClose
        } else {
            RecordAction::Close
        };

        let ack = match self.gateway.close_position(new_client_order_id()).await {
            Ok(ack) => ack,
            Err(e) => {
                error!(error = %e, %reason, "Close failed, position left CLOSING for retry");
                self.sinks.notify(
                    NotificationKind::Critical,
                    format!("Close failed ({}): {}. Will retry.", reason, e),
                );
                self.sinks.record(
                    TransitionRecord::new(event_id, action, self.state.current().await)
                        .with_error(&e),
                );
                return Err(e.into());
            }
        };

        let closed = match self.state.current().await {
            Some(pos) if pos.status == PositionStatus::Closing => Some(
                self.state
                    .transition(Some(PositionStatus::Closing), PositionEvent::Closed)
                    .await?,
            ),
            _ => None,
        };

        let fill_price = ack.as_ref().and_then(|a| a.avg_price);
        let summary = match &closed {
            Some(pos) => self.settle(pos, fill_price, reason).await,
            None => None,
        };

        match (&closed, &ack) {
            (Some(pos), Some(ack)) => {
                info!(%reason, order_id = %ack.order_id, position = %pos, "Position closed");
                self.sinks
                    .notify(NotificationKind::Close, close_message(pos, summary.as_ref()));
            }
            (None, Some(ack)) => {
                let price = fill_price
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "market".to_string());
                info!(%reason, order_id = %ack.order_id, "Untracked position closed");
                self.sinks.notify(
                    NotificationKind::Close,
                    format!("Closed {} untracked @ {} ({})", ack.executed_qty, price, reason),
                );
            }
            (Some(pos), None) => {
                info!(%reason, position = %pos, "Exchange already flat");
                self.sinks.notify(
                    NotificationKind::Close,
                    format!(
                        "{}, exchange already flat",
                        close_message(pos, summary.as_ref())
                    ),
                );
            }
            (None, None) => {
                info!(%reason, "Nothing to close");
                self.sinks
                    .notify(NotificationKind::Info, format!("No position to close ({})", reason));
            }
        }

        self.sinks.record(
            TransitionRecord::new(event_id, action, closed.clone()).with_close(summary),
        );
        Ok(closed)
    }

    /// Which of the tracked stops are no longer resting on the exit side.
    async fn missing_stops(&self, pos: &Position) -> Result<Option<&'static str>, TradeError> {
        let orders = self.gateway.open_orders().await?;
        let exit = OrderSide::exit(pos.side);
        let resting = |id: &Option<String>| {
            id.as_ref()
                .is_some_and(|id| orders.iter().any(|o| &o.order_id == id && o.side == exit))
        };

        Ok(
            match (
                resting(&pos.fixed_stop_order_id),
                resting(&pos.trailing_stop_order_id),
            ) {
                (true, true) => None,
                (false, false) => Some("fixed and trailing stops"),
                (false, true) => Some("fixed stop"),
                (true, false) => Some("trailing stop"),
            },
        )
    }

    /// Realized result of `pos` at the fill price, or at mark when the
    /// exchange did not report one.
    async fn settle(
        &self,
        pos: &Position,
        fill_price: Option<Decimal>,
        reason: impl fmt::Display,
    ) -> Option<CloseSummary> {
        let exit_price = match fill_price {
            Some(price) => price,
            None => match self.gateway.mark_price().await {
                Ok(mark) => mark,
                Err(e) => {
                    warn!(error = %e, "No exit price for close summary");
                    return None;
                }
            },
        };
        let summary = CloseSummary::settle(pos, exit_price, reason);
        info!(
            exit_price = %summary.exit_price,
            pnl_usd = %summary.pnl_usd,
            pnl_pct = %summary.pnl_pct,
            "Realized PnL"
        );
        Some(summary)
    }
}

fn close_message(pos: &Position, summary: Option<&CloseSummary>) -> String {
    match summary {
        Some(close) => format!("Closed {} {}: {}", pos.side, pos.quantity, close),
        None => format!("Closed {} {}", pos.side, pos.quantity),
    }
}

fn raced(e: StateError) -> Result<PassOutcome, TradeError> {
    match e {
        StateError::Conflict { .. } => {
            debug!(error = %e, "State moved during reconciliation");
            Ok(PassOutcome::Raced)
        }
        other => Err(other.into()),
    }
}
