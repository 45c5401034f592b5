//! Position State: the single source of truth for the bot's one position.
//!
//! Every mutation is a compare-and-set against the expected lifecycle
//! status, so two writers racing to open a position cannot both win.
//! The reconciler is the only writer allowed to overwrite the slot with
//! exchange truth, and even it must present the version it read.

use std::fmt;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::api::StopKind;
use crate::error::StateError;
use crate::models::{Position, PositionStatus, Side};

/// A lifecycle step applied through [`PositionState::transition`].
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    /// Claim the empty slot before any order is placed
    BeginOpening {
        side: Side,
        leverage: u32,
        source_event_id: Option<String>,
    },
    EntryFilled {
        entry_price: Decimal,
        quantity: Decimal,
        order_id: String,
    },
    StopPlaced {
        kind: StopKind,
        order_id: String,
        stop_price: Option<Decimal>,
        callback_pct: Option<Decimal>,
    },
    /// Both stops are registered; the position is protected
    Confirmed,
    BeginClosing,
    Closed,
    /// Give up an opening that never committed capital
    Aborted,
}

impl PositionEvent {
    fn name(&self) -> &'static str {
        match self {
            PositionEvent::BeginOpening { .. } => "BeginOpening",
            PositionEvent::EntryFilled { .. } => "EntryFilled",
            PositionEvent::StopPlaced { .. } => "StopPlaced",
            PositionEvent::Confirmed => "Confirmed",
            PositionEvent::BeginClosing => "BeginClosing",
            PositionEvent::Closed => "Closed",
            PositionEvent::Aborted => "Aborted",
        }
    }
}

/// Result of overwriting the slot with exchange truth.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub previous: Option<Position>,
    pub drifted: bool,
}

#[derive(Debug, Default)]
struct Slot {
    version: u64,
    position: Option<Position>,
}

struct StatusLabel(Option<PositionStatus>);

impl fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(status) => write!(f, "{}", status),
            None => write!(f, "IDLE"),
        }
    }
}

/// Shared, versioned position slot.
#[derive(Debug, Default)]
pub struct PositionState {
    slot: RwLock<Slot>,
}

impl PositionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position; `None` when idle. CLOSED positions are never held.
    pub async fn current(&self) -> Option<Position> {
        self.slot.read().await.position.clone()
    }

    /// Current position together with the slot version.
    pub async fn snapshot(&self) -> (u64, Option<Position>) {
        let slot = self.slot.read().await;
        (slot.version, slot.position.clone())
    }

    /// Apply `event` only if the slot's status equals `expected`
    /// (`None` meaning idle). Returns the resulting position; for
    /// `Closed` and `Aborted` that is the final CLOSED record, and the
    /// slot becomes idle.
    pub async fn transition(
        &self,
        expected: Option<PositionStatus>,
        event: PositionEvent,
    ) -> Result<Position, StateError> {
        let mut slot = self.slot.write().await;
        let actual = slot.position.as_ref().map(|p| p.status);
        if actual != expected {
            return Err(StateError::Conflict {
                expected: StatusLabel(expected).to_string(),
                actual: StatusLabel(actual).to_string(),
            });
        }

        let name = event.name();
        let invalid = || {
            StateError::InvalidTransition(format!("{} from {}", name, StatusLabel(actual)))
        };

        let (next, result) = match (slot.position.take(), event) {
            (
                None,
                PositionEvent::BeginOpening {
                    side,
                    leverage,
                    source_event_id,
                },
            ) => {
                let pos = Position::opening(side, leverage, source_event_id);
                (Some(pos.clone()), pos)
            }
            (
                Some(mut pos),
                PositionEvent::EntryFilled {
                    entry_price,
                    quantity,
                    order_id,
                },
            ) if pos.status == PositionStatus::Opening => {
                pos.entry_price = entry_price;
                pos.quantity = quantity;
                pos.entry_order_id = Some(order_id);
                pos.opened_at = Utc::now();
                (Some(pos.clone()), pos)
            }
            (
                Some(mut pos),
                PositionEvent::StopPlaced {
                    kind,
                    order_id,
                    stop_price,
                    callback_pct,
                },
            ) if pos.status == PositionStatus::Opening && !pos.quantity.is_zero() => {
                match kind {
                    StopKind::Fixed => {
                        pos.fixed_stop_order_id = Some(order_id);
                        pos.fixed_stop_price = stop_price;
                    }
                    StopKind::Trailing => {
                        pos.trailing_stop_order_id = Some(order_id);
                        pos.trailing_callback_pct = callback_pct;
                    }
                }
                (Some(pos.clone()), pos)
            }
            (Some(mut pos), PositionEvent::Confirmed)
                if pos.status == PositionStatus::Opening && pos.is_protected() =>
            {
                pos.status = PositionStatus::Open;
                (Some(pos.clone()), pos)
            }
            (Some(mut pos), PositionEvent::BeginClosing)
                if matches!(pos.status, PositionStatus::Opening | PositionStatus::Open) =>
            {
                pos.status = PositionStatus::Closing;
                (Some(pos.clone()), pos)
            }
            (Some(mut pos), PositionEvent::Closed) if pos.status == PositionStatus::Closing => {
                pos.status = PositionStatus::Closed;
                (None, pos)
            }
            (Some(mut pos), PositionEvent::Aborted)
                if pos.status == PositionStatus::Opening && pos.quantity.is_zero() =>
            {
                pos.status = PositionStatus::Closed;
                (None, pos)
            }
            (previous, _) => {
                slot.position = previous;
                return Err(invalid());
            }
        };

        slot.position = next;
        slot.version += 1;
        debug!(
            event = name,
            from = %StatusLabel(actual),
            to = %result.status,
            version = slot.version,
            "Position state transition"
        );
        Ok(result)
    }

    /// Overwrite the slot with exchange truth. Fails with a conflict if
    /// another writer moved the slot since `expected_version` was read.
    pub async fn reconcile(
        &self,
        expected_version: u64,
        truth: Option<Position>,
    ) -> Result<ReconcileOutcome, StateError> {
        let mut slot = self.slot.write().await;
        if slot.version != expected_version {
            return Err(StateError::Conflict {
                expected: format!("version {}", expected_version),
                actual: format!("version {}", slot.version),
            });
        }

        let truth = truth.filter(|p| p.status.is_live());
        let drifted = match (&slot.position, &truth) {
            (None, None) => false,
            (Some(local), Some(remote)) => {
                local.side != remote.side
                    || local.quantity != remote.quantity
                    || local.status != remote.status
            }
            _ => true,
        };

        if drifted {
            warn!(
                local = %slot.position.as_ref().map(|p| p.to_string()).unwrap_or_else(|| "IDLE".into()),
                exchange = %truth.as_ref().map(|p| p.to_string()).unwrap_or_else(|| "FLAT".into()),
                "Position drift detected, adopting exchange state"
            );
        }

        let previous = std::mem::replace(&mut slot.position, truth);
        slot.version += 1;
        Ok(ReconcileOutcome { previous, drifted })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal_macros::dec;

    use super::*;

    fn begin(side: Side) -> PositionEvent {
        PositionEvent::BeginOpening {
            side,
            leverage: 15,
            source_event_id: Some("post-1".into()),
        }
    }

    fn filled() -> PositionEvent {
        PositionEvent::EntryFilled {
            entry_price: dec!(60000),
            quantity: dec!(0.25),
            order_id: "entry-1".into(),
        }
    }

    fn stop(kind: StopKind, id: &str) -> PositionEvent {
        PositionEvent::StopPlaced {
            kind,
            order_id: id.into(),
            stop_price: None,
            callback_pct: None,
        }
    }

    async fn opened(state: &PositionState) {
        let opening = Some(PositionStatus::Opening);
        state.transition(None, begin(Side::Long)).await.unwrap();
        state.transition(opening, filled()).await.unwrap();
        state.transition(opening, stop(StopKind::Fixed, "f")).await.unwrap();
        state.transition(opening, stop(StopKind::Trailing, "t")).await.unwrap();
        state.transition(opening, PositionEvent::Confirmed).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let state = PositionState::new();
        opened(&state).await;

        let pos = state.current().await.unwrap();
        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pos.entry_order_id.as_deref(), Some("entry-1"));

        state
            .transition(Some(PositionStatus::Open), PositionEvent::BeginClosing)
            .await
            .unwrap();
        let closed = state
            .transition(Some(PositionStatus::Closing), PositionEvent::Closed)
            .await
            .unwrap();

        assert_eq!(closed.status, PositionStatus::Closed);
        assert!(state.current().await.is_none());
    }

    #[tokio::test]
    async fn test_cannot_confirm_without_both_stops() {
        let state = PositionState::new();
        let opening = Some(PositionStatus::Opening);
        state.transition(None, begin(Side::Short)).await.unwrap();
        state.transition(opening, filled()).await.unwrap();
        state.transition(opening, stop(StopKind::Fixed, "f")).await.unwrap();

        let err = state
            .transition(opening, PositionEvent::Confirmed)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition(_)));
        assert_eq!(state.current().await.unwrap().status, PositionStatus::Opening);
    }

    #[tokio::test]
    async fn test_status_mismatch_is_a_conflict() {
        let state = PositionState::new();
        opened(&state).await;

        let err = state.transition(None, begin(Side::Short)).await.unwrap_err();
        assert_eq!(
            err,
            StateError::Conflict {
                expected: "IDLE".into(),
                actual: "OPEN".into()
            }
        );
    }

    #[tokio::test]
    async fn test_abort_only_before_fill() {
        let state = PositionState::new();
        let opening = Some(PositionStatus::Opening);
        state.transition(None, begin(Side::Long)).await.unwrap();
        state.transition(opening, filled()).await.unwrap();

        let err = state
            .transition(opening, PositionEvent::Aborted)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition(_)));

        let fresh = PositionState::new();
        fresh.transition(None, begin(Side::Long)).await.unwrap();
        fresh.transition(opening, PositionEvent::Aborted).await.unwrap();
        assert!(fresh.current().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_open_has_one_winner() {
        let state = Arc::new(PositionState::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                let side = if i % 2 == 0 { Side::Long } else { Side::Short };
                state.transition(None, begin(side)).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_reconcile_overwrites_and_reports_drift() {
        let state = PositionState::new();
        opened(&state).await;

        let (version, local) = state.snapshot().await;
        let outcome = state.reconcile(version, None).await.unwrap();
        assert!(outcome.drifted);
        assert_eq!(outcome.previous, local);
        assert!(state.current().await.is_none());

        let (version, _) = state.snapshot().await;
        let outcome = state.reconcile(version, None).await.unwrap();
        assert!(!outcome.drifted);
    }

    #[tokio::test]
    async fn test_reconcile_rejects_stale_version() {
        let state = PositionState::new();
        let (version, _) = state.snapshot().await;
        state.transition(None, begin(Side::Long)).await.unwrap();

        let err = state.reconcile(version, None).await.unwrap_err();
        assert!(matches!(err, StateError::Conflict { .. }));
        assert!(state.current().await.is_some());
    }
}
