//! Trading core: risk derivation, position state, engine and reconciler.

mod config;
mod dedupe;
mod engine;
mod intent;
mod reconciler;
mod risk;
pub(crate) mod sinks;
mod state;

pub use config::{SignalPolicy, TradingConfig};
pub use engine::{CommandReply, EngineInput, OperatorCommand, TradingEngine, OPERATOR_EVENT};
pub use reconciler::RECONCILE_EVENT;
pub use risk::RiskCalculator;
pub use sinks::Sinks;
pub use state::PositionState;
