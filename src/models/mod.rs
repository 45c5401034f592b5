//! Data models for sentiment events, positions, and audit records.

mod position;
mod record;
mod sentiment;

pub use position::{Position, PositionStatus, Side};
pub use record::{CloseSummary, RecordAction, TransitionRecord};
pub use sentiment::{Score, SentimentEvent};
