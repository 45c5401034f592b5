//! Error taxonomy for the trading core.
//!
//! Gateway errors are classified once, at the transport boundary, so the
//! retry decorator and the engine can decide what to do without looking at
//! raw HTTP responses.

use thiserror::Error;

/// Failure reported by an exchange gateway call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Network failure or exchange-side 5xx.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// The call exceeded its per-call timeout.
    #[error("gateway call timed out")]
    Timeout,

    /// The exchange asked us to slow down.
    #[error("rate limited by exchange")]
    RateLimited,

    /// The exchange refused the request (margin, filters, parameters).
    #[error("rejected by exchange ({code}): {message}")]
    Rejected { code: i64, message: String },

    /// The client order id was already used; the first submission may
    /// or may not have gone through.
    #[error("duplicate client order id {client_order_id}")]
    Duplicate { client_order_id: String },

    /// Credentials or signature were refused.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Anything else (malformed responses, local encoding failures).
    #[error("gateway error: {0}")]
    Other(String),
}

impl GatewayError {
    /// Whether the retry decorator should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Transient(_) | GatewayError::Timeout | GatewayError::RateLimited
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Position State mutation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    /// Compare-and-set lost: the slot was not in the expected state.
    #[error("state conflict: expected {expected}, found {actual}")]
    Conflict { expected: String, actual: String },

    /// The requested transition is not legal from the current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

/// Errors surfaced by the trading engine for a single event.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("invalid sentiment score {0}, expected 0..=10")]
    InvalidScore(i64),

    #[error(transparent)]
    StateConflict(#[from] StateError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("no free balance available for sizing")]
    InsufficientBalance,

    /// Exposure exists on the exchange without both protective stops.
    #[error("CRITICAL exposure: {0}")]
    CriticalExposure(String),
}
