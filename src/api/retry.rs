//! Retry decorator for exchange gateway calls.
//!
//! Transient failures (network, 5xx, rate limits, per-call timeouts) are
//! retried with exponential backoff up to a bounded attempt count.
//! Rejections surface immediately.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GatewayError, GatewayResult};

use super::gateway::{
    Balance, DynGateway, ExchangeGateway, MarketOrder, OpenOrder, OrderAck, PositionSnapshot,
    StopOrder,
};

/// Attempt count and delay policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,

    pub initial_interval: Duration,

    pub max_interval: Duration,

    pub multiplier: f64,

    /// Hard limit on a single attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(4),
            multiplier: 2.0,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Millisecond delays, for tests.
    #[cfg(test)]
    pub fn fast(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            multiplier: 2.0,
            call_timeout: Duration::from_millis(200),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.2)
            // attempts are bounded by count, not by wall time
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. The last error is returned on exhaustion.
pub async fn retry_bounded<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    op_name: &str,
    is_retryable: P,
    op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let is_retryable = &is_retryable;
    let mut op = op;
    let mut attempt = 0u32;

    backoff::future::retry_notify(
        policy.backoff(),
        move || {
            attempt += 1;
            let current = attempt;
            let fut = op();
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if current < max_attempts && is_retryable(&e) => {
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        },
        |e: E, wait: Duration| {
            warn!(
                op = op_name,
                error = %e,
                retry_in_ms = wait.as_millis() as u64,
                "Retrying after transient failure"
            );
        },
    )
    .await
}

/// Wraps any gateway with timeout and retry handling.
pub struct RetryingGateway {
    inner: DynGateway,
    policy: RetryPolicy,
}

impl RetryingGateway {
    pub fn new(inner: DynGateway, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn call<'a, T, F>(&'a self, op_name: &'static str, mut f: F) -> GatewayResult<T>
    where
        F: FnMut() -> BoxFuture<'a, GatewayResult<T>> + Send,
        T: Send,
    {
        let timeout = self.policy.call_timeout;
        retry_bounded(&self.policy, op_name, GatewayError::is_retryable, move || {
            let fut = f();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout),
                }
            }
        })
        .await
    }
}

impl ExchangeGateway for RetryingGateway {
    fn set_leverage(&self, leverage: u32) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(self.call("set_leverage", move || self.inner.set_leverage(leverage)))
    }

    fn mark_price(&self) -> BoxFuture<'_, GatewayResult<Decimal>> {
        Box::pin(self.call("mark_price", move || self.inner.mark_price()))
    }

    fn balance(&self) -> BoxFuture<'_, GatewayResult<Balance>> {
        Box::pin(self.call("balance", move || self.inner.balance()))
    }

    fn place_market_order(&self, order: MarketOrder) -> BoxFuture<'_, GatewayResult<OrderAck>> {
        Box::pin(self.call("place_market_order", move || {
            self.inner.place_market_order(order.clone())
        }))
    }

    fn place_stop_order(&self, order: StopOrder) -> BoxFuture<'_, GatewayResult<OrderAck>> {
        Box::pin(self.call("place_stop_order", move || {
            self.inner.place_stop_order(order.clone())
        }))
    }

    fn position(&self) -> BoxFuture<'_, GatewayResult<Option<PositionSnapshot>>> {
        Box::pin(self.call("position", move || self.inner.position()))
    }

    fn open_orders(&self) -> BoxFuture<'_, GatewayResult<Vec<OpenOrder>>> {
        Box::pin(self.call("open_orders", move || self.inner.open_orders()))
    }

    fn cancel_all_orders(&self) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(self.call("cancel_all_orders", move || self.inner.cancel_all_orders()))
    }

    fn close_position(&self, client_order_id: String) -> BoxFuture<'_, GatewayResult<Option<OrderAck>>> {
        Box::pin(self.call("close_position", move || {
            self.inner.close_position(client_order_id.clone())
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::api::paper::{Op, PaperExchange};

    fn wrapped(paper: Arc<PaperExchange>, attempts: u32) -> RetryingGateway {
        RetryingGateway::new(paper, RetryPolicy::fast(attempts))
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let paper = Arc::new(PaperExchange::new(dec!(1000), dec!(50000)));
        paper.fail_next(Op::MarkPrice, GatewayError::Transient("502".into()), 2).await;

        let gateway = wrapped(paper.clone(), 4);
        let price = gateway.mark_price().await.unwrap();

        assert_eq!(price, dec!(50000));
        assert_eq!(paper.call_count(Op::MarkPrice).await, 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let paper = Arc::new(PaperExchange::new(dec!(1000), dec!(50000)));
        paper.fail_next(Op::Balance, GatewayError::RateLimited, 10).await;

        let gateway = wrapped(paper.clone(), 3);
        let err = gateway.balance().await.unwrap_err();

        assert_eq!(err, GatewayError::RateLimited);
        assert_eq!(paper.call_count(Op::Balance).await, 3);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let paper = Arc::new(PaperExchange::new(dec!(1000), dec!(50000)));
        let rejection = GatewayError::Rejected {
            code: -4028,
            message: "Leverage is not valid".into(),
        };
        paper.fail_next(Op::SetLeverage, rejection.clone(), 1).await;

        let gateway = wrapped(paper.clone(), 4);
        let err = gateway.set_leverage(15).await.unwrap_err();

        assert_eq!(err, rejection);
        assert_eq!(paper.call_count(Op::SetLeverage).await, 1);
    }

    #[tokio::test]
    async fn test_slow_calls_time_out_and_retry() {
        let paper = Arc::new(PaperExchange::new(dec!(1000), dec!(50000)));
        paper.delay_next(Op::Position, Duration::from_secs(5), 1).await;

        let gateway = wrapped(paper.clone(), 3);
        let position = gateway.position().await.unwrap();

        assert!(position.is_none());
        assert_eq!(paper.call_count(Op::Position).await, 2);
    }
}
