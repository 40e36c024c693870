//! Wire Adapter: the exchange I/O boundary. `mod.rs` holds the shared
//! trait, rate limiter and retry helper; `clob.rs` and `stream.rs` hold
//! the concrete REST/streaming implementations.

pub mod clob;
pub mod stream;

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::domain::{Order, Orderbook, Side, Trade};

#[async_trait]
pub trait WireAdapter: Send + Sync {
    async fn fetch_orderbook(&self, token_id: &str) -> Result<Orderbook>;

    async fn fetch_trades(&self, token_id: &str, max_age_seconds: i64) -> Result<Vec<Trade>>;

    async fn fetch_balance(&self) -> Result<f64>;

    async fn submit_order(
        &self,
        token_id: &str,
        condition_id: &str,
        side: Side,
        price: f64,
        size: f64,
    ) -> Result<String>;

    async fn get_order(&self, order_id: &str) -> Result<Order>;

    async fn cancel_order(&self, order_id: &str) -> Result<bool>;

    /// Convenience wrapper for G5: compares `expected` against the
    /// current best bid.
    async fn verify_price(
        &self,
        token_id: &str,
        expected: f64,
        max_deviation: f64,
    ) -> Result<(bool, Option<f64>, Option<String>)> {
        let book = self.fetch_orderbook(token_id).await?;
        let best_bid = book.best_bid();
        match best_bid {
            None => Ok((false, None, Some("no bids".to_string()))),
            Some(bid) => {
                let deviation = (bid - expected).abs();
                if deviation > max_deviation {
                    Ok((
                        false,
                        Some(bid),
                        Some(format!(
                            "best_bid {bid} deviates {deviation} from expected {expected}"
                        )),
                    ))
                } else {
                    Ok((true, Some(bid), None))
                }
            }
        }
    }
}

/// Client-side windowed rate limiter: a fixed quota per rolling
/// window, with callers sleeping until the oldest request in the
/// window expires.
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(max_per_window)),
        }
    }

    pub fn per_second(requests_per_second: usize) -> Self {
        Self::new(requests_per_second.max(1), Duration::from_secs(1))
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut ts = self.timestamps.lock();
                let now = Instant::now();
                while let Some(front) = ts.front() {
                    if now.duration_since(*front) > self.window {
                        ts.pop_front();
                    } else {
                        break;
                    }
                }
                if ts.len() < self.max_per_window {
                    ts.push_back(now);
                    None
                } else {
                    let oldest = *ts.front().unwrap();
                    Some(self.window.saturating_sub(now.duration_since(oldest)))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_RETRIES: u32 = 3;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Exponential-backoff retry wrapper: retries transport/rate-limit
/// failures, doubling the backoff each attempt up to a cap.
pub async fn execute_with_retry<F, Fut, T>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                let retryable = e.downcast_ref::<crate::errors::TransportError>().is_some()
                    || e.downcast_ref::<crate::errors::RateLimited>().is_some();
                if !retryable || attempt >= MAX_RETRIES {
                    return Err(e);
                }
                tracing::warn!(attempt, backoff_ms, error = %e, "retrying wire call");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}
