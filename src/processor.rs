//! Event Processor: hazard filters G1 (stale trade), G3 (size
//! backfill), G5 (divergence flag). Counters are protected by a
//! short-duration lock held only for increments — never across an I/O
//! call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::domain::{ProcessedEvent, RawEvent, Trade};
use crate::wire::WireAdapter;

const G3_PRICE_TOLERANCE: f64 = 0.01;
const G3_MAX_TRADE_AGE_SECONDS: i64 = 60;
const G3_TIMEOUT: Duration = Duration::from_secs(5);
const RECENT_EVENTS_CAPACITY: usize = 256;

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessorCounters {
    pub events_received: u64,
    pub price_updates: u64,
    pub trades_seen: u64,
    pub g1_filtered: u64,
    pub g3_missing: u64,
    pub g3_backfilled: u64,
    pub g5_divergence: u64,
}

struct Inner {
    counters: ProcessorCounters,
    recent_rejections: VecDeque<String>,
}

pub struct EventProcessor {
    wire: Arc<dyn WireAdapter>,
    max_trade_age_seconds: i64,
    max_price_deviation: f64,
    verify_orderbook: bool,
    inner: Mutex<Inner>,
}

impl EventProcessor {
    pub fn new(
        wire: Arc<dyn WireAdapter>,
        max_trade_age_seconds: i64,
        max_price_deviation: f64,
        verify_orderbook: bool,
    ) -> Self {
        Self {
            wire,
            max_trade_age_seconds,
            max_price_deviation,
            verify_orderbook,
            inner: Mutex::new(Inner {
                counters: ProcessorCounters::default(),
                recent_rejections: VecDeque::with_capacity(RECENT_EVENTS_CAPACITY),
            }),
        }
    }

    pub fn counters(&self) -> ProcessorCounters {
        self.inner.lock().counters
    }

    fn record_rejection(&self, reason: impl Into<String>) {
        let mut guard = self.inner.lock();
        if guard.recent_rejections.len() >= RECENT_EVENTS_CAPACITY {
            guard.recent_rejections.pop_front();
        }
        guard.recent_rejections.push_back(reason.into());
    }

    /// Applies G1/G3/G5. Returns `None` if the event is rejected
    /// outright (G1); I/O (G3, G5) happens with no lock held.
    pub async fn process(&self, event: RawEvent) -> Option<ProcessedEvent> {
        {
            let mut guard = self.inner.lock();
            guard.counters.events_received += 1;
        }

        match event {
            RawEvent::Trade(trade) => self.process_trade(trade).await,
            RawEvent::Price {
                token_id,
                condition_id,
                price,
                observed_at,
            } => {
                {
                    let mut guard = self.inner.lock();
                    guard.counters.price_updates += 1;
                }
                self.process_price_update(token_id, condition_id, price, observed_at)
                    .await
            }
        }
    }

    async fn process_trade(&self, trade: Trade) -> Option<ProcessedEvent> {
        {
            let mut guard = self.inner.lock();
            guard.counters.trades_seen += 1;
        }

        let now = Utc::now();
        // G1: events with no parseable timestamp never reach here — the
        // wire adapter only emits `Trade`s with a parsed `traded_at`.
        if !trade.is_fresh(now, self.max_trade_age_seconds) {
            {
                let mut guard = self.inner.lock();
                guard.counters.g1_filtered += 1;
            }
            self.record_rejection(format!("g1_trade_age token={}", trade.token_id));
            return None;
        }

        let trade_age_seconds = trade.age_seconds(now);
        let g5_flagged = self.check_divergence(&trade.token_id, trade.price).await;

        Some(ProcessedEvent {
            token_id: trade.token_id,
            condition_id: trade.condition_id,
            price: trade.price,
            trade_size: Some(trade.size),
            trade_age_seconds: Some(trade_age_seconds),
            observed_at: trade.traded_at,
            g5_flagged,
        })
    }

    async fn process_price_update(
        &self,
        token_id: String,
        condition_id: Option<String>,
        price: f64,
        observed_at: chrono::DateTime<Utc>,
    ) -> Option<ProcessedEvent> {
        let trade_size = self.backfill_size(&token_id, price).await;
        {
            let mut guard = self.inner.lock();
            if trade_size.is_some() {
                guard.counters.g3_backfilled += 1;
            } else {
                guard.counters.g3_missing += 1;
            }
        }

        let g5_flagged = self.check_divergence(&token_id, price).await;

        Some(ProcessedEvent {
            token_id,
            condition_id,
            price,
            trade_size,
            trade_age_seconds: None,
            observed_at,
            g5_flagged,
        })
    }

    async fn backfill_size(&self, token_id: &str, price: f64) -> Option<f64> {
        let fetch = self.wire.fetch_trades(token_id, G3_MAX_TRADE_AGE_SECONDS);
        let trades = match tokio::time::timeout(G3_TIMEOUT, fetch).await {
            Ok(Ok(trades)) => trades,
            _ => return None,
        };

        trades
            .into_iter()
            .find(|t| (t.price - price).abs() <= G3_PRICE_TOLERANCE)
            .map(|t| t.size)
    }

    async fn check_divergence(&self, token_id: &str, price: f64) -> bool {
        if !self.verify_orderbook {
            return false;
        }
        match self
            .wire
            .verify_price(token_id, price, self.max_price_deviation)
            .await
        {
            Ok((ok, _, _)) => {
                if !ok {
                    let mut guard = self.inner.lock();
                    guard.counters.g5_divergence += 1;
                }
                !ok
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BookLevel, Order, Orderbook, Side};
    use async_trait::async_trait;

    struct FakeWire {
        best_bid: f64,
    }

    #[async_trait]
    impl WireAdapter for FakeWire {
        async fn fetch_orderbook(&self, token_id: &str) -> anyhow::Result<Orderbook> {
            Ok(Orderbook {
                token_id: token_id.to_string(),
                bids: vec![BookLevel {
                    price: self.best_bid,
                    size: 100.0,
                }],
                asks: vec![],
                observed_at: Utc::now(),
            })
        }
        async fn fetch_trades(&self, _token_id: &str, _max_age: i64) -> anyhow::Result<Vec<Trade>> {
            Ok(vec![])
        }
        async fn fetch_balance(&self) -> anyhow::Result<f64> {
            Ok(1000.0)
        }
        async fn submit_order(
            &self,
            _token_id: &str,
            _condition_id: &str,
            _side: Side,
            _price: f64,
            _size: f64,
        ) -> anyhow::Result<String> {
            Ok("O1".to_string())
        }
        async fn get_order(&self, order_id: &str) -> anyhow::Result<Order> {
            unimplemented!("{order_id}")
        }
        async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn g1_filters_stale_trades() {
        let processor = EventProcessor::new(Arc::new(FakeWire { best_bid: 0.9 }), 300, 0.10, false);
        let stale = Trade {
            id: "t1".into(),
            token_id: "T1".into(),
            condition_id: Some("C1".into()),
            price: 0.97,
            size: 100.0,
            side: Side::Buy,
            traded_at: Utc::now() - chrono::Duration::seconds(400),
        };
        let result = processor.process(RawEvent::Trade(stale)).await;
        assert!(result.is_none());
        assert_eq!(processor.counters().g1_filtered, 1);
    }

    #[tokio::test]
    async fn g5_flags_divergent_price_without_rejecting() {
        let processor = EventProcessor::new(Arc::new(FakeWire { best_bid: 0.80 }), 300, 0.10, true);
        let event = RawEvent::Price {
            token_id: "T1".into(),
            condition_id: Some("C1".into()),
            price: 0.97,
            observed_at: Utc::now(),
        };
        let processed = processor.process(event).await.unwrap();
        assert!(processed.g5_flagged);
        assert_eq!(processor.counters().g5_divergence, 1);
    }
}
