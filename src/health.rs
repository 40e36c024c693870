//! Health & Metrics: rolling-window counters and an on-demand,
//! lock-free-for-readers health snapshot.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

const WINDOW_SECONDS: i64 = 300;
const ERROR_HOUR_SECONDS: i64 = 3600;
const STREAM_STALE_THRESHOLD_SECONDS: i64 = 60;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct Counters {
    pub events_received: u64,
    pub price_updates: u64,
    pub trades_stored: u64,
    pub g1_filtered: u64,
    pub g3_missing: u64,
    pub g3_backfilled: u64,
    pub g5_divergence: u64,
    pub errors: u64,
    pub manual_review_required: u64,
}

struct Bucket {
    minute: i64,
    counters: Counters,
}

struct Inner {
    buckets: VecDeque<Bucket>,
}

fn add(c: &mut Counters, other: &Counters) {
    c.events_received += other.events_received;
    c.price_updates += other.price_updates;
    c.trades_stored += other.trades_stored;
    c.g1_filtered += other.g1_filtered;
    c.g3_missing += other.g3_missing;
    c.g3_backfilled += other.g3_backfilled;
    c.g5_divergence += other.g5_divergence;
    c.errors += other.errors;
    c.manual_review_required += other.manual_review_required;
}

/// Per-kind increment selector, kept small and explicit rather than a
/// stringly-typed counter name.
#[derive(Debug, Clone, Copy)]
pub enum Metric {
    EventsReceived,
    PriceUpdates,
    TradesStored,
    G1Filtered,
    G3Missing,
    G3Backfilled,
    G5Divergence,
    Errors,
    ManualReviewRequired,
}

pub struct HealthMonitor {
    inner: Mutex<Inner>,
    /// Unbounded-but-pruned deque of error timestamps, tracked
    /// separately from the 5-minute operational buckets so "errors in
    /// the last hour" reflects a real hour rather than being capped at
    /// whatever the 5-minute window happens to hold.
    error_timestamps: Mutex<VecDeque<i64>>,
    store_reachable: std::sync::atomic::AtomicBool,
    last_stream_message_at: AtomicI64,
    active_subscriptions: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub store_reachable: bool,
    pub stream_connected: bool,
    pub last_stream_message_age_seconds: Option<i64>,
    pub active_subscriptions: u64,
    pub counters_last_5m: Counters,
    pub errors_last_hour: u64,
}

impl HealthMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                buckets: VecDeque::new(),
            }),
            error_timestamps: Mutex::new(VecDeque::new()),
            store_reachable: std::sync::atomic::AtomicBool::new(true),
            last_stream_message_at: AtomicI64::new(0),
            active_subscriptions: AtomicU64::new(0),
        })
    }

    pub fn record(&self, metric: Metric) {
        let minute = Utc::now().timestamp() / 60;
        let mut guard = self.inner.lock();
        self.prune(&mut guard, minute);

        if guard.buckets.back().map(|b| b.minute) != Some(minute) {
            guard.buckets.push_back(Bucket {
                minute,
                counters: Counters::default(),
            });
        }
        let bucket = guard.buckets.back_mut().unwrap();
        match metric {
            Metric::EventsReceived => bucket.counters.events_received += 1,
            Metric::PriceUpdates => bucket.counters.price_updates += 1,
            Metric::TradesStored => bucket.counters.trades_stored += 1,
            Metric::G1Filtered => bucket.counters.g1_filtered += 1,
            Metric::G3Missing => bucket.counters.g3_missing += 1,
            Metric::G3Backfilled => bucket.counters.g3_backfilled += 1,
            Metric::G5Divergence => bucket.counters.g5_divergence += 1,
            Metric::Errors => bucket.counters.errors += 1,
            Metric::ManualReviewRequired => bucket.counters.manual_review_required += 1,
        }
        drop(guard);

        if matches!(metric, Metric::Errors) {
            let now = Utc::now().timestamp();
            let mut errors = self.error_timestamps.lock();
            errors.push_back(now);
            Self::prune_errors(&mut errors, now);
        }
    }

    fn prune_errors(errors: &mut VecDeque<i64>, now: i64) {
        while let Some(front) = errors.front() {
            if now - *front > ERROR_HOUR_SECONDS {
                errors.pop_front();
            } else {
                break;
            }
        }
    }

    fn prune(&self, guard: &mut Inner, current_minute: i64) {
        let window_minutes = WINDOW_SECONDS / 60;
        while let Some(front) = guard.buckets.front() {
            if current_minute - front.minute > window_minutes {
                guard.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn note_stream_message(&self) {
        self.last_stream_message_at
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn set_subscription_count(&self, count: u64) {
        self.active_subscriptions.store(count, Ordering::Relaxed);
    }

    pub fn set_store_reachable(&self, reachable: bool) {
        self.store_reachable.store(reachable, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let now_minute = Utc::now().timestamp() / 60;
        let totals = {
            let mut guard = self.inner.lock();
            self.prune(&mut guard, now_minute);
            let mut totals = Counters::default();
            for bucket in &guard.buckets {
                add(&mut totals, &bucket.counters);
            }
            totals
        };

        let errors_last_hour = {
            let now = Utc::now().timestamp();
            let mut errors = self.error_timestamps.lock();
            Self::prune_errors(&mut errors, now);
            errors.len() as u64
        };

        let last_msg = self.last_stream_message_at.load(Ordering::Relaxed);
        let age = if last_msg == 0 {
            None
        } else {
            Some(Utc::now().timestamp() - last_msg)
        };

        HealthSnapshot {
            store_reachable: self.store_reachable.load(Ordering::Relaxed),
            stream_connected: age.map(|a| a < STREAM_STALE_THRESHOLD_SECONDS).unwrap_or(false),
            last_stream_message_age_seconds: age,
            active_subscriptions: self.active_subscriptions.load(Ordering::Relaxed),
            counters_last_5m: totals,
            errors_last_hour,
        }
    }
}
