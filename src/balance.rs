//! Balance Manager: tracks available USDC with reservation accounting
//! and a G4-protected cache (the exchange's balance endpoint caches
//! aggressively, so every fill/cancel/failure/resolution must force a
//! refresh rather than trust the cache).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::Reservation;
use crate::errors::InsufficientBalance;
use crate::wire::WireAdapter;

const DEFAULT_CACHE_TTL_SECONDS: i64 = 60;

struct Inner {
    cached_balance: Option<f64>,
    cache_time: Option<DateTime<Utc>>,
    reservations: HashMap<String, Reservation>,
}

pub struct BalanceManager {
    wire: Arc<dyn WireAdapter>,
    min_reserve: f64,
    cache_ttl_seconds: i64,
    inner: Mutex<Inner>,
}

impl BalanceManager {
    pub fn new(wire: Arc<dyn WireAdapter>, min_reserve: f64) -> Self {
        Self {
            wire,
            min_reserve,
            cache_ttl_seconds: DEFAULT_CACHE_TTL_SECONDS,
            inner: Mutex::new(Inner {
                cached_balance: None,
                cache_time: None,
                reservations: HashMap::new(),
            }),
        }
    }

    async fn cached_or_fetch(&self, guard: &mut Inner) -> Result<f64> {
        let now = Utc::now();
        if let (Some(balance), Some(cached_at)) = (guard.cached_balance, guard.cache_time) {
            if (now - cached_at).num_seconds() < self.cache_ttl_seconds {
                return Ok(balance);
            }
        }
        let balance = self.wire.fetch_balance().await?;
        guard.cached_balance = Some(balance);
        guard.cache_time = Some(now);
        Ok(balance)
    }

    pub async fn total_balance(&self) -> Result<f64> {
        let mut guard = self.inner.lock().await;
        self.cached_or_fetch(&mut guard).await
    }

    pub async fn available_balance(&self) -> Result<f64> {
        let mut guard = self.inner.lock().await;
        let total = self.cached_or_fetch(&mut guard).await?;
        let reserved: f64 = guard.reservations.values().map(|r| r.amount).sum();
        Ok(total - reserved)
    }

    pub async fn tradeable_balance(&self) -> Result<f64> {
        let available = self.available_balance().await?;
        Ok((available - self.min_reserve).max(0.0))
    }

    pub async fn reserve(&self, amount: f64, order_id: &str) -> Result<()> {
        let tradeable = self.tradeable_balance().await?;
        if amount > tradeable {
            anyhow::bail!(InsufficientBalance {
                requested: amount,
                available: tradeable,
            });
        }
        let mut guard = self.inner.lock().await;
        guard.reservations.insert(
            order_id.to_string(),
            Reservation {
                order_id: order_id.to_string(),
                amount,
                created_at: Utc::now(),
            },
        );
        debug!(order_id, amount, "reserved balance");
        Ok(())
    }

    pub async fn release_reservation(&self, order_id: &str) {
        let mut guard = self.inner.lock().await;
        if guard.reservations.remove(order_id).is_some() {
            debug!(order_id, "released reservation");
        }
    }

    /// `filled_amount` is cost basis (price * filled size), not raw
    /// size — the filled portion becomes a position and no longer
    /// needs to be reserved.
    pub async fn adjust_reservation_for_partial_fill(&self, order_id: &str, filled_amount: f64) {
        let mut guard = self.inner.lock().await;
        let Some(reservation) = guard.reservations.get(order_id).cloned() else {
            return;
        };
        let remaining = reservation.amount - filled_amount;
        if remaining <= 0.0 {
            guard.reservations.remove(order_id);
        } else {
            guard.reservations.insert(
                order_id.to_string(),
                Reservation {
                    order_id: order_id.to_string(),
                    amount: remaining,
                    created_at: reservation.created_at,
                },
            );
        }
    }

    pub async fn has_reservation(&self, order_id: &str) -> bool {
        self.inner.lock().await.reservations.contains_key(order_id)
    }

    pub async fn active_reservations(&self) -> Vec<Reservation> {
        self.inner.lock().await.reservations.values().cloned().collect()
    }

    /// G4: force-refresh the balance from the wire, discarding the
    /// cache. Call this after every fill, cancel, failure and
    /// resolution.
    pub async fn refresh_balance(&self) -> Result<f64> {
        let mut guard = self.inner.lock().await;
        guard.cached_balance = None;
        guard.cache_time = None;
        self.cached_or_fetch(&mut guard).await
    }

    /// Safety net for reservations orphaned by a crash between
    /// `reserve` and `release_reservation`/`adjust_reservation_for_partial_fill`.
    pub async fn clear_stale_reservations(&self, max_age_seconds: i64) -> usize {
        let mut guard = self.inner.lock().await;
        let now = Utc::now();
        let stale: Vec<String> = guard
            .reservations
            .values()
            .filter(|r| (now - r.created_at).num_seconds() > max_age_seconds)
            .map(|r| r.order_id.clone())
            .collect();
        for id in &stale {
            guard.reservations.remove(id);
        }
        stale.len()
    }
}
