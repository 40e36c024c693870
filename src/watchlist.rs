//! Watchlist Service: tokens that almost triggered but fell short of
//! the execution threshold. Rescored periodically; promoted into
//! tradeable candidates once their score recovers.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use crate::domain::{WatchlistEntry, WatchlistStatus};
use crate::store::Store;

const DEFAULT_PROMOTION_THRESHOLD: f64 = 0.97;
const DEFAULT_EXPIRY_THRESHOLD: f64 = 0.90;
/// Every hour closer to resolution nudges the score up, capped at ~0.07.
const TIME_DECAY_BONUS_CAP: f64 = 0.07;

pub struct Promotion {
    pub token_id: String,
    pub condition_id: String,
    pub score: f64,
}

pub struct WatchlistService {
    store: Arc<Store>,
    promotion_threshold: f64,
    expiry_threshold: f64,
}

impl WatchlistService {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,
            expiry_threshold: DEFAULT_EXPIRY_THRESHOLD,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add(
        &self,
        token_id: &str,
        condition_id: &str,
        initial_score: f64,
        time_to_end_hours: f64,
        trigger_price: Option<f64>,
        question: Option<String>,
    ) -> Result<()> {
        let now = Utc::now();
        let entry = WatchlistEntry {
            token_id: token_id.to_string(),
            condition_id: condition_id.to_string(),
            question,
            trigger_price,
            initial_score,
            current_score: initial_score,
            time_to_end_hours,
            status: WatchlistStatus::Watching,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_watchlist(&entry).await?;
        info!(token_id, initial_score, "added to watchlist");
        Ok(())
    }

    /// Default heuristic scorer: the closer a market is to resolution,
    /// the more weight its current score carries, up to a small bonus.
    fn heuristic_rescore(entry: &WatchlistEntry) -> f64 {
        let urgency = (1.0 / (entry.time_to_end_hours.max(1.0))).min(1.0);
        (entry.current_score + urgency * TIME_DECAY_BONUS_CAP).min(1.0)
    }

    /// Rescores every watching entry. An optional scorer overrides the
    /// built-in heuristic (used by tests and by model-backed strategies).
    pub async fn rescore_all(
        &self,
        scorer: Option<&dyn Fn(&WatchlistEntry) -> f64>,
    ) -> Result<Vec<Promotion>> {
        let entries = self.store.watching_entries().await?;
        let mut promotions = Vec::new();

        for mut entry in entries {
            let new_score = match scorer {
                Some(f) => f(&entry),
                None => Self::heuristic_rescore(&entry),
            };
            let was_below_promotion = entry.current_score < self.promotion_threshold;
            entry.current_score = new_score;
            entry.updated_at = Utc::now();

            if new_score >= self.promotion_threshold && was_below_promotion {
                entry.status = WatchlistStatus::Promoted;
                promotions.push(Promotion {
                    token_id: entry.token_id.clone(),
                    condition_id: entry.condition_id.clone(),
                    score: new_score,
                });
            } else if new_score < self.expiry_threshold {
                entry.status = WatchlistStatus::Expired;
            }

            self.store.upsert_watchlist(&entry).await?;
        }

        if !promotions.is_empty() {
            info!(count = promotions.len(), "promoted watchlist entries");
        }
        Ok(promotions)
    }

    pub async fn all(&self, limit: i64) -> Result<Vec<WatchlistEntry>> {
        self.store.all_watchlist(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn high_scoring_entry_is_promoted() {
        let store = Arc::new(Store::new(":memory:").unwrap());
        let service = WatchlistService::new(store);
        service.add("T1", "C1", 0.96, 2.0, Some(0.93), None).await.unwrap();

        let promotions = service.rescore_all(Some(&|_e: &WatchlistEntry| 0.98)).await.unwrap();
        assert_eq!(promotions.len(), 1);
        assert_eq!(promotions[0].token_id, "T1");
    }

    #[tokio::test]
    async fn low_scoring_entry_expires() {
        let store = Arc::new(Store::new(":memory:").unwrap());
        let service = WatchlistService::new(store.clone());
        service.add("T1", "C1", 0.95, 2.0, None, None).await.unwrap();

        service.rescore_all(Some(&|_e: &WatchlistEntry| 0.50)).await.unwrap();
        let all = store.all_watchlist(10).await.unwrap();
        assert_eq!(all[0].status, WatchlistStatus::Expired);
    }
}
