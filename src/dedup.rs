//! Trigger Deduplicator: first-trigger-wins over `(token_id,
//! condition_id, threshold)`. G2 protection — multiple token_ids can
//! map to the same `condition_id`, so dedup must happen at the
//! condition level, not just the token level.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::domain::TriggerRecord;
use crate::store::Store;

pub struct TriggerDeduplicator {
    store: Arc<Store>,
}

impl TriggerDeduplicator {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Advisory pre-check only — races against concurrent callers.
    /// Callers that need the real guarantee must go through
    /// `try_record_atomic`.
    pub async fn should_trigger(
        &self,
        token_id: &str,
        condition_id: &str,
        threshold: f64,
    ) -> Result<bool> {
        if self
            .store
            .trigger_exists_for_token(token_id, condition_id, threshold)
            .await?
        {
            return Ok(false);
        }
        if self
            .store
            .trigger_exists_for_condition(condition_id, threshold)
            .await?
        {
            return Ok(false);
        }
        Ok(true)
    }

    /// The G2-safe call: atomically checks and records under one
    /// durable-store transaction. Returns `true` only for the caller
    /// that actually won the race.
    #[allow(clippy::too_many_arguments)]
    pub async fn try_record_atomic(
        &self,
        token_id: &str,
        condition_id: &str,
        threshold: f64,
        price: f64,
        trade_size: Option<f64>,
        model_score: Option<f64>,
        outcome: Option<String>,
        outcome_index: Option<i64>,
    ) -> Result<bool> {
        let record = TriggerRecord {
            token_id: token_id.to_string(),
            condition_id: condition_id.to_string(),
            threshold,
            price,
            trade_size,
            model_score,
            outcome,
            outcome_index,
            triggered_at: Utc::now(),
        };
        self.store.try_record_trigger_atomic(&record).await
    }

    /// Used when execution fails after the atomic claim succeeded, to
    /// allow a later event to retry.
    pub async fn remove(&self, token_id: &str, condition_id: &str, threshold: f64) -> Result<bool> {
        self.store
            .remove_trigger(token_id, condition_id, threshold)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_token_for_same_condition_is_deduped() {
        let store = Arc::new(Store::new(":memory:").unwrap());
        let dedup = TriggerDeduplicator::new(store);

        assert!(dedup
            .try_record_atomic("T1", "C1", 0.95, 0.96, Some(100.0), None, None, None)
            .await
            .unwrap());

        // G2: a different token for the same condition must not trigger again.
        assert!(!dedup
            .try_record_atomic("T2", "C1", 0.95, 0.97, Some(100.0), None, None, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn removing_a_trigger_allows_retry() {
        let store = Arc::new(Store::new(":memory:").unwrap());
        let dedup = TriggerDeduplicator::new(store);

        assert!(dedup
            .try_record_atomic("T1", "C1", 0.95, 0.96, None, None, None, None)
            .await
            .unwrap());
        assert!(dedup.remove("T1", "C1", 0.95).await.unwrap());
        assert!(dedup
            .try_record_atomic("T1", "C1", 0.95, 0.96, None, None, None, None)
            .await
            .unwrap());
    }
}
