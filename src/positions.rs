//! Position Tracker: builds Positions from order fill deltas
//! (weighted-average re-entry on BUY, proportional reduction on SELL)
//! and persists every mutation through the durable store. An in-memory
//! token->position_id index avoids a database round trip on the hot
//! per-event path.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::domain::{ExitEvent, Order, Position, PositionStatus, Side};
use crate::store::Store;

pub struct PositionTracker {
    store: Arc<Store>,
    token_positions: RwLock<HashMap<String, String>>,
}

impl PositionTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            token_positions: RwLock::new(HashMap::new()),
        }
    }

    /// Populates the in-memory token index from the durable store.
    /// Call once at startup.
    pub async fn load_positions(&self) -> Result<usize> {
        let open = self.store.open_positions().await?;
        let mut index = self.token_positions.write();
        for pos in &open {
            index.insert(pos.token_id.clone(), pos.position_id.clone());
        }
        Ok(open.len())
    }

    pub async fn get_position(&self, position_id: &str) -> Result<Option<Position>> {
        self.store.get_position(position_id).await
    }

    pub fn position_id_for_token(&self, token_id: &str) -> Option<String> {
        self.token_positions.read().get(token_id).cloned()
    }

    pub async fn get_position_by_token(&self, token_id: &str) -> Result<Option<Position>> {
        match self.position_id_for_token(token_id) {
            Some(id) => self.store.get_position(&id).await,
            None => Ok(None),
        }
    }

    /// Records a fill delta — the amount newly filled since the last
    /// sync, not the order's cumulative `filled_size` — to avoid
    /// double-counting across repeated partial-fill syncs. `fill_price`
    /// must be the price attributed to this delta specifically, not the
    /// order's running cumulative average fill price, or partial-fill
    /// cost accounting drifts from the true weighted average.
    pub async fn record_fill_delta(&self, order: &Order, delta_size: f64, fill_price: f64) -> Result<Option<Position>> {
        if delta_size <= 0.0 {
            return Ok(None);
        }

        let existing_id = self.position_id_for_token(&order.token_id);

        if let Some(position_id) = existing_id {
            if let Some(mut position) = self.store.get_position(&position_id).await? {
                match order.side {
                    Side::Buy => {
                        let total_size = position.size + delta_size;
                        let total_cost = position.entry_cost + delta_size * fill_price;
                        position.size = total_size;
                        position.entry_cost = total_cost;
                        position.entry_price = if total_size > 0.0 {
                            total_cost / total_size
                        } else {
                            0.0
                        };
                        self.store
                            .update_open_position(
                                &position.position_id,
                                position.size,
                                position.entry_cost,
                                position.entry_price,
                                position.realized_pnl,
                            )
                            .await?;
                    }
                    Side::Sell => {
                        let sell_ratio = if position.size > 0.0 {
                            delta_size / position.size
                        } else {
                            1.0
                        };
                        let pnl = delta_size * (fill_price - position.entry_price);
                        position.size -= delta_size;
                        position.entry_cost -= position.entry_cost * sell_ratio;
                        position.realized_pnl += pnl;

                        if position.size <= 0.0 {
                            position.status = PositionStatus::Closed;
                            self.token_positions.write().remove(&order.token_id);
                            self.store
                                .close_position(
                                    &position.position_id,
                                    0.0,
                                    0.0,
                                    position.realized_pnl,
                                )
                                .await?;
                        } else {
                            self.store
                                .update_open_position(
                                    &position.position_id,
                                    position.size,
                                    position.entry_cost,
                                    position.entry_price,
                                    position.realized_pnl,
                                )
                                .await?;
                        }
                    }
                }
                info!(position_id = %position.position_id, size = position.size, "updated position");
                return Ok(Some(position));
            }
        }

        // No existing open position — SELL fills with nothing to reduce are dropped.
        if order.side != Side::Buy {
            return Ok(None);
        }

        let position_id = format!("pos_{}", &Uuid::new_v4().simple().to_string()[..12]);
        let position = Position::new_from_fill(
            position_id,
            order.token_id.clone(),
            order.condition_id.clone(),
            delta_size,
            fill_price,
            Utc::now(),
            Some(order.order_id.clone()),
        );

        self.store.upsert_position(&position).await?;
        self.token_positions
            .write()
            .insert(order.token_id.clone(), position.position_id.clone());

        info!(position_id = %position.position_id, size = delta_size, price = fill_price, "opened position");
        Ok(Some(position))
    }

    /// Atomically claims exclusive rights to exit a position — only
    /// one caller ever wins for a given `position_id`.
    pub async fn try_claim_exit(&self, position_id: &str) -> Result<bool> {
        self.store.try_claim_exit_atomic(position_id).await
    }

    pub async fn mark_exit_pending(&self, position_id: &str, order_id: &str) -> Result<()> {
        self.store.mark_exit_pending(position_id, order_id).await
    }

    pub async fn clear_exit_pending(
        &self,
        position_id: &str,
        status: crate::domain::ExitStatus,
    ) -> Result<()> {
        self.store.clear_exit_pending(position_id, status).await
    }

    pub async fn close_position(
        &self,
        position_id: &str,
        exit_price: f64,
        exit_type: &str,
        reason: &str,
    ) -> Result<Option<ExitEvent>> {
        let Some(position) = self.store.get_position(position_id).await? else {
            return Ok(None);
        };

        let pnl = position.size * (exit_price - position.entry_price);
        let now = Utc::now();
        let hours_held = (now - position.entry_time).num_seconds() as f64 / 3600.0;

        let event = ExitEvent {
            position_id: position.position_id.clone(),
            token_id: position.token_id.clone(),
            condition_id: position.condition_id.clone(),
            exit_type: exit_type.to_string(),
            entry_price: position.entry_price,
            exit_price,
            size: position.size,
            gross_pnl: pnl,
            net_pnl: pnl,
            hours_held,
            exit_order_id: position.exit_order_id.clone(),
            status: "executed".to_string(),
            reason: reason.to_string(),
            created_at: now,
        };

        self.store.insert_exit_event(&event).await?;
        self.store
            .close_position(position_id, 0.0, 0.0, position.realized_pnl + pnl)
            .await?;
        self.token_positions.write().remove(&position.token_id);

        info!(position_id, exit_price, pnl, reason, "closed position");
        Ok(Some(event))
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>> {
        self.store.open_positions().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderStatus;

    fn buy_order(token_id: &str, filled: f64, avg_price: f64) -> Order {
        Order {
            order_id: "O1".into(),
            token_id: token_id.into(),
            condition_id: "C1".into(),
            side: Side::Buy,
            limit_price: avg_price,
            size: filled,
            status: OrderStatus::Filled,
            filled_size: filled,
            avg_fill_price: Some(avg_price),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn first_fill_creates_position() {
        let store = Arc::new(Store::new(":memory:").unwrap());
        let tracker = PositionTracker::new(store);
        let order = buy_order("T1", 20.0, 0.96);
        let position = tracker.record_fill_delta(&order, 20.0, 0.96).await.unwrap().unwrap();
        assert_eq!(position.size, 20.0);
        assert_eq!(position.entry_price, 0.96);
    }

    #[tokio::test]
    async fn second_buy_fill_computes_weighted_average() {
        let store = Arc::new(Store::new(":memory:").unwrap());
        let tracker = PositionTracker::new(store);
        tracker.record_fill_delta(&buy_order("T1", 10.0, 0.90), 10.0, 0.90).await.unwrap();
        let position = tracker
            .record_fill_delta(&buy_order("T1", 10.0, 0.98), 10.0, 0.98)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.size, 20.0);
        assert!((position.entry_price - 0.94).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sell_fill_closes_position_when_fully_reduced() {
        let store = Arc::new(Store::new(":memory:").unwrap());
        let tracker = PositionTracker::new(store);
        tracker.record_fill_delta(&buy_order("T1", 20.0, 0.90), 20.0, 0.90).await.unwrap();

        let mut sell = buy_order("T1", 20.0, 0.97);
        sell.side = Side::Sell;
        let position = tracker.record_fill_delta(&sell, 20.0, 0.97).await.unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert!(tracker.position_id_for_token("T1").is_none());
    }
}
