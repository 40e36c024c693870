//! Order Manager: submits orders to the wire adapter with pre-submit
//! price/balance validation, keeps an in-memory cache synchronized
//! with the durable store, and syncs fill status with G4-protected
//! balance bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::balance::BalanceManager;
use crate::domain::{Order, OrderStatus, Side};
use crate::errors::PriceTooHigh;
use crate::store::Store;
use crate::wire::WireAdapter;

pub struct OrderManager {
    wire: Arc<dyn WireAdapter>,
    store: Arc<Store>,
    balance: Arc<BalanceManager>,
    max_buy_price: f64,
    orders: RwLock<HashMap<String, Order>>,
}

impl OrderManager {
    pub fn new(
        wire: Arc<dyn WireAdapter>,
        store: Arc<Store>,
        balance: Arc<BalanceManager>,
        max_buy_price: f64,
    ) -> Self {
        Self {
            wire,
            store,
            balance,
            max_buy_price,
            orders: RwLock::new(HashMap::new()),
        }
    }

    pub async fn submit_order(
        &self,
        token_id: &str,
        condition_id: &str,
        side: Side,
        price: f64,
        size: f64,
    ) -> Result<String> {
        if side == Side::Buy && price > self.max_buy_price {
            anyhow::bail!(PriceTooHigh {
                price,
                max_price: self.max_buy_price,
            });
        }

        let cost = price * size;
        let temp_reservation_id = format!("pending_{token_id}_{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        if side == Side::Buy {
            self.balance.reserve(cost, &temp_reservation_id).await?;
        }

        let submit_result = self
            .wire
            .submit_order(token_id, condition_id, side, price, size)
            .await;

        let order_id = match submit_result {
            Ok(id) => id,
            Err(e) => {
                if side == Side::Buy {
                    self.balance.release_reservation(&temp_reservation_id).await;
                }
                return Err(e);
            }
        };

        let now = Utc::now();
        let order = Order {
            order_id: order_id.clone(),
            token_id: token_id.to_string(),
            condition_id: condition_id.to_string(),
            side,
            limit_price: price,
            size,
            status: OrderStatus::Pending,
            filled_size: 0.0,
            avg_fill_price: None,
            created_at: now,
            updated_at: now,
        };

        self.store.upsert_order(&order).await?;
        self.orders.write().insert(order_id.clone(), order);

        if side == Side::Buy {
            self.balance.release_reservation(&temp_reservation_id).await;
            self.balance.reserve(cost, &order_id).await?;
        }

        info!(order_id, token_id, price, size, side = side.as_str(), "submitted order");
        Ok(order_id)
    }

    /// Pulls current status from the wire, updates the local cache and
    /// durable store, and adjusts balance reservations. Handles every
    /// terminal status (FILLED/CANCELLED/FAILED) as well as PARTIAL.
    pub async fn sync_order_status(&self, order_id: &str) -> Result<Order> {
        let remote = self.wire.get_order(order_id).await?;

        let previous = self.orders.read().get(order_id).cloned();
        let previous_filled = previous.as_ref().map(|o| o.filled_size).unwrap_or(0.0);
        let previous_avg = previous.as_ref().and_then(|o| o.avg_fill_price);

        let mut updated = remote;
        updated.updated_at = Utc::now();

        self.store.upsert_order(&updated).await?;
        self.orders.write().insert(order_id.to_string(), updated.clone());

        match updated.status {
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed => {
                if updated.status == OrderStatus::Failed {
                    warn!(order_id, "order reached FAILED status");
                }
                self.balance.release_reservation(order_id).await;
                self.balance.refresh_balance().await?;
            }
            OrderStatus::Partial => {
                let new_filled = updated.filled_size - previous_filled;
                if new_filled > 0.0 {
                    let fill_price = updated.avg_fill_price.unwrap_or(updated.limit_price);
                    let filled_cost = match (updated.avg_fill_price, previous_avg) {
                        (Some(avg), Some(prev_avg)) => {
                            updated.filled_size * avg - previous_filled * prev_avg
                        }
                        _ => new_filled * fill_price,
                    };
                    if filled_cost > 0.0 {
                        self.balance
                            .adjust_reservation_for_partial_fill(order_id, filled_cost)
                            .await;
                    }
                }
                self.balance.refresh_balance().await?;
            }
            OrderStatus::Pending | OrderStatus::Live => {}
        }

        Ok(updated)
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        let cancelled = match self.wire.cancel_order(order_id).await {
            Ok(ok) => ok,
            Err(e) => {
                error!(order_id, error = %e, "failed to cancel order");
                return Ok(false);
            }
        };

        if cancelled {
            if let Some(mut order) = self.orders.read().get(order_id).cloned() {
                order.status = OrderStatus::Cancelled;
                order.updated_at = Utc::now();
                self.store.upsert_order(&order).await?;
                self.orders.write().insert(order_id.to_string(), order);
            }
            self.balance.release_reservation(order_id).await;
        }
        Ok(cancelled)
    }

    pub fn get_order(&self, order_id: &str) -> Option<Order> {
        self.orders.read().get(order_id).cloned()
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Restores the in-memory order cache (and balance reservations for
    /// unfilled BUY orders) from the durable store on startup.
    pub async fn load_orders(&self) -> Result<usize> {
        let open = self.store.open_orders().await?;
        let mut count = 0;
        for order in open {
            let unfilled = order.size - order.filled_size;
            if order.side == Side::Buy && unfilled > 0.0 {
                let reservation_amount = order.limit_price * unfilled;
                if let Err(e) = self.balance.reserve(reservation_amount, &order.order_id).await {
                    warn!(
                        order_id = %order.order_id,
                        error = %e,
                        "could not restore full reservation for loaded order"
                    );
                }
            }
            self.orders.write().insert(order.order_id.clone(), order);
            count += 1;
        }
        info!(count, "loaded open orders from durable store");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BookLevel, Orderbook, Trade};
    use async_trait::async_trait;

    struct FakeWire;

    #[async_trait]
    impl WireAdapter for FakeWire {
        async fn fetch_orderbook(&self, token_id: &str) -> Result<Orderbook> {
            Ok(Orderbook {
                token_id: token_id.to_string(),
                bids: vec![BookLevel { price: 0.9, size: 10.0 }],
                asks: vec![],
                observed_at: Utc::now(),
            })
        }
        async fn fetch_trades(&self, _token_id: &str, _max_age: i64) -> Result<Vec<Trade>> {
            Ok(vec![])
        }
        async fn fetch_balance(&self) -> Result<f64> {
            Ok(1000.0)
        }
        async fn submit_order(
            &self,
            _token_id: &str,
            _condition_id: &str,
            _side: Side,
            _price: f64,
            _size: f64,
        ) -> Result<String> {
            Ok("O1".to_string())
        }
        async fn get_order(&self, order_id: &str) -> Result<Order> {
            Ok(Order {
                order_id: order_id.to_string(),
                token_id: "T1".into(),
                condition_id: "C1".into(),
                side: Side::Buy,
                limit_price: 0.95,
                size: 20.0,
                status: OrderStatus::Filled,
                filled_size: 20.0,
                avg_fill_price: Some(0.95),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
        }
        async fn cancel_order(&self, _order_id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn manager() -> OrderManager {
        let wire = Arc::new(FakeWire);
        let store = Arc::new(Store::new(":memory:").unwrap());
        let balance = Arc::new(BalanceManager::new(wire.clone(), 0.0));
        OrderManager::new(wire, store, balance, 0.95)
    }

    #[tokio::test]
    async fn rejects_buy_above_max_price() {
        let mgr = manager();
        let result = mgr.submit_order("T1", "C1", Side::Buy, 0.99, 20.0).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn submit_then_sync_moves_to_filled_and_releases_reservation() {
        let mgr = manager();
        let order_id = mgr.submit_order("T1", "C1", Side::Buy, 0.95, 20.0).await.unwrap();
        assert!(mgr.balance.has_reservation(&order_id).await);

        let order = mgr.sync_order_status(&order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(!mgr.balance.has_reservation(&order_id).await);
    }
}
