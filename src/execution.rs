//! Execution Facade: the single owner of every execution-layer
//! component (balance, orders, positions, exits, trigger dedup). The
//! Trading Engine never reaches past this facade into those components
//! directly — this breaks the cyclic-ownership hazard between engine
//! and execution state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::balance::BalanceManager;
use crate::dedup::TriggerDeduplicator;
use crate::domain::{Position, Side};
use crate::errors::{is_pre_submit_validation, is_submission_ambiguous};
use crate::exits::ExitManager;
use crate::orders::OrderManager;
use crate::positions::PositionTracker;
use crate::wire::WireAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorType {
    PriceTooHigh,
    InsufficientBalance,
    ValidationError,
    ExecutionError,
    FillTimeout,
    ExitError,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub position_id: Option<String>,
    pub error_type: Option<ExecutionErrorType>,
}

impl ExecutionResult {
    fn ok(order_id: Option<String>, position_id: Option<String>) -> Self {
        Self {
            success: true,
            order_id,
            position_id,
            error_type: None,
        }
    }

    fn err(error_type: ExecutionErrorType, order_id: Option<String>) -> Self {
        Self {
            success: false,
            order_id,
            position_id: None,
            error_type: Some(error_type),
        }
    }

    fn from_submit_error(e: &anyhow::Error) -> Self {
        if e.downcast_ref::<crate::errors::PriceTooHigh>().is_some() {
            Self::err(ExecutionErrorType::PriceTooHigh, None)
        } else if e.downcast_ref::<crate::errors::InsufficientBalance>().is_some() {
            Self::err(ExecutionErrorType::InsufficientBalance, None)
        } else if is_pre_submit_validation(e) {
            Self::err(ExecutionErrorType::ValidationError, None)
        } else if is_submission_ambiguous(e) {
            // An order may exist on the exchange. Reservation/trigger are kept
            // by the caller; this is surfaced for manual review, not retried.
            Self::err(ExecutionErrorType::ExecutionError, None)
        } else {
            Self::err(ExecutionErrorType::ExecutionError, None)
        }
    }
}

pub struct ExecutionFacade {
    wire: Arc<dyn WireAdapter>,
    balance: Arc<BalanceManager>,
    orders: Arc<OrderManager>,
    positions: Arc<PositionTracker>,
    exits: Arc<ExitManager>,
    dedup: Arc<TriggerDeduplicator>,
    fill_timeout: Duration,
}

impl ExecutionFacade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wire: Arc<dyn WireAdapter>,
        balance: Arc<BalanceManager>,
        orders: Arc<OrderManager>,
        positions: Arc<PositionTracker>,
        exits: Arc<ExitManager>,
        dedup: Arc<TriggerDeduplicator>,
        fill_timeout: Duration,
    ) -> Self {
        Self {
            wire,
            balance,
            orders,
            positions,
            exits,
            dedup,
            fill_timeout,
        }
    }

    pub fn dedup(&self) -> &TriggerDeduplicator {
        &self.dedup
    }

    pub fn wire(&self) -> &Arc<dyn WireAdapter> {
        &self.wire
    }

    pub async fn execute_entry(
        &self,
        token_id: &str,
        condition_id: &str,
        side: Side,
        price: f64,
        size: f64,
    ) -> ExecutionResult {
        let order_id = match self.orders.submit_order(token_id, condition_id, side, price, size).await {
            Ok(id) => id,
            Err(e) => return ExecutionResult::from_submit_error(&e),
        };

        match self.wait_for_entry_fill(&order_id).await {
            Ok(position_id) => ExecutionResult::ok(Some(order_id), position_id),
            Err(e) => {
                warn!(order_id, error = %e, "entry fill wait failed");
                ExecutionResult::err(ExecutionErrorType::FillTimeout, Some(order_id))
            }
        }
    }

    /// Polls the order to terminal status (or timeout), feeding every
    /// positive fill delta into the position tracker as it appears —
    /// mirrors the exit manager's fill-wait idiom, applied symmetrically
    /// to entries.
    async fn wait_for_entry_fill(&self, order_id: &str) -> Result<Option<String>> {
        let deadline = Instant::now() + self.fill_timeout;
        let mut last_filled = 0.0;
        let mut last_cost = 0.0;
        let mut position_id = None;

        loop {
            let order = self.orders.sync_order_status(order_id).await?;
            let delta = order.filled_size - last_filled;
            if delta > 0.0 {
                // The order reports a cumulative average fill price, not
                // a per-delta one; back out this delta's own price so
                // partial-fill cost accounting stays exact.
                let cumulative_cost = order.filled_size * order.avg_fill_price.unwrap_or(order.limit_price);
                let fill_price = (cumulative_cost - last_cost) / delta;
                if let Some(position) = self.positions.record_fill_delta(&order, delta, fill_price).await? {
                    last_filled = order.filled_size;
                    last_cost = cumulative_cost;
                    position_id = Some(position.position_id);
                }
            }

            if order.status.is_terminal() {
                return Ok(position_id);
            }
            if Instant::now() >= deadline {
                return Ok(position_id);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Drives partial-fill discovery across every tracked open order:
    /// for each, diff previous vs new `filled_size` and feed the delta
    /// only into the position tracker.
    pub async fn sync_open_orders(&self) -> usize {
        let mut synced = 0;
        for order in self.orders.open_orders() {
            let previous_filled = order.filled_size;
            let previous_cost = previous_filled * order.avg_fill_price.unwrap_or(order.limit_price);
            match self.orders.sync_order_status(&order.order_id).await {
                Ok(updated) => {
                    let delta = updated.filled_size - previous_filled;
                    if delta > 0.0 {
                        let cumulative_cost =
                            updated.filled_size * updated.avg_fill_price.unwrap_or(updated.limit_price);
                        let fill_price = (cumulative_cost - previous_cost) / delta;
                        if let Err(e) = self.positions.record_fill_delta(&updated, delta, fill_price).await {
                            error!(order_id = %order.order_id, error = %e, "failed to record fill delta during sync");
                        }
                    }
                    synced += 1;
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "failed to sync order status");
                }
            }
        }
        synced
    }

    pub async fn evaluate_exits(
        &self,
        current_prices: &HashMap<String, f64>,
    ) -> Result<Vec<(Position, &'static str)>> {
        let mut due = Vec::new();
        for position in self.positions.open_positions().await? {
            let Some(&price) = current_prices.get(&position.token_id) else {
                continue;
            };
            if let Some(reason) = self.exits.evaluate_exit(&position, price) {
                due.push((position, reason));
            }
        }
        Ok(due)
    }

    pub async fn execute_exit(
        &self,
        position: &Position,
        current_price: f64,
        reason: &str,
    ) -> ExecutionResult {
        match self
            .exits
            .execute_exit(position, current_price, reason, self.fill_timeout)
            .await
        {
            Ok((true, order_id)) => ExecutionResult::ok(order_id, Some(position.position_id.clone())),
            Ok((false, order_id)) => ExecutionResult::err(ExecutionErrorType::ExitError, order_id),
            Err(e) => {
                error!(position_id = %position.position_id, error = %e, "exit execution error");
                ExecutionResult::err(ExecutionErrorType::ExitError, None)
            }
        }
    }

    /// G4: a resolved market closes every open position on that token
    /// at the resolution price and force-refreshes balance.
    pub async fn handle_resolution(&self, token_id: &str, resolved_price: f64) -> Result<()> {
        if let Some(position) = self.positions.get_position_by_token(token_id).await? {
            self.positions
                .close_position(&position.position_id, resolved_price, "resolution", "market resolved")
                .await?;
            self.balance.refresh_balance().await?;
        }
        Ok(())
    }

    pub async fn load_state(&self) -> Result<()> {
        self.positions.load_positions().await?;
        self.orders.load_orders().await?;
        Ok(())
    }

    pub async fn open_position_count(&self) -> Result<usize> {
        Ok(self.positions.open_positions().await?.len())
    }

    pub async fn position_for_token(&self, token_id: &str) -> Result<Option<Position>> {
        self.positions.get_position_by_token(token_id).await
    }

    pub async fn open_positions_snapshot(&self) -> Result<Vec<Position>> {
        self.positions.open_positions().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BookLevel, Order, OrderStatus, Orderbook, Trade};
    use crate::exits::ExitConfig;
    use crate::store::Store;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeWire {
        fill_after: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl WireAdapter for FakeWire {
        async fn fetch_orderbook(&self, token_id: &str) -> Result<Orderbook> {
            Ok(Orderbook {
                token_id: token_id.to_string(),
                bids: vec![BookLevel { price: 0.95, size: 100.0 }],
                asks: vec![BookLevel { price: 0.96, size: 100.0 }],
                observed_at: chrono::Utc::now(),
            })
        }
        async fn fetch_trades(&self, _t: &str, _m: i64) -> Result<Vec<Trade>> {
            Ok(vec![])
        }
        async fn fetch_balance(&self) -> Result<f64> {
            Ok(1000.0)
        }
        async fn submit_order(&self, _t: &str, _c: &str, _s: Side, _p: f64, _sz: f64) -> Result<String> {
            Ok("O1".into())
        }
        async fn get_order(&self, order_id: &str) -> Result<Order> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let filled = n >= self.fill_after;
            Ok(Order {
                order_id: order_id.to_string(),
                token_id: "T1".into(),
                condition_id: "C1".into(),
                side: Side::Buy,
                limit_price: 0.95,
                size: 20.0,
                status: if filled { OrderStatus::Filled } else { OrderStatus::Live },
                filled_size: if filled { 20.0 } else { 0.0 },
                avg_fill_price: if filled { Some(0.95) } else { None },
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            })
        }
        async fn cancel_order(&self, _order_id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn facade(fill_after: u32) -> ExecutionFacade {
        let wire: Arc<dyn WireAdapter> = Arc::new(FakeWire {
            fill_after,
            calls: AtomicU32::new(0),
        });
        let store = Arc::new(Store::new(":memory:").unwrap());
        let balance = Arc::new(BalanceManager::new(wire.clone(), 0.0));
        let orders = Arc::new(OrderManager::new(wire.clone(), store.clone(), balance.clone(), 1.0));
        let positions = Arc::new(PositionTracker::new(store.clone()));
        let exits = Arc::new(ExitManager::new(
            wire.clone(),
            orders.clone(),
            positions.clone(),
            balance.clone(),
            ExitConfig {
                profit_target: 0.99,
                stop_loss: 0.90,
                min_hold_days: 7.0,
                max_slippage_percent: 0.10,
                max_spread_percent: 0.20,
                min_exit_price_floor: 0.50,
            },
        ));
        let dedup = Arc::new(TriggerDeduplicator::new(store));
        ExecutionFacade::new(wire, balance, orders, positions, exits, dedup, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn execute_entry_creates_position_on_immediate_fill() {
        let facade = facade(0);
        let result = facade.execute_entry("T1", "C1", Side::Buy, 0.95, 20.0).await;
        assert!(result.success);
        assert!(result.position_id.is_some());
    }

    #[tokio::test]
    async fn sync_open_orders_reports_zero_when_no_open_orders() {
        let facade = facade(0);
        assert_eq!(facade.sync_open_orders().await, 0);
    }
}
