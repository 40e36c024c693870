//! Exit Manager: decides whether an open position should be exited
//! (hold policy, profit target, stop loss) and executes the exit with
//! G13 liquidity protection — the guard that exists because a position
//! worth ~$0.96 was once sold at $0.026 into an illiquid book.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::balance::BalanceManager;
use crate::domain::{AgeSource, ExitStatus, Position};
use crate::orders::OrderManager;
use crate::positions::PositionTracker;
use crate::wire::WireAdapter;

const CLAIMING_TIMEOUT_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct ExitConfig {
    pub profit_target: f64,
    pub stop_loss: f64,
    pub min_hold_days: f64,
    pub max_slippage_percent: f64,
    pub max_spread_percent: f64,
    pub min_exit_price_floor: f64,
}

/// Outcome of reconciling a pending (already-claimed) exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    None,
    Pending,
    Closed,
    Cleared,
}

pub struct ExitManager {
    wire: Arc<dyn WireAdapter>,
    orders: Arc<OrderManager>,
    positions: Arc<PositionTracker>,
    balance: Arc<BalanceManager>,
    config: ExitConfig,
}

impl ExitManager {
    pub fn new(
        wire: Arc<dyn WireAdapter>,
        orders: Arc<OrderManager>,
        positions: Arc<PositionTracker>,
        balance: Arc<BalanceManager>,
        config: ExitConfig,
    ) -> Self {
        Self {
            wire,
            orders,
            positions,
            balance,
            config,
        }
    }

    /// Which hold policy applies. Positions with an unrecorded
    /// (`age_source = unknown`) `hold_start_at` are always eligible for
    /// conditional exit — gating them on an untrustworthy timestamp
    /// would block profitable exits forever.
    pub fn strategy_for_position(&self, position: &Position) -> &'static str {
        if position.age_source != AgeSource::Actual {
            return "conditional_exit";
        }
        let hold_days = position.hold_age_days(Utc::now());
        if hold_days < self.config.min_hold_days {
            "hold_to_resolution"
        } else {
            "conditional_exit"
        }
    }

    pub fn evaluate_exit(&self, position: &Position, current_price: f64) -> Option<&'static str> {
        match self.strategy_for_position(position) {
            "hold_to_resolution" => None,
            _ => {
                if current_price >= self.config.profit_target {
                    Some("profit_target")
                } else if current_price <= self.config.stop_loss {
                    Some("stop_loss")
                } else {
                    None
                }
            }
        }
    }

    /// G13: verifies the orderbook has bids, spread is acceptable, the
    /// best bid clears the entry-price floor, and slippage from the
    /// expected exit price is within tolerance. Returns the best bid to
    /// actually use as the limit price.
    pub async fn verify_exit_liquidity(
        &self,
        position: &Position,
        expected_price: f64,
    ) -> Result<(bool, String, Option<f64>)> {
        let orderbook = self.wire.fetch_orderbook(&position.token_id).await?;

        let Some(best_bid) = orderbook.best_bid() else {
            return Ok((false, "G13: no bids in orderbook".to_string(), None));
        };

        if let Some(best_ask) = orderbook.best_ask() {
            let spread_percent = if best_ask > 0.0 {
                (best_ask - best_bid) / best_ask
            } else {
                1.0
            };
            if spread_percent > self.config.max_spread_percent {
                return Ok((
                    false,
                    format!(
                        "G13: spread too wide ({spread_percent:.1%}), bid={best_bid} ask={best_ask}"
                    ),
                    None,
                ));
            }
        }

        let min_price_floor = position.entry_price * self.config.min_exit_price_floor;
        if best_bid < min_price_floor {
            return Ok((
                false,
                format!("G13: best bid {best_bid} below floor {min_price_floor}"),
                None,
            ));
        }

        if expected_price > 0.0 {
            let slippage = (expected_price - best_bid) / expected_price;
            if slippage > self.config.max_slippage_percent {
                return Ok((
                    false,
                    format!(
                        "G13: slippage too high ({slippage:.1%}), expected {expected_price} best_bid {best_bid}"
                    ),
                    None,
                ));
            }
        }

        Ok((true, "liquidity_verified".to_string(), Some(best_bid)))
    }

    fn has_pending_exit(position: &Position) -> bool {
        position.exit_pending
    }

    /// Atomically claims the exit slot, verifies liquidity, submits the
    /// SELL order, waits for fill, then closes the position. Every
    /// failure path clears the claim so the next evaluation can retry.
    pub async fn execute_exit(
        &self,
        position: &Position,
        current_price: f64,
        reason: &str,
        fill_timeout: Duration,
    ) -> Result<(bool, Option<String>)> {
        if Self::has_pending_exit(position) {
            let outcome = self.reconcile_pending_exit(position, Some(current_price), reason, fill_timeout.as_secs() as i64).await?;
            match outcome {
                ReconcileOutcome::Pending => {
                    info!(position_id = %position.position_id, "exit already pending, skipping");
                    return Ok((false, position.exit_order_id.clone()));
                }
                ReconcileOutcome::Closed => return Ok((true, position.exit_order_id.clone())),
                ReconcileOutcome::Cleared | ReconcileOutcome::None => {}
            }
        }

        let claimed = self.positions.try_claim_exit(&position.position_id).await?;
        if !claimed {
            info!(position_id = %position.position_id, "exit already claimed elsewhere");
            return Ok((false, None));
        }

        let (is_safe, safety_reason, safe_price) =
            self.verify_exit_liquidity(position, current_price).await?;
        if !is_safe {
            warn!(position_id = %position.position_id, reason = %safety_reason, "G13 exit blocked");
            self.positions
                .clear_exit_pending(&position.position_id, ExitStatus::LiquidityBlocked)
                .await?;
            return Ok((false, None));
        }
        let actual_exit_price = safe_price.unwrap_or(current_price);

        let order_id = match self
            .orders
            .submit_order(
                &position.token_id,
                &position.condition_id,
                crate::domain::Side::Sell,
                actual_exit_price,
                position.size,
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(position_id = %position.position_id, error = %e, "exit order submission failed");
                self.positions
                    .clear_exit_pending(&position.position_id, ExitStatus::Failed)
                    .await?;
                return Ok((false, None));
            }
        };

        self.positions
            .mark_exit_pending(&position.position_id, &order_id)
            .await?;

        if !self.wait_for_order_fill(&order_id, fill_timeout).await? {
            warn!(position_id = %position.position_id, order_id, "exit order not confirmed within timeout");
            self.positions
                .clear_exit_pending(&position.position_id, ExitStatus::Timeout)
                .await?;
            return Ok((false, Some(order_id)));
        }

        self.positions
            .close_position(&position.position_id, actual_exit_price, reason, reason)
            .await?;
        self.balance.refresh_balance().await?;

        info!(position_id = %position.position_id, actual_exit_price, reason, "executed exit");
        Ok((true, Some(order_id)))
    }

    async fn wait_for_order_fill(&self, order_id: &str, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            let order = self.wire.get_order(order_id).await?;
            if order.status.is_terminal() {
                return Ok(order.status == crate::domain::OrderStatus::Filled);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Reconciles a position that already has `exit_pending = true`
    /// (typically on startup, or when a concurrent caller claimed the
    /// exit slot). Handles the "stuck claiming" case separately from a
    /// live exit order.
    pub async fn reconcile_pending_exit(
        &self,
        position: &Position,
        current_price: Option<f64>,
        reason: &str,
        stale_after_seconds: i64,
    ) -> Result<ReconcileOutcome> {
        if !Self::has_pending_exit(position) {
            return Ok(ReconcileOutcome::None);
        }

        let Some(order_id) = position.exit_order_id.clone() else {
            if position.exit_status == Some(ExitStatus::Claiming) {
                // `claimed_at` is the claim's own timestamp, not the
                // position's entry time — a position past its
                // min-hold-days is always "stale" by that measure, which
                // would let any concurrent caller immediately steal a
                // claim taken a moment ago.
                let Some(claimed_at) = position.claimed_at else {
                    warn!(position_id = %position.position_id, "claiming with no claimed_at recorded, clearing");
                    self.positions
                        .clear_exit_pending(&position.position_id, ExitStatus::StaleClaim)
                        .await?;
                    return Ok(ReconcileOutcome::Cleared);
                };
                let stale_for = (Utc::now() - claimed_at).num_seconds();
                if stale_for > CLAIMING_TIMEOUT_SECONDS.max(stale_after_seconds) {
                    warn!(position_id = %position.position_id, "stuck in claiming state, clearing for retry");
                    self.positions
                        .clear_exit_pending(&position.position_id, ExitStatus::StaleClaim)
                        .await?;
                    return Ok(ReconcileOutcome::Cleared);
                }
                return Ok(ReconcileOutcome::Pending);
            }
            warn!(position_id = %position.position_id, "exit_pending set without order_id, clearing");
            self.positions
                .clear_exit_pending(&position.position_id, ExitStatus::Cleared)
                .await?;
            return Ok(ReconcileOutcome::Cleared);
        };

        let order = self.wire.get_order(&order_id).await?;

        if order.status == crate::domain::OrderStatus::Filled {
            let exit_price = order.avg_fill_price.unwrap_or(current_price.unwrap_or(position.entry_price));
            self.positions
                .close_position(&position.position_id, exit_price, reason, reason)
                .await?;
            return Ok(ReconcileOutcome::Closed);
        }

        if order.status.is_terminal() {
            warn!(position_id = %position.position_id, order_id, "exit order reached terminal non-fill status");
            self.positions
                .clear_exit_pending(&position.position_id, ExitStatus::Failed)
                .await?;
            return Ok(ReconcileOutcome::Cleared);
        }

        let age_seconds = (Utc::now() - order.created_at).num_seconds();
        if age_seconds > stale_after_seconds {
            if self.orders.cancel_order(&order_id).await.unwrap_or(false) {
                warn!(position_id = %position.position_id, order_id, age_seconds, "cancelled stale exit order");
                self.positions
                    .clear_exit_pending(&position.position_id, ExitStatus::Cancelled)
                    .await?;
                return Ok(ReconcileOutcome::Cleared);
            }
        }

        Ok(ReconcileOutcome::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PositionStatus;

    fn config() -> ExitConfig {
        ExitConfig {
            profit_target: 0.99,
            stop_loss: 0.90,
            min_hold_days: 7.0,
            max_slippage_percent: 0.10,
            max_spread_percent: 0.20,
            min_exit_price_floor: 0.50,
        }
    }

    fn position(age_source: AgeSource, hold_start_at: chrono::DateTime<Utc>) -> Position {
        Position {
            position_id: "P1".into(),
            token_id: "T1".into(),
            condition_id: "C1".into(),
            outcome: None,
            outcome_index: None,
            size: 20.0,
            entry_price: 0.90,
            entry_cost: 18.0,
            entry_time: hold_start_at,
            status: PositionStatus::Open,
            realized_pnl: 0.0,
            exit_pending: false,
            exit_status: None,
            exit_order_id: None,
            hold_start_at,
            age_source,
            import_source: None,
            entry_order_id: None,
            description: None,
            claimed_at: None,
            cost_basis_unknown: false,
        }
    }

    fn dummy_manager() -> ExitManager {
        use crate::domain::{BookLevel, Order, OrderStatus, Orderbook, Side, Trade};
        use async_trait::async_trait;

        struct FakeWire;
        #[async_trait]
        impl WireAdapter for FakeWire {
            async fn fetch_orderbook(&self, token_id: &str) -> Result<Orderbook> {
                Ok(Orderbook {
                    token_id: token_id.to_string(),
                    bids: vec![BookLevel { price: 0.95, size: 100.0 }],
                    asks: vec![BookLevel { price: 0.96, size: 100.0 }],
                    observed_at: Utc::now(),
                })
            }
            async fn fetch_trades(&self, _t: &str, _m: i64) -> Result<Vec<Trade>> {
                Ok(vec![])
            }
            async fn fetch_balance(&self) -> Result<f64> {
                Ok(1000.0)
            }
            async fn submit_order(
                &self,
                _t: &str,
                _c: &str,
                _s: Side,
                _p: f64,
                _sz: f64,
            ) -> Result<String> {
                Ok("O1".into())
            }
            async fn get_order(&self, order_id: &str) -> Result<Order> {
                Ok(Order {
                    order_id: order_id.to_string(),
                    token_id: "T1".into(),
                    condition_id: "C1".into(),
                    side: Side::Sell,
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

        let wire = Arc::new(FakeWire);
        let store = Arc::new(crate::store::Store::new(":memory:").unwrap());
        let balance = Arc::new(BalanceManager::new(wire.clone(), 0.0));
        let orders = Arc::new(OrderManager::new(wire.clone(), store.clone(), balance.clone(), 1.0));
        let positions = Arc::new(PositionTracker::new(store));
        ExitManager::new(wire, orders, positions, balance, config())
    }

    #[test]
    fn short_hold_with_known_age_holds_to_resolution() {
        let mgr = dummy_manager();
        let pos = position(AgeSource::Actual, Utc::now());
        assert_eq!(mgr.strategy_for_position(&pos), "hold_to_resolution");
        assert!(mgr.evaluate_exit(&pos, 0.995).is_none());
    }

    #[test]
    fn unknown_age_is_always_eligible_for_conditional_exit() {
        let mgr = dummy_manager();
        let pos = position(AgeSource::Unknown, Utc::now());
        assert_eq!(mgr.strategy_for_position(&pos), "conditional_exit");
        assert_eq!(mgr.evaluate_exit(&pos, 0.995), Some("profit_target"));
    }

    #[test]
    fn long_hold_applies_profit_target_and_stop_loss() {
        let mgr = dummy_manager();
        let old = Utc::now() - chrono::Duration::days(10);
        let pos = position(AgeSource::Actual, old);
        assert_eq!(mgr.evaluate_exit(&pos, 0.995), Some("profit_target"));
        assert_eq!(mgr.evaluate_exit(&pos, 0.85), Some("stop_loss"));
        assert_eq!(mgr.evaluate_exit(&pos, 0.94), None);
    }

    #[tokio::test]
    async fn g13_blocks_exit_below_price_floor() {
        let mgr = dummy_manager();
        let mut pos = position(AgeSource::Actual, Utc::now() - chrono::Duration::days(10));
        pos.entry_price = 2.0; // floor = 2.0 * 0.5 = 1.0, above best_bid 0.95
        let (safe, _, _) = mgr.verify_exit_liquidity(&pos, 0.95).await.unwrap();
        assert!(!safe);
    }

    #[tokio::test]
    async fn a_fresh_claim_on_an_old_position_is_not_cleared() {
        let mgr = dummy_manager();
        // hold_start_at is 10 days old (past min_hold_days), but the
        // claim itself was just taken — it must survive reconciliation.
        let mut pos = position(AgeSource::Actual, Utc::now() - chrono::Duration::days(10));
        pos.exit_pending = true;
        pos.exit_status = Some(ExitStatus::Claiming);
        pos.exit_order_id = None;
        pos.claimed_at = Some(Utc::now());

        let outcome = mgr.reconcile_pending_exit(&pos, Some(0.95), "profit_target", 300).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Pending);
    }

    #[tokio::test]
    async fn a_claim_older_than_the_timeout_is_cleared() {
        let mgr = dummy_manager();
        let mut pos = position(AgeSource::Actual, Utc::now());
        pos.exit_pending = true;
        pos.exit_status = Some(ExitStatus::Claiming);
        pos.exit_order_id = None;
        pos.claimed_at = Some(Utc::now() - chrono::Duration::seconds(CLAIMING_TIMEOUT_SECONDS + 30));

        let outcome = mgr.reconcile_pending_exit(&pos, Some(0.95), "profit_target", 10).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Cleared);
    }
}
