//! Trading Engine: the per-event pipeline. Owns only the strategy
//! registry, the market metadata cache and routing — all
//! execution-layer state lives behind the Execution Facade so the two
//! components don't cyclically own each other.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::domain::{Market, RawEvent, RejectionStage, Side};
use crate::execution::ExecutionFacade;
use crate::health::{HealthMonitor, Metric};
use crate::processor::EventProcessor;
use crate::strategy::filters;
use crate::strategy::{Signal, StrategyContext, StrategyRegistry};
use crate::watchlist::WatchlistService;

pub struct EngineConfig {
    pub price_threshold: f64,
    pub position_size: f64,
    pub max_positions: usize,
    pub min_time_to_end_hours: f64,
    pub blocked_categories: Vec<String>,
    pub max_trade_age_seconds: f64,
    pub verify_orderbook: bool,
    pub max_price_deviation: f64,
    pub dry_run: bool,
    pub strategy_name: String,
}

pub struct TradingEngine {
    processor: Arc<EventProcessor>,
    execution: Arc<ExecutionFacade>,
    watchlist: Arc<WatchlistService>,
    health: Arc<HealthMonitor>,
    strategies: StrategyRegistry,
    markets: RwLock<HashMap<String, Market>>,
    token_conditions: RwLock<HashMap<String, String>>,
    config: EngineConfig,
}

impl TradingEngine {
    pub fn new(
        processor: Arc<EventProcessor>,
        execution: Arc<ExecutionFacade>,
        watchlist: Arc<WatchlistService>,
        health: Arc<HealthMonitor>,
        strategies: StrategyRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            processor,
            execution,
            watchlist,
            health,
            strategies,
            markets: RwLock::new(HashMap::new()),
            token_conditions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Populates (or refreshes) market metadata used to build
    /// `StrategyContext`. Called by the ingestion/catch-up layer at
    /// startup and whenever new markets are discovered.
    pub fn upsert_market(&self, market: Market) {
        let mut tokens = self.token_conditions.write();
        for outcome in &market.outcomes {
            tokens.insert(outcome.token_id.clone(), market.condition_id.clone());
        }
        drop(tokens);
        self.markets.write().insert(market.condition_id.clone(), market);
    }

    /// Resolves a bare `token_id` to its condition — used by the
    /// streaming ingestion loop, which only ever sees `asset_id`.
    pub fn condition_for_token(&self, token_id: &str) -> Option<String> {
        self.token_conditions.read().get(token_id).cloned()
    }

    fn market_for_condition(&self, condition_id: &str) -> Option<Market> {
        self.markets.read().get(condition_id).cloned()
    }

    pub async fn handle_event(&self, event: RawEvent) {
        self.health.record(Metric::EventsReceived);

        let Some(processed) = self.processor.process(event).await else {
            self.health.record(Metric::G1Filtered);
            return;
        };

        let Some(condition_id) = processed.condition_id.clone() else {
            warn!(token_id = %processed.token_id, "dropping event with no condition_id");
            return;
        };

        if processed.price < self.config.price_threshold {
            return;
        }

        match self
            .execution
            .dedup()
            .should_trigger(&processed.token_id, &condition_id, self.config.price_threshold)
            .await
        {
            Ok(false) => return,
            Err(e) => {
                error!(error = %e, "dedup pre-check failed");
                self.health.record(Metric::Errors);
                return;
            }
            Ok(true) => {}
        }

        let market = self.market_for_condition(&condition_id);
        let current_position = match self.execution.position_for_token(&processed.token_id).await {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to look up current position");
                self.health.record(Metric::Errors);
                None
            }
        };

        let time_to_end_hours = market
            .as_ref()
            .and_then(|m| m.end_time)
            .map(|end| (end - Utc::now()).num_seconds() as f64 / 3600.0)
            .unwrap_or(f64::MAX);

        let ctx = StrategyContext {
            condition_id: condition_id.clone(),
            token_id: processed.token_id.clone(),
            question: market.as_ref().map(|m| m.question.clone()).unwrap_or_default(),
            category: market.as_ref().and_then(|m| m.category.clone()),
            trigger_price: processed.price,
            trade_size: processed.trade_size,
            time_to_end_hours,
            trade_age_seconds: processed.trade_age_seconds.unwrap_or(0) as f64,
            model_score: None,
            current_position,
            outcome: None,
            outcome_index: None,
        };

        if let Some(ignore) = filters::run_all(
            &ctx,
            self.config.min_time_to_end_hours,
            &self.config.blocked_categories,
            self.config.max_trade_age_seconds,
        ) {
            self.record_ignore(&ignore);
            return;
        }

        let Some(strategy) = self.strategies.get(&self.config.strategy_name) else {
            error!(strategy = %self.config.strategy_name, "unregistered strategy");
            self.health.record(Metric::Errors);
            return;
        };

        let signal = strategy.evaluate(&ctx);
        self.route(signal, &ctx).await;
    }

    fn record_ignore(&self, signal: &Signal) {
        if let Signal::Ignore { filter_name, reason } = signal {
            info!(filter = %filter_name, reason, "rejected by hard filter");
        }
    }

    async fn route(&self, signal: Signal, ctx: &StrategyContext) {
        match signal {
            Signal::Entry { token_id, side, price, size, reason } => {
                self.route_entry(ctx, token_id, side, price, size, reason).await;
            }
            Signal::Exit { position_id, reason } => {
                self.route_exit(ctx, &position_id, &reason).await;
            }
            Signal::Watchlist { token_id, current_score, reason } => {
                info!(token_id, current_score, reason, "added to watchlist");
                if let Err(e) = self
                    .watchlist
                    .add(
                        &token_id,
                        &ctx.condition_id,
                        current_score,
                        ctx.time_to_end_hours,
                        Some(ctx.trigger_price),
                        Some(ctx.question.clone()),
                    )
                    .await
                {
                    error!(error = %e, "failed to add watchlist entry");
                }
            }
            Signal::Hold { .. } | Signal::Ignore { .. } => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn route_entry(
        &self,
        ctx: &StrategyContext,
        token_id: String,
        side: Side,
        price: f64,
        size: f64,
        reason: String,
    ) {
        if self.config.verify_orderbook {
            match self
                .execution
                .wire()
                .verify_price(&token_id, price, self.config.max_price_deviation)
                .await
            {
                Ok((false, _, detail)) => {
                    info!(token_id, ?detail, "entry rejected: {}", RejectionStage::G5Orderbook.as_str());
                    return;
                }
                Err(e) => {
                    error!(error = %e, "orderbook verification call failed");
                    self.health.record(Metric::Errors);
                    return;
                }
                Ok((true, _, _)) => {}
            }
        }

        match self.execution.open_position_count().await {
            Ok(count) if count >= self.config.max_positions => {
                info!(count, max = self.config.max_positions, "entry rejected: max_positions");
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to count open positions");
                self.health.record(Metric::Errors);
                return;
            }
            _ => {}
        }

        let claimed = match self
            .execution
            .dedup()
            .try_record_atomic(
                &token_id,
                &ctx.condition_id,
                self.config.price_threshold,
                price,
                ctx.trade_size,
                ctx.model_score,
                ctx.outcome.clone(),
                ctx.outcome_index,
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(error = %e, "trigger claim failed");
                self.health.record(Metric::Errors);
                return;
            }
        };
        if !claimed {
            return;
        }

        if self.config.dry_run {
            info!(token_id, price, size, reason, "dry-run entry, not submitted");
            return;
        }

        let result = self
            .execution
            .execute_entry(&token_id, &ctx.condition_id, side, price, size)
            .await;

        if !result.success {
            use crate::execution::ExecutionErrorType::*;
            match result.error_type {
                Some(PriceTooHigh) | Some(InsufficientBalance) | Some(ValidationError) => {
                    let _ = self
                        .execution
                        .dedup()
                        .remove(&token_id, &ctx.condition_id, self.config.price_threshold)
                        .await;
                    warn!(token_id, "entry pre-submit validation failed, trigger removed");
                }
                _ => {
                    error!(token_id, "entry submission ambiguous, trigger kept for manual review");
                    self.health.record(Metric::ManualReviewRequired);
                }
            }
        }
    }

    async fn route_exit(&self, ctx: &StrategyContext, position_id: &str, reason: &str) {
        let Some(position) = ctx.current_position.clone() else {
            warn!(position_id, "exit signal with no matching position in context");
            return;
        };
        let result = self.execution.execute_exit(&position, ctx.trigger_price, reason).await;
        if !result.success {
            warn!(position_id, reason, "exit execution did not complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::BalanceManager;
    use crate::dedup::TriggerDeduplicator;
    use crate::domain::{BookLevel, Market, Order, OrderStatus, Orderbook, Outcome, Trade};
    use crate::exits::{ExitConfig, ExitManager};
    use crate::orders::OrderManager;
    use crate::positions::PositionTracker;
    use crate::store::Store;
    use crate::strategy::Strategy;
    use crate::wire::WireAdapter;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    #[derive(Clone, Copy)]
    enum SubmitBehavior {
        Fill,
        PriceTooHigh,
        Ambiguous,
    }

    struct FakeWire {
        submit: PlMutex<SubmitBehavior>,
    }

    impl FakeWire {
        fn new(submit: SubmitBehavior) -> Arc<dyn WireAdapter> {
            Arc::new(Self {
                submit: PlMutex::new(submit),
            })
        }
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
        async fn fetch_trades(&self, token_id: &str, _m: i64) -> Result<Vec<Trade>> {
            // G3 backfill target: a same-priced trade large enough to
            // clear the trade_size hard filter for every event these
            // tests fire at 0.97.
            Ok(vec![Trade {
                id: "X1".into(),
                token_id: token_id.to_string(),
                condition_id: None,
                price: 0.97,
                size: 100.0,
                side: Side::Buy,
                traded_at: chrono::Utc::now(),
            }])
        }
        async fn fetch_balance(&self) -> Result<f64> {
            Ok(1000.0)
        }
        async fn submit_order(&self, _t: &str, _c: &str, _s: Side, _p: f64, _sz: f64) -> Result<String> {
            match *self.submit.lock() {
                SubmitBehavior::Fill => Ok("O1".into()),
                SubmitBehavior::PriceTooHigh => {
                    Err(crate::errors::PriceTooHigh { price: 0.99, max_price: 0.95 }.into())
                }
                SubmitBehavior::Ambiguous => Err(crate::errors::SubmissionAmbiguous("timeout after send".into()).into()),
            }
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
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            })
        }
        async fn cancel_order(&self, _order_id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    /// Always signals an entry at a fixed price, regardless of context.
    /// Used to drive `route_entry` paths through `handle_event` without
    /// depending on the model-score-gated strategy.
    struct AlwaysEntry;
    impl Strategy for AlwaysEntry {
        fn name(&self) -> &str {
            "always_entry"
        }
        fn evaluate(&self, ctx: &StrategyContext) -> Signal {
            Signal::Entry {
                token_id: ctx.token_id.clone(),
                side: Side::Buy,
                price: ctx.trigger_price,
                size: 20.0,
                reason: "test".into(),
            }
        }
    }

    struct Fixture {
        engine: TradingEngine,
        execution: Arc<ExecutionFacade>,
    }

    fn build(wire: Arc<dyn WireAdapter>, max_positions: usize, verify_orderbook: bool) -> Fixture {
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
        let dedup = Arc::new(TriggerDeduplicator::new(store.clone()));
        let execution = Arc::new(ExecutionFacade::new(
            wire.clone(),
            balance,
            orders,
            positions,
            exits,
            dedup,
            std::time::Duration::from_secs(5),
        ));

        let processor = Arc::new(EventProcessor::new(wire.clone(), 300, 0.05, false));
        let watchlist = Arc::new(WatchlistService::new(store));
        let health = HealthMonitor::new();

        let mut strategies = StrategyRegistry::new();
        strategies.register(Box::new(AlwaysEntry)).unwrap();

        let config = EngineConfig {
            price_threshold: 0.95,
            position_size: 20.0,
            max_positions,
            min_time_to_end_hours: 1.0,
            blocked_categories: vec![],
            max_trade_age_seconds: 300.0,
            verify_orderbook,
            max_price_deviation: 0.05,
            dry_run: false,
            strategy_name: "always_entry".to_string(),
        };

        let engine = TradingEngine::new(processor, execution.clone(), watchlist, health, strategies, config);
        Fixture { engine, execution }
    }

    fn market(condition_id: &str, token_id: &str, question: &str) -> Market {
        Market {
            condition_id: condition_id.to_string(),
            question: question.to_string(),
            category: None,
            end_time: Some(Utc::now() + chrono::Duration::hours(10)),
            outcomes: vec![Outcome {
                token_id: token_id.to_string(),
                outcome_label: "Yes".to_string(),
                outcome_index: 0,
            }],
        }
    }

    fn price_event(token_id: &str, condition_id: &str, price: f64) -> RawEvent {
        RawEvent::Price {
            token_id: token_id.to_string(),
            condition_id: Some(condition_id.to_string()),
            price,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn condition_for_token_resolves_after_upsert() {
        let fx = build(FakeWire::new(SubmitBehavior::Fill), 5, false);
        assert_eq!(fx.engine.condition_for_token("T1"), None);
        fx.engine.upsert_market(market("C1", "T1", "Will it rain tomorrow?"));
        assert_eq!(fx.engine.condition_for_token("T1"), Some("C1".to_string()));
    }

    #[tokio::test]
    async fn weather_question_is_rejected_before_strategy_runs() {
        let fx = build(FakeWire::new(SubmitBehavior::Fill), 5, false);
        fx.engine.upsert_market(market("C1", "T1", "Will it rain in NYC tomorrow?"));

        fx.engine.handle_event(price_event("T1", "C1", 0.97)).await;

        assert_eq!(fx.execution.open_position_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn non_weather_question_enters_a_position() {
        let fx = build(FakeWire::new(SubmitBehavior::Fill), 5, false);
        fx.engine.upsert_market(market("C1", "T1", "Will the incumbent win the election?"));

        fx.engine.handle_event(price_event("T1", "C1", 0.97)).await;

        assert_eq!(fx.execution.open_position_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn max_positions_cap_rejects_new_entry() {
        let fx = build(FakeWire::new(SubmitBehavior::Fill), 1, false);
        fx.engine.upsert_market(market("C1", "T1", "Will the incumbent win?"));
        fx.engine.upsert_market(market("C2", "T2", "Will the challenger win?"));

        fx.engine.handle_event(price_event("T1", "C1", 0.97)).await;
        assert_eq!(fx.execution.open_position_count().await.unwrap(), 1);

        // A second condition at the cap must be rejected before any order is submitted.
        fx.engine.handle_event(price_event("T2", "C2", 0.97)).await;
        assert_eq!(fx.execution.open_position_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn price_too_high_removes_trigger_and_allows_retry() {
        let fx = build(FakeWire::new(SubmitBehavior::PriceTooHigh), 5, false);
        fx.engine.upsert_market(market("C1", "T1", "Will the incumbent win?"));

        fx.engine.handle_event(price_event("T1", "C1", 0.97)).await;
        assert_eq!(fx.execution.open_position_count().await.unwrap(), 0);

        // The failed entry rolled back its trigger claim, so the same
        // condition can be retried on a later event.
        assert!(fx
            .execution
            .dedup()
            .should_trigger("T1", "C1", 0.95)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn ambiguous_submission_keeps_trigger_and_flags_manual_review() {
        let fx = build(FakeWire::new(SubmitBehavior::Ambiguous), 5, false);
        fx.engine.upsert_market(market("C1", "T1", "Will the incumbent win?"));

        fx.engine.handle_event(price_event("T1", "C1", 0.97)).await;
        assert_eq!(fx.execution.open_position_count().await.unwrap(), 0);

        // Trigger is kept: a retry on the same condition must be suppressed
        // until reconciliation resolves the ambiguous order.
        assert!(!fx
            .execution
            .dedup()
            .should_trigger("T1", "C1", 0.95)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn price_below_threshold_is_dropped_before_dedup() {
        let fx = build(FakeWire::new(SubmitBehavior::Fill), 5, false);
        fx.engine.upsert_market(market("C1", "T1", "Will the incumbent win?"));

        fx.engine.handle_event(price_event("T1", "C1", 0.50)).await;

        assert_eq!(fx.execution.open_position_count().await.unwrap(), 0);
        assert!(fx
            .execution
            .dedup()
            .should_trigger("T1", "C1", 0.95)
            .await
            .unwrap());
    }
}
