//! End-to-end scenario tests driving `TradingEngine::handle_event`
//! through the full pipeline: hazard filters, dedup, routing and
//! execution, backed by an in-memory store and a scriptable wire
//! adapter. Mirrors the concrete scenarios the hazard catalogue (G1,
//! G2, G5, G13) and the partial-fill accounting rules were written
//! against.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex as PlMutex;

use triggerbot_backend::balance::BalanceManager;
use triggerbot_backend::dedup::TriggerDeduplicator;
use triggerbot_backend::domain::{
    BookLevel, Market, Order, OrderStatus, Orderbook, Outcome, RawEvent, Side, Trade,
};
use triggerbot_backend::engine::{EngineConfig, TradingEngine};
use triggerbot_backend::exits::{ExitConfig, ExitManager};
use triggerbot_backend::execution::ExecutionFacade;
use triggerbot_backend::health::HealthMonitor;
use triggerbot_backend::orders::OrderManager;
use triggerbot_backend::positions::PositionTracker;
use triggerbot_backend::processor::EventProcessor;
use triggerbot_backend::store::Store;
use triggerbot_backend::strategy::{Signal, Strategy, StrategyContext, StrategyRegistry};
use triggerbot_backend::watchlist::WatchlistService;
use triggerbot_backend::wire::WireAdapter;

/// Always signals a fixed-size Entry at the context's trigger price, so
/// these tests exercise routing/execution rather than strategy scoring.
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
            reason: "scenario test".into(),
        }
    }
}

/// Scriptable wire adapter: orderbook, fill progression and G3 backfill
/// trades are each independently controllable per scenario.
struct ScriptedWire {
    bid: PlMutex<f64>,
    ask: PlMutex<f64>,
    backfill: PlMutex<Option<Trade>>,
    fill_steps: PlMutex<Vec<Order>>,
}

impl ScriptedWire {
    fn new(bid: f64, ask: f64) -> Arc<Self> {
        Arc::new(Self {
            bid: PlMutex::new(bid),
            ask: PlMutex::new(ask),
            backfill: PlMutex::new(None),
            fill_steps: PlMutex::new(Vec::new()),
        })
    }

    fn set_backfill(&self, trade: Trade) {
        *self.backfill.lock() = Some(trade);
    }

    /// Fill steps are consumed in order, one per `get_order` call; the
    /// last step repeats once the queue is drained.
    fn push_fill_step(&self, order: Order) {
        self.fill_steps.lock().push(order);
    }
}

#[async_trait]
impl WireAdapter for ScriptedWire {
    async fn fetch_orderbook(&self, token_id: &str) -> anyhow::Result<Orderbook> {
        Ok(Orderbook {
            token_id: token_id.to_string(),
            bids: vec![BookLevel { price: *self.bid.lock(), size: 100.0 }],
            asks: vec![BookLevel { price: *self.ask.lock(), size: 100.0 }],
            observed_at: Utc::now(),
        })
    }

    async fn fetch_trades(&self, token_id: &str, _max_age: i64) -> anyhow::Result<Vec<Trade>> {
        match self.backfill.lock().clone() {
            Some(mut t) => {
                t.token_id = token_id.to_string();
                Ok(vec![t])
            }
            None => Ok(vec![]),
        }
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
        let mut steps = self.fill_steps.lock();
        if steps.is_empty() {
            anyhow::bail!("no scripted fill step configured for {order_id}");
        }
        if steps.len() > 1 {
            Ok(steps.remove(0))
        } else {
            Ok(steps[0].clone())
        }
    }

    async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
}

fn order(order_id: &str, status: OrderStatus, filled_size: f64, avg_fill_price: Option<f64>) -> Order {
    Order {
        order_id: order_id.to_string(),
        token_id: "T1".into(),
        condition_id: "C1".into(),
        side: Side::Buy,
        limit_price: 0.95,
        size: 100.0,
        status,
        filled_size,
        avg_fill_price,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn market(condition_id: &str, token_id: &str, question: &str, hours_to_end: i64) -> Market {
    Market {
        condition_id: condition_id.to_string(),
        question: question.to_string(),
        category: None,
        end_time: Some(Utc::now() + chrono::Duration::hours(hours_to_end)),
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

struct Harness {
    engine: TradingEngine,
    execution: Arc<ExecutionFacade>,
}

fn build(wire: Arc<ScriptedWire>, verify_orderbook: bool, max_trade_age_seconds: i64) -> Harness {
    let wire: Arc<dyn WireAdapter> = wire;
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
        Duration::from_secs(5),
    ));

    let processor = Arc::new(EventProcessor::new(wire, max_trade_age_seconds, 0.05, verify_orderbook));
    let watchlist = Arc::new(WatchlistService::new(store));
    let health = HealthMonitor::new();

    let mut strategies = StrategyRegistry::new();
    strategies.register(Box::new(AlwaysEntry)).unwrap();

    let config = EngineConfig {
        price_threshold: 0.95,
        position_size: 20.0,
        max_positions: 50,
        min_time_to_end_hours: 1.0,
        blocked_categories: vec![],
        max_trade_age_seconds: max_trade_age_seconds as f64,
        verify_orderbook,
        max_price_deviation: 0.05,
        dry_run: false,
        strategy_name: "always_entry".to_string(),
    };

    let engine = TradingEngine::new(processor, execution.clone(), watchlist, health, strategies, config);
    Harness { engine, execution }
}

/// S1 — happy-path entry: a fresh price crossing threshold, with a
/// matching G3 backfill trade and an orderbook close to the trigger
/// price, opens exactly one position sized at the fill.
#[tokio::test]
async fn s1_happy_path_entry_opens_a_position() {
    let wire = ScriptedWire::new(0.955, 0.96);
    wire.set_backfill(Trade {
        id: "bf1".into(),
        token_id: "T1".into(),
        condition_id: None,
        price: 0.96,
        size: 100.0,
        side: Side::Buy,
        traded_at: Utc::now(),
    });
    wire.push_fill_step(order("O1", OrderStatus::Filled, 20.0, Some(0.96)));
    let h = build(wire, false, 300);
    h.engine.upsert_market(market("C1", "T1", "Will the incumbent win?", 48));

    h.engine.handle_event(price_event("T1", "C1", 0.96)).await;

    let positions = h.execution.open_positions_snapshot().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].size, 20.0);
    assert!((positions[0].entry_price - 0.96).abs() < 1e-9);
    assert!((positions[0].entry_cost - 19.2).abs() < 1e-9);
}

/// S2 — duplicate suppression: re-injecting the same trigger-crossing
/// event after an entry already landed must not open a second position.
#[tokio::test]
async fn s2_duplicate_events_are_suppressed() {
    let wire = ScriptedWire::new(0.955, 0.96);
    wire.set_backfill(Trade {
        id: "bf1".into(),
        token_id: "T1".into(),
        condition_id: None,
        price: 0.96,
        size: 100.0,
        side: Side::Buy,
        traded_at: Utc::now(),
    });
    wire.push_fill_step(order("O1", OrderStatus::Filled, 20.0, Some(0.96)));
    let h = build(wire, false, 300);
    h.engine.upsert_market(market("C1", "T1", "Will the incumbent win?", 48));

    for _ in 0..4 {
        h.engine.handle_event(price_event("T1", "C1", 0.96)).await;
    }

    assert_eq!(h.execution.open_positions_snapshot().await.unwrap().len(), 1);
}

/// S3 — G1 staleness: a trade older than `max_trade_age` never reaches
/// the strategy layer, so no trigger is claimed and no order submitted.
#[tokio::test]
async fn s3_stale_trade_is_rejected_before_strategy() {
    let wire = ScriptedWire::new(0.955, 0.96);
    let h = build(wire, false, 300);
    h.engine.upsert_market(market("C1", "T1", "Will the incumbent win?", 48));

    let stale_trade = Trade {
        id: "t1".into(),
        token_id: "T1".into(),
        condition_id: Some("C1".into()),
        price: 0.97,
        size: 100.0,
        side: Side::Buy,
        traded_at: Utc::now() - chrono::Duration::seconds(400),
    };
    h.engine.handle_event(RawEvent::Trade(stale_trade)).await;

    assert_eq!(h.execution.open_positions_snapshot().await.unwrap().len(), 0);
    assert!(h.execution.dedup().should_trigger("T1", "C1", 0.95).await.unwrap());
}

/// S4 — G5 divergence rejection: the strategy returns an Entry, but the
/// orderbook's best bid diverges too far from the trigger price, so
/// nothing is submitted and the trigger claim is never made.
#[tokio::test]
async fn s4_orderbook_divergence_blocks_entry() {
    let wire = ScriptedWire::new(0.80, 0.81);
    let h = build(wire, true, 300);
    h.engine.upsert_market(market("C1", "T1", "Will the incumbent win?", 48));

    h.engine.handle_event(price_event("T1", "C1", 0.97)).await;

    assert_eq!(h.execution.open_positions_snapshot().await.unwrap().len(), 0);
    // No order was submitted, so the trigger was never claimed and a
    // corrected later price can still enter.
    assert!(h.execution.dedup().should_trigger("T1", "C1", 0.95).await.unwrap());
}

/// S5 — exit with liquidity guard: a wide spread trips G13 and blocks
/// the SELL even though price-based exit criteria are met.
#[tokio::test]
async fn s5_exit_liquidity_guard_blocks_sell_into_illiquid_book() {
    let wire = ScriptedWire::new(0.001, 0.999);
    let store = Arc::new(Store::new(":memory:").unwrap());
    let wire_dyn: Arc<dyn WireAdapter> = wire;
    let balance = Arc::new(BalanceManager::new(wire_dyn.clone(), 0.0));
    let orders = Arc::new(OrderManager::new(wire_dyn.clone(), store.clone(), balance.clone(), 1.0));
    let positions = Arc::new(PositionTracker::new(store));
    let exits = Arc::new(ExitManager::new(
        wire_dyn,
        orders,
        positions.clone(),
        balance,
        ExitConfig {
            profit_target: 0.99,
            stop_loss: 0.90,
            min_hold_days: 7.0,
            max_slippage_percent: 0.10,
            max_spread_percent: 0.20,
            min_exit_price_floor: 0.50,
        },
    ));

    let buy = order("O0", OrderStatus::Filled, 40.0, Some(0.915));
    let position = positions.record_fill_delta(&buy, 40.0, 0.915).await.unwrap().unwrap();

    let (completed, order_id) = exits
        .execute_exit(&position, 0.96, "profit_target", Duration::from_secs(5))
        .await
        .unwrap();

    assert!(!completed);
    assert!(order_id.is_none());
    let stored = positions.get_position(&position.position_id).await.unwrap().unwrap();
    assert_eq!(stored.status, triggerbot_backend::domain::PositionStatus::Open);
}

/// S6 — partial-fill accounting: two syncs (PARTIAL then FILLED) must
/// leave the position at the size-weighted average fill price, not the
/// limit price or the first fill's price.
#[tokio::test]
async fn s6_partial_fill_then_full_fill_produces_weighted_average() {
    let wire = ScriptedWire::new(0.955, 0.96);
    wire.push_fill_step(order("O1", OrderStatus::Partial, 40.0, Some(0.95)));
    wire.push_fill_step(order("O1", OrderStatus::Filled, 100.0, Some(0.953)));
    let h = build(wire, false, 300);

    let result = h
        .execution
        .execute_entry("T1", "C1", Side::Buy, 0.95, 100.0)
        .await;
    assert!(result.success);

    let positions = h.execution.open_positions_snapshot().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].size, 100.0);
    assert!((positions[0].entry_cost - 95.3).abs() < 1e-6);
    assert!((positions[0].entry_price - 0.953).abs() < 1e-6);
}
