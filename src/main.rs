//! Automated trading agent for a binary-outcome prediction market:
//! wires the ingestion stream, hazard filters, strategy dispatch,
//! execution facade and background reconciliation loops together, then
//! serves the read-only operator dashboard.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use triggerbot_backend::alerting::{Alert, AlertManager, AlertSeverity};
use triggerbot_backend::background::{
    self, BackgroundConfig,
};
use triggerbot_backend::balance::BalanceManager;
use triggerbot_backend::config::Config;
use triggerbot_backend::dashboard::{self, DashboardState};
use triggerbot_backend::dedup::TriggerDeduplicator;
use triggerbot_backend::domain::RawEvent;
use triggerbot_backend::engine::{EngineConfig, TradingEngine};
use triggerbot_backend::exits::{ExitConfig, ExitManager};
use triggerbot_backend::execution::ExecutionFacade;
use triggerbot_backend::health::HealthMonitor;
use triggerbot_backend::markets::MarketsClient;
use triggerbot_backend::orders::OrderManager;
use triggerbot_backend::positions::PositionTracker;
use triggerbot_backend::processor::EventProcessor;
use triggerbot_backend::reconcile::{HoldPolicy, PositionReconciler};
use triggerbot_backend::store::Store;
use triggerbot_backend::strategy::high_prob_yes::HighProbYesStrategy;
use triggerbot_backend::strategy::StrategyRegistry;
use triggerbot_backend::watchlist::WatchlistService;
use triggerbot_backend::wire::clob::{ClobCredentials, ClobWireAdapter};
use triggerbot_backend::wire::stream::StreamClient;
use triggerbot_backend::wire::WireAdapter;

const CLOB_BASE_URL: &str = "https://clob.polymarket.com";
const HEALTH_ALERT_INTERVAL: Duration = Duration::from_secs(60);

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "triggerbot_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(dry_run = config.dry_run, strategy = %config.strategy_name, "starting trading agent");

    let store = Arc::new(Store::new(&config.database_url).context("failed to open durable store")?);

    let credentials = ClobCredentials::from_env().context("failed to load CLOB credentials")?;
    let wire: Arc<dyn WireAdapter> = Arc::new(
        ClobWireAdapter::new(CLOB_BASE_URL, credentials).context("failed to build CLOB wire adapter")?,
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let balance = Arc::new(BalanceManager::new(wire.clone(), config.min_balance_reserve));
    let orders = Arc::new(OrderManager::new(
        wire.clone(),
        store.clone(),
        balance.clone(),
        config.profit_target,
    ));
    let positions = Arc::new(PositionTracker::new(store.clone()));
    let exits = Arc::new(ExitManager::new(
        wire.clone(),
        orders.clone(),
        positions.clone(),
        balance.clone(),
        ExitConfig {
            profit_target: config.profit_target,
            stop_loss: config.stop_loss,
            min_hold_days: config.min_hold_days,
            max_slippage_percent: config.max_slippage_percent,
            max_spread_percent: config.max_spread_percent,
            min_exit_price_floor: config.min_exit_price_floor,
        },
    ));
    let dedup = Arc::new(TriggerDeduplicator::new(store.clone()));
    let execution = Arc::new(ExecutionFacade::new(
        wire.clone(),
        balance,
        orders,
        positions.clone(),
        exits,
        dedup,
        Duration::from_secs(config.fill_timeout_seconds),
    ));

    execution.load_state().await.context("failed to load durable execution state")?;

    let processor = Arc::new(EventProcessor::new(
        wire.clone(),
        config.max_trade_age_seconds,
        config.max_price_deviation,
        config.verify_orderbook,
    ));
    let watchlist = Arc::new(WatchlistService::new(store.clone()));
    let health = HealthMonitor::new();
    let alerts = Arc::new(AlertManager::with_default_sink(config.alert_cooldown_seconds as i64));

    let mut strategies = StrategyRegistry::new();
    strategies
        .register(Box::new(HighProbYesStrategy::new(config.price_threshold, config.position_size)))
        .context("failed to register strategy")?;

    let engine = Arc::new(TradingEngine::new(
        processor,
        execution.clone(),
        watchlist.clone(),
        health.clone(),
        strategies,
        EngineConfig {
            price_threshold: config.price_threshold,
            position_size: config.position_size,
            max_positions: config.max_positions,
            min_time_to_end_hours: config.min_time_to_end_hours,
            blocked_categories: config.blocked_categories.clone(),
            max_trade_age_seconds: config.max_trade_age_seconds as f64,
            verify_orderbook: config.verify_orderbook,
            max_price_deviation: config.max_price_deviation,
            dry_run: config.dry_run,
            strategy_name: config.strategy_name.clone(),
        },
    ));

    let reconciler = Arc::new(PositionReconciler::new(
        config.data_api_base.clone(),
        store.clone(),
        positions,
        HoldPolicy::parse(&config.hold_policy),
        config.mature_days,
    )?);

    let markets_client = Arc::new(MarketsClient::new(config.markets_api_base.clone())?);
    match markets_client.fetch_all_active(50).await {
        Ok(found) => {
            let count = found.len();
            for market in found {
                engine.upsert_market(market);
            }
            info!(count, "initial market discovery complete");
        }
        Err(e) => warn!(error = %e, "initial market discovery failed, starting with an empty cache"),
    }

    let stream = StreamClient::spawn(
        stream_url(),
        Duration::from_secs(config.heartbeat_timeout_seconds),
        shutdown_tx.subscribe(),
    );

    let background_config = Arc::new(BackgroundConfig {
        dry_run: config.dry_run,
        order_sync_interval: Duration::from_secs(config.order_sync_interval_seconds),
        exit_eval_interval: Duration::from_secs(config.exit_eval_interval_seconds),
        watchlist_rescore_interval: Duration::from_secs_f64(config.watchlist_rescore_interval_hours * 3600.0),
        position_sync_interval: Duration::from_secs(config.position_sync_interval_seconds),
        full_position_sync_interval: Duration::from_secs(config.full_position_sync_interval_seconds),
        market_discovery_interval: Duration::from_secs(config.market_discovery_interval_seconds),
        wallet_address: config.wallet_address.clone(),
    });

    let _order_sync = background::spawn_order_sync(execution.clone(), background_config.clone(), shutdown_tx.subscribe());
    let _exit_eval = background::spawn_exit_evaluation(
        execution.clone(),
        wire.clone(),
        reconciler.clone(),
        background_config.clone(),
        shutdown_tx.subscribe(),
    );
    let _watchlist_rescore =
        background::spawn_watchlist_rescore(watchlist, background_config.clone(), shutdown_tx.subscribe());
    let _position_sync =
        background::spawn_position_sync(reconciler, background_config.clone(), shutdown_tx.subscribe());
    let _market_discovery = background::spawn_market_discovery(
        engine.clone(),
        markets_client,
        background_config,
        shutdown_tx.subscribe(),
    );
    let _health_alerts = spawn_health_alerts(store.clone(), health.clone(), alerts, shutdown_tx.subscribe());
    let _ingestion = spawn_ingestion(engine, stream, health.clone(), shutdown_tx.subscribe());

    let dashboard_state = Arc::new(DashboardState { store, health });
    let app = dashboard::router(dashboard_state, config.dashboard_api_key.clone());
    let addr = format!("{}:{}", config.dashboard_host, config.dashboard_port);
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind dashboard listener")?;
    info!(addr, "dashboard listening");

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "dashboard server exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    }

    Ok(())
}

fn stream_url() -> String {
    std::env::var("STREAM_URL").unwrap_or_else(|_| "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string())
}

/// Consumes the stream's bare `PriceUpdate`s, resolves each to its
/// condition via the engine's token cache, and feeds the engine.
/// Updates missing from the cache are dropped — the market discovery
/// loop backfills the cache on its own schedule.
fn spawn_ingestion(
    engine: Arc<TradingEngine>,
    stream: Arc<StreamClient>,
    health: Arc<HealthMonitor>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut prices = stream.subscribe_prices();
        loop {
            tokio::select! {
                update = prices.recv() => {
                    match update {
                        Ok(update) => {
                            health.note_stream_message();
                            let Some(condition_id) = engine.condition_for_token(&update.token_id) else {
                                continue;
                            };
                            engine
                                .handle_event(RawEvent::Price {
                                    token_id: update.token_id,
                                    condition_id: Some(condition_id),
                                    price: update.price,
                                    observed_at: update.observed_at,
                                })
                                .await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "ingestion lagged behind the price stream");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            error!("price stream closed unexpectedly");
                            return;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("ingestion loop shutting down");
                    return;
                }
            }
        }
    })
}

/// Periodically probes store reachability and turns health-monitor
/// state into deduplicated operator alerts: stream disconnection, store
/// unreachability, and an elevated error rate. Balance and
/// trade-execution alerts are raised inline where those events occur.
fn spawn_health_alerts(
    store: Arc<Store>,
    health: Arc<HealthMonitor>,
    alerts: Arc<AlertManager>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEALTH_ALERT_INTERVAL) => {}
                _ = shutdown.recv() => {
                    info!("health alert loop shutting down");
                    return;
                }
            }

            health.set_store_reachable(store.is_reachable().await);
            let snapshot = health.snapshot();
            if !snapshot.stream_connected {
                alerts.notify(Alert {
                    component: "stream".to_string(),
                    status: "disconnected".to_string(),
                    severity: AlertSeverity::Critical,
                    message: "price stream has not delivered a message recently".to_string(),
                });
            }
            if !snapshot.store_reachable {
                alerts.notify(Alert {
                    component: "store".to_string(),
                    status: "unreachable".to_string(),
                    severity: AlertSeverity::Critical,
                    message: "durable store health check failed".to_string(),
                });
            }
            if snapshot.errors_last_hour > 0 {
                alerts.notify(Alert {
                    component: "pipeline".to_string(),
                    status: "errors".to_string(),
                    severity: AlertSeverity::Warning,
                    message: format!("{} errors recorded in the last hour", snapshot.errors_last_hour),
                });
            }
        }
    })
}
