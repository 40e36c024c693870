//! Supervised Background Loops: order sync, exit evaluation, watchlist
//! rescore and position sync, each independently scheduled and racing
//! a shared shutdown signal. A timeout branch means "do the work"; a
//! completed shutdown receive means "exit cleanly".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::engine::TradingEngine;
use crate::execution::ExecutionFacade;
use crate::markets::MarketsClient;
use crate::reconcile::PositionReconciler;
use crate::watchlist::WatchlistService;
use crate::wire::WireAdapter;

const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct BackgroundConfig {
    pub dry_run: bool,
    pub order_sync_interval: Duration,
    pub exit_eval_interval: Duration,
    pub watchlist_rescore_interval: Duration,
    pub position_sync_interval: Duration,
    pub full_position_sync_interval: Duration,
    pub market_discovery_interval: Duration,
    pub wallet_address: Option<String>,
}

/// Races one iteration's work against a shutdown signal. Returns
/// `false` once the loop should stop.
async fn tick(interval: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        _ = shutdown.recv() => false,
    }
}

pub fn spawn_order_sync(
    execution: Arc<ExecutionFacade>,
    config: Arc<BackgroundConfig>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if config.dry_run {
            info!("order sync loop disabled in dry-run mode");
            return;
        }
        loop {
            if !tick(config.order_sync_interval, &mut shutdown).await {
                info!("order sync loop shutting down");
                return;
            }
            let synced = execution.sync_open_orders().await;
            info!(synced, "order sync tick complete");
        }
    })
}

pub fn spawn_exit_evaluation(
    execution: Arc<ExecutionFacade>,
    wire: Arc<dyn WireAdapter>,
    reconciler: Arc<PositionReconciler>,
    config: Arc<BackgroundConfig>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if !tick(config.exit_eval_interval, &mut shutdown).await {
                info!("exit evaluation loop shutting down");
                return;
            }

            // Quick-sync first so externally-partially-sold positions
            // don't spuriously look under-reserved before evaluation.
            if let Some(wallet) = &config.wallet_address {
                if let Err(e) = reconciler.quick_sync(wallet).await {
                    warn!(error = %e, "exit-eval quick sync failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            }

            let positions = match execution.open_position_count().await {
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "failed to read open positions before exit evaluation");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };
            let _ = positions;

            let mut prices: HashMap<String, f64> = HashMap::new();
            // Tokens to price are whatever the facade currently tracks;
            // the wire adapter is queried per-token on demand below.
            match collect_current_prices(&execution, wire.as_ref(), &mut prices).await {
                Ok(()) => {}
                Err(e) => {
                    error!(error = %e, "failed to fetch current prices for exit evaluation");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            }

            match execution.evaluate_exits(&prices).await {
                Ok(due) => {
                    for (position, reason) in due {
                        let price = prices.get(&position.token_id).copied().unwrap_or(position.entry_price);
                        let result = execution.execute_exit(&position, price, reason).await;
                        if !result.success {
                            warn!(position_id = %position.position_id, reason, "exit not completed this tick");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "exit evaluation failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    })
}

async fn collect_current_prices(
    execution: &ExecutionFacade,
    wire: &(dyn WireAdapter),
    out: &mut HashMap<String, f64>,
) -> anyhow::Result<()> {
    for position in execution.open_positions_snapshot().await? {
        if let Ok(book) = wire.fetch_orderbook(&position.token_id).await {
            if let Some(bid) = book.best_bid() {
                out.insert(position.token_id.clone(), bid);
            }
        }
    }
    Ok(())
}

pub fn spawn_watchlist_rescore(
    watchlist: Arc<WatchlistService>,
    config: Arc<BackgroundConfig>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if !tick(config.watchlist_rescore_interval, &mut shutdown).await {
                info!("watchlist rescore loop shutting down");
                return;
            }
            match watchlist.rescore_all(None).await {
                Ok(promotions) => {
                    for p in &promotions {
                        info!(token_id = %p.token_id, score = p.score, "watchlist entry promoted");
                    }
                }
                Err(e) => {
                    error!(error = %e, "watchlist rescore failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    })
}

/// Keeps the engine's token->condition cache warm: a single-writer,
/// many-reader cache whose writes happen at startup and on this
/// periodic full re-fetch.
pub fn spawn_market_discovery(
    engine: Arc<TradingEngine>,
    markets: Arc<MarketsClient>,
    config: Arc<BackgroundConfig>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if !tick(config.market_discovery_interval, &mut shutdown).await {
                info!("market discovery loop shutting down");
                return;
            }
            match markets.fetch_all_active(50).await {
                Ok(found) => {
                    let count = found.len();
                    for market in found {
                        engine.upsert_market(market);
                    }
                    info!(count, "market discovery tick complete");
                }
                Err(e) => {
                    error!(error = %e, "market discovery failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    })
}

pub fn spawn_position_sync(
    reconciler: Arc<PositionReconciler>,
    config: Arc<BackgroundConfig>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(wallet) = config.wallet_address.clone() else {
            info!("position sync loop disabled: no wallet_address configured");
            return;
        };
        let mut since_full = Duration::ZERO;

        loop {
            if !tick(config.position_sync_interval, &mut shutdown).await {
                info!("position sync loop shutting down");
                return;
            }
            since_full += config.position_sync_interval;

            let result = if since_full >= config.full_position_sync_interval {
                since_full = Duration::ZERO;
                reconciler.full_sync(&wallet).await
            } else {
                reconciler.quick_sync(&wallet).await
            };

            match result {
                Ok(summary) => info!(
                    found = summary.found,
                    imported = summary.imported,
                    updated = summary.updated,
                    closed = summary.closed,
                    "position sync tick complete"
                ),
                Err(e) => {
                    error!(error = %e, "position sync failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    })
}
