//! Operator Dashboard: a read-only `axum` HTTP surface over the
//! durable store and health monitor. JSON-only — no template
//! rendering, so the untrusted-markup-interpolation concern does not
//! apply. Every route is wrapped by the shared request-logging
//! middleware and, when `DASHBOARD_API_KEY` is configured, the API-key
//! gate.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::sse::{Event, Sse},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{api_key_auth, ApiKeyState};
use crate::health::HealthMonitor;
use crate::middleware::request_logging_simple;
use crate::store::Store;

const DEFAULT_TRIGGER_LIMIT: i64 = 100;
const SSE_INTERVAL: Duration = Duration::from_secs(3);

pub struct DashboardState {
    pub store: Arc<Store>,
    pub health: Arc<HealthMonitor>,
}

#[derive(Debug, Deserialize)]
struct TriggerQuery {
    limit: Option<i64>,
}

async fn health_handler(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    Json(state.health.snapshot())
}

async fn positions_handler(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    match state.store.all_positions(500).await {
        Ok(positions) => Json(json!({ "positions": positions })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn orders_handler(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    match state.store.all_orders(500).await {
        Ok(orders) => Json(json!({ "orders": orders })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn watchlist_handler(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    match state.store.all_watchlist(500).await {
        Ok(entries) => Json(json!({ "watchlist": entries })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn triggers_handler(
    State(state): State<Arc<DashboardState>>,
    Query(q): Query<TriggerQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(DEFAULT_TRIGGER_LIMIT);
    match state.store.count_triggers(limit).await {
        Ok(triggers) => Json(json!({ "triggers": triggers })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn exits_handler(
    State(state): State<Arc<DashboardState>>,
    Query(q): Query<TriggerQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(DEFAULT_TRIGGER_LIMIT);
    match state.store.list_exit_events(limit).await {
        Ok(exits) => Json(json!({ "exits": exits })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn metrics_handler(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    let snapshot = state.health.snapshot();
    let open_positions = state.store.open_positions().await.map(|p| p.len()).unwrap_or(0);
    let open_orders = state.store.open_orders().await.map(|o| o.len()).unwrap_or(0);
    let pending_exits = state.store.pending_exits_count().await.unwrap_or(0);

    Json(json!({
        "counters_last_5m": snapshot.counters_last_5m,
        "errors_last_hour": snapshot.errors_last_hour,
        "open_positions": open_positions,
        "open_orders": open_orders,
        "pending_exits": pending_exits,
        "store_reachable": snapshot.store_reachable,
        "stream_connected": snapshot.stream_connected,
    }))
}

fn error_response(e: anyhow::Error) -> axum::response::Response {
    (
        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

async fn stream_handler(
    State(state): State<Arc<DashboardState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream::unfold(state, |state| async move {
        tokio::time::sleep(SSE_INTERVAL).await;
        let snapshot = state.health.snapshot();
        let event = Event::default().json_data(&snapshot).unwrap_or_else(|_| Event::default().data("{}"));
        Some((Ok(event), state))
    });

    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default())
}

pub fn router(state: Arc<DashboardState>, api_key: Option<String>) -> Router {
    let auth_state = Arc::new(ApiKeyState { api_key });

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/positions", get(positions_handler))
        .route("/api/orders", get(orders_handler))
        .route("/api/watchlist", get(watchlist_handler))
        .route("/api/triggers", get(triggers_handler))
        .route("/api/exits", get(exits_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/stream", get(stream_handler))
        .route_layer(axum::middleware::from_fn_with_state(auth_state, api_key_auth))
        .layer(axum::middleware::from_fn(request_logging_simple))
        .with_state(state)
}
