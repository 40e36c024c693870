//! Position Reconciliation: imports positions opened outside the bot
//! (manual trades, other tools) and detects positions closed
//! externally. Idempotent — safe to run on every tick.
//!
//! The remote data API is read-only market/portfolio data, a different
//! surface from the CLOB trading wire, so it gets its own small REST
//! client rather than living on `WireAdapter`.

use std::collections::HashMap;
use std::time::Duration;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{AgeSource, Position, PositionStatus};
use crate::positions::PositionTracker;
use crate::store::Store;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const SIZE_CHANGE_EPSILON: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldPolicy {
    New,
    Mature,
    Actual,
}

impl HoldPolicy {
    pub fn parse(s: &str) -> Self {
        match s {
            "mature" => HoldPolicy::Mature,
            "actual" => HoldPolicy::Actual,
            _ => HoldPolicy::New,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemotePosition {
    pub token_id: String,
    pub condition_id: String,
    pub size: f64,
    pub avg_price: f64,
    pub current_price: f64,
    pub outcome: Option<String>,
    pub outcome_index: Option<i64>,
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemotePositionWire {
    asset: Option<String>,
    #[serde(rename = "conditionId")]
    condition_id: Option<String>,
    size: Option<Value>,
    #[serde(rename = "avgPrice")]
    avg_price: Option<Value>,
    #[serde(rename = "curPrice")]
    cur_price: Option<Value>,
    outcome: Option<String>,
    #[serde(rename = "outcomeIndex")]
    outcome_index: Option<i64>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TradeWire {
    asset: Option<String>,
    side: Option<String>,
    timestamp: Option<Value>,
}

#[derive(Debug, Default, Clone)]
pub struct SyncSummary {
    pub run_id: String,
    pub found: usize,
    pub imported: usize,
    pub updated: usize,
    pub closed: usize,
    pub errors: Vec<String>,
}

pub struct PositionReconciler {
    http: reqwest::Client,
    data_api_base: String,
    store: Arc<Store>,
    positions: Arc<PositionTracker>,
    hold_policy: HoldPolicy,
    mature_days: i64,
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

impl PositionReconciler {
    pub fn new(
        data_api_base: impl Into<String>,
        store: Arc<Store>,
        positions: Arc<PositionTracker>,
        hold_policy: HoldPolicy,
        mature_days: i64,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            data_api_base: data_api_base.into(),
            store,
            positions,
            hold_policy,
            mature_days,
        })
    }

    /// Fetches remote open positions for `wallet`. The bool return is
    /// `partial`: true when the response looked paginated or contained
    /// invalid entries, in which case close-detection must be skipped.
    async fn fetch_remote(&self, wallet: &str) -> Result<(Vec<RemotePosition>, bool)> {
        let url = format!("{}/positions?user={}", self.data_api_base, wallet);
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        let body: Value = resp.json().await?;

        let (list, mut partial) = match &body {
            Value::Array(_) => (body, false),
            Value::Object(map) => {
                let paginated = map.contains_key("next_cursor")
                    || map.contains_key("has_more")
                    || map.contains_key("cursor");
                if paginated {
                    warn!("positions API response contains pagination indicators, treating as partial");
                }
                let inner = map
                    .get("positions")
                    .or_else(|| map.get("data"))
                    .cloned()
                    .unwrap_or(Value::Array(vec![]));
                (inner, paginated)
            }
            _ => return Ok((vec![], true)),
        };

        let Value::Array(entries) = list else {
            return Ok((vec![], true));
        };

        let mut positions = Vec::new();
        let mut invalid = 0usize;
        for entry in entries {
            let wire: RemotePositionWire = match serde_json::from_value(entry) {
                Ok(w) => w,
                Err(_) => {
                    invalid += 1;
                    continue;
                }
            };
            let (Some(token_id), Some(condition_id), Some(size_raw)) =
                (wire.asset, wire.condition_id, wire.size.as_ref().and_then(value_to_f64))
            else {
                invalid += 1;
                continue;
            };
            if token_id.is_empty() || condition_id.is_empty() {
                invalid += 1;
                continue;
            }
            if size_raw <= 0.0 {
                continue;
            }
            positions.push(RemotePosition {
                token_id,
                condition_id,
                size: size_raw,
                avg_price: wire.avg_price.as_ref().and_then(value_to_f64).unwrap_or(0.0),
                current_price: wire.cur_price.as_ref().and_then(value_to_f64).unwrap_or(0.0),
                outcome: wire.outcome,
                outcome_index: wire.outcome_index,
                title: wire.title,
            });
        }
        if invalid > 0 {
            warn!(invalid, "skipped invalid remote position entries, treating response as partial");
            partial = true;
        }

        Ok((positions, partial))
    }

    /// Maps token_id -> earliest BUY trade timestamp, for `hold_policy=actual`.
    async fn fetch_trade_timestamps(&self, wallet: &str) -> HashMap<String, DateTime<Utc>> {
        let url = format!("{}/trades?user={}", self.data_api_base, wallet);
        let result: Result<Vec<TradeWire>> = async {
            let resp = self.http.get(&url).send().await?.error_for_status()?;
            Ok(resp.json::<Vec<TradeWire>>().await?)
        }
        .await;

        let trades = match result {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to fetch trade history for hold_policy=actual");
                return HashMap::new();
            }
        };

        let mut earliest: HashMap<String, DateTime<Utc>> = HashMap::new();
        for trade in trades {
            if trade.side.as_deref().map(|s| s.eq_ignore_ascii_case("BUY")) != Some(true) {
                continue;
            }
            let Some(token_id) = trade.asset else { continue };
            let Some(ts) = trade.timestamp.as_ref().and_then(|v| match v {
                Value::Number(n) => n.as_i64().and_then(|s| Utc.timestamp_opt(s, 0).single()),
                Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc)),
                _ => None,
            }) else {
                continue;
            };
            earliest
                .entry(token_id)
                .and_modify(|e| if ts < *e { *e = ts })
                .or_insert(ts);
        }
        earliest
    }

    async fn import_remote(
        &self,
        remote: &RemotePosition,
        hold_start: DateTime<Utc>,
        age_source: AgeSource,
    ) -> Result<()> {
        let position = Position {
            position_id: format!("pos_{}", &Uuid::new_v4().simple().to_string()[..12]),
            token_id: remote.token_id.clone(),
            condition_id: remote.condition_id.clone(),
            outcome: remote.outcome.clone(),
            outcome_index: remote.outcome_index,
            size: remote.size,
            entry_price: remote.avg_price,
            entry_cost: remote.size * remote.avg_price,
            entry_time: Utc::now(),
            status: PositionStatus::Open,
            realized_pnl: 0.0,
            exit_pending: false,
            exit_status: None,
            exit_order_id: None,
            hold_start_at: hold_start,
            age_source,
            import_source: Some("polymarket_sync".to_string()),
            entry_order_id: None,
            description: remote.title.clone(),
            claimed_at: None,
            cost_basis_unknown: false,
        };
        self.store.upsert_position(&position).await
    }

    async fn sync(&self, wallet: &str, sync_type: &str) -> Result<SyncSummary> {
        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let started_at = Utc::now();
        let mut summary = SyncSummary {
            run_id: run_id.clone(),
            ..Default::default()
        };

        let trade_timestamps = if self.hold_policy == HoldPolicy::Actual {
            self.fetch_trade_timestamps(wallet).await
        } else {
            HashMap::new()
        };

        let (remote_positions, partial) = match self.fetch_remote(wallet).await {
            Ok(v) => v,
            Err(e) => {
                summary.errors.push(format!("failed to fetch remote positions: {e}"));
                self.store
                    .insert_sync_log(&run_id, sync_type, wallet, 0, 0, 0, 0, 1, started_at, Some(Utc::now()))
                    .await?;
                return Ok(summary);
            }
        };
        summary.found = remote_positions.len();

        let local_positions = self.store.open_positions().await?;
        let local_by_token: HashMap<&str, &Position> =
            local_positions.iter().map(|p| (p.token_id.as_str(), p)).collect();

        if partial {
            warn!(run_id, "remote positions response was partial, close detection will be skipped");
        }
        info!(run_id, remote = remote_positions.len(), local = local_positions.len(), "position sync starting");

        let now = Utc::now();
        let mut remote_tokens = std::collections::HashSet::new();

        for remote in &remote_positions {
            remote_tokens.insert(remote.token_id.clone());

            match local_by_token.get(remote.token_id.as_str()) {
                None => {
                    let (hold_start, age_source) = match self.hold_policy {
                        HoldPolicy::Actual => match trade_timestamps.get(&remote.token_id) {
                            Some(ts) => (*ts, AgeSource::Actual),
                            None => {
                                warn!(token_id = %remote.token_id, "no trade history found, importing as age_source=unknown");
                                (now, AgeSource::Unknown)
                            }
                        },
                        HoldPolicy::Mature => (now - chrono::Duration::days(self.mature_days), AgeSource::Unknown),
                        HoldPolicy::New => (now, AgeSource::Unknown),
                    };

                    match self.import_remote(remote, hold_start, age_source).await {
                        Ok(()) => {
                            summary.imported += 1;
                            info!(token_id = %remote.token_id, ?age_source, "imported external position");
                        }
                        Err(e) => summary.errors.push(format!("failed to import {}: {e}", remote.token_id)),
                    }
                }
                Some(local) => {
                    if (remote.size - local.size).abs() > SIZE_CHANGE_EPSILON {
                        let entry_cost = remote.size * local.entry_price;
                        // Size moved outside of the bot's own fills — the
                        // recorded entry_price is no longer a true
                        // weighted average of this position's fills.
                        let result = async {
                            self.store
                                .update_open_position(&local.position_id, remote.size, entry_cost, local.entry_price, local.realized_pnl)
                                .await?;
                            self.store.set_cost_basis_unknown(&local.position_id, true).await
                        }
                        .await;
                        match result {
                            Ok(()) => {
                                summary.updated += 1;
                                info!(token_id = %remote.token_id, old_size = local.size, new_size = remote.size, "updated externally-adjusted position size");
                            }
                            Err(e) => summary.errors.push(format!("failed to update {}: {e}", remote.token_id)),
                        }
                    }
                }
            }
        }

        if partial {
            // skip close detection
        } else if remote_positions.is_empty() && !local_positions.is_empty() {
            warn!(
                run_id,
                local = local_positions.len(),
                "remote API returned zero positions while local has open ones, skipping close detection"
            );
        } else {
            for local in &local_positions {
                if remote_tokens.contains(&local.token_id) {
                    continue;
                }
                match self.store.close_position(&local.position_id, 0.0, 0.0, local.realized_pnl).await {
                    Ok(()) => {
                        summary.closed += 1;
                        info!(token_id = %local.token_id, position_id = %local.position_id, "closed position not found remotely");
                    }
                    Err(e) => summary.errors.push(format!("failed to close {}: {e}", local.token_id)),
                }
            }
        }

        self.positions.load_positions().await?;

        self.store
            .insert_sync_log(
                &run_id,
                sync_type,
                wallet,
                summary.found as i64,
                summary.imported as i64,
                summary.updated as i64,
                summary.closed as i64,
                summary.errors.len() as i64,
                started_at,
                Some(Utc::now()),
            )
            .await?;

        Ok(summary)
    }

    /// Fast path for the per-minute background loop: positions and
    /// size/close reconciliation only, no trade-timestamp lookup.
    pub async fn quick_sync(&self, wallet: &str) -> Result<SyncSummary> {
        self.sync(wallet, "quick").await
    }

    /// Slow path, run on a longer interval: identical reconciliation,
    /// logged distinctly so operators can tell cadence apart in the
    /// sync log.
    pub async fn full_sync(&self, wallet: &str) -> Result<SyncSummary> {
        self.sync(wallet, "full").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_policy_parses_known_values() {
        assert_eq!(HoldPolicy::parse("actual"), HoldPolicy::Actual);
        assert_eq!(HoldPolicy::parse("mature"), HoldPolicy::Mature);
        assert_eq!(HoldPolicy::parse("anything-else"), HoldPolicy::New);
    }

    #[tokio::test]
    async fn sync_against_unreachable_host_records_an_error_without_panicking() {
        let store = Arc::new(Store::new(":memory:").unwrap());
        let positions = Arc::new(PositionTracker::new(store.clone()));
        let reconciler = PositionReconciler::new(
            "http://127.0.0.1:1",
            store,
            positions,
            HoldPolicy::New,
            8,
        )
        .unwrap();

        let summary = reconciler.quick_sync("0xabc").await.unwrap();
        assert!(!summary.errors.is_empty());
        assert_eq!(summary.imported, 0);
    }
}
