//! Market Discovery: fetches active market metadata (question,
//! category, end date, outcome/token pairs) from the exchange's
//! read-only metadata API (`gamma-api.polymarket.com/markets`) — a
//! distinct surface from the CLOB trading wire, so it gets its own
//! small client.
//!
//! Called once at startup and periodically in the background to keep
//! the engine's token->condition cache warm, matching the "writes
//! happen during startup and background full-fetch" cache discipline.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::domain::{Market, Outcome};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct MarketWire {
    #[serde(rename = "conditionId")]
    condition_id: Option<String>,
    question: Option<String>,
    category: Option<String>,
    #[serde(rename = "endDateIso", alias = "endDate")]
    end_date: Option<String>,
    #[serde(rename = "clobTokenIds")]
    clob_token_ids: Option<serde_json::Value>,
    outcomes: Option<serde_json::Value>,
}

fn parse_string_list(value: &Option<serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::String(s)) => {
            serde_json::from_str::<Vec<String>>(s).unwrap_or_default()
        }
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_end_date(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let with_time = format!("{raw}T00:00:00+00:00");
    DateTime::parse_from_rfc3339(&with_time)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_market(wire: MarketWire) -> Option<Market> {
    let condition_id = wire.condition_id.filter(|s| !s.is_empty())?;
    let token_ids = parse_string_list(&wire.clob_token_ids);
    if token_ids.is_empty() {
        return None;
    }
    let outcome_labels = parse_string_list(&wire.outcomes);

    let outcomes = token_ids
        .into_iter()
        .enumerate()
        .map(|(index, token_id)| {
            let label = outcome_labels
                .get(index)
                .cloned()
                .unwrap_or_else(|| if index == 0 { "Yes".to_string() } else { "No".to_string() });
            Outcome {
                token_id,
                outcome_label: label,
                outcome_index: index as i64,
            }
        })
        .collect();

    Some(Market {
        condition_id,
        question: wire.question.unwrap_or_default(),
        category: wire.category,
        end_time: parse_end_date(wire.end_date.as_deref()),
        outcomes,
    })
}

pub struct MarketsClient {
    http: reqwest::Client,
    base_url: String,
}

impl MarketsClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// Fetches one page of active markets. `offset` pages through
    /// results; callers stop once fewer than `PAGE_SIZE` come back.
    pub async fn fetch_active_page(&self, offset: u32) -> Result<Vec<Market>> {
        let url = format!("{}/markets", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("limit", PAGE_SIZE.to_string()),
                ("offset", offset.to_string()),
                ("active", "true".to_string()),
                ("closed", "false".to_string()),
            ])
            .send()
            .await
            .context("gamma markets request failed")?;

        let wires: Vec<MarketWire> = resp.json().await.context("failed to decode markets response")?;
        let mut markets = Vec::with_capacity(wires.len());
        for wire in wires {
            match parse_market(wire) {
                Some(m) => markets.push(m),
                None => warn!("skipped unparseable market entry"),
            }
        }
        Ok(markets)
    }

    /// Pages through every active market, stopping at the first
    /// short page. Bounded by `max_pages` so a misbehaving API can't
    /// loop forever.
    pub async fn fetch_all_active(&self, max_pages: u32) -> Result<Vec<Market>> {
        let mut all = Vec::new();
        for page in 0..max_pages {
            let offset = page * PAGE_SIZE;
            let markets = self.fetch_active_page(offset).await?;
            let got = markets.len();
            all.extend(markets);
            if (got as u32) < PAGE_SIZE {
                break;
            }
        }
        Ok(all)
    }
}
