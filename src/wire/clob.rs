//! REST implementation of the Wire Adapter against a CLOB-style
//! prediction-market exchange. HMAC L2 auth, retrying submit/query/cancel.

use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::domain::{BookLevel, Order, OrderStatus, Orderbook, Side};
use crate::errors::{InsufficientBalance, TransportError};
use crate::wire::{execute_with_retry, RateLimiter, WireAdapter};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct ClobCredentials {
    pub address: String,
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl fmt::Debug for ClobCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClobCredentials")
            .field("address", &self.address)
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

impl ClobCredentials {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            address: std::env::var("CLOB_ADDRESS").context("CLOB_ADDRESS not set")?,
            api_key: std::env::var("CLOB_API_KEY").context("CLOB_API_KEY not set")?,
            secret: std::env::var("CLOB_SECRET").context("CLOB_SECRET not set")?,
            passphrase: std::env::var("CLOB_PASSPHRASE").context("CLOB_PASSPHRASE not set")?,
        })
    }
}

pub struct ClobWireAdapter {
    http: reqwest::Client,
    base_url: String,
    credentials: ClobCredentials,
    rate_limiter: RateLimiter,
}

impl ClobWireAdapter {
    pub fn new(base_url: impl Into<String>, credentials: ClobCredentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            credentials,
            rate_limiter: RateLimiter::per_second(10),
        })
    }

    fn sign_request(&self, method: &str, path: &str, body: &str, timestamp: i64) -> Result<String> {
        let message = format!("{timestamp}{method}{path}{body}");

        let secret_bytes = URL_SAFE
            .decode(&self.credentials.secret)
            .or_else(|_| URL_SAFE_NO_PAD.decode(&self.credentials.secret))
            .or_else(|_| STANDARD.decode(&self.credentials.secret))
            .context("failed to base64-decode CLOB secret")?;

        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| anyhow!("invalid HMAC key length: {e}"))?;
        mac.update(message.as_bytes());
        let signature = mac.finalize().into_bytes();
        Ok(URL_SAFE.encode(signature))
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<Vec<(&'static str, String)>> {
        let timestamp = Utc::now().timestamp();
        let signature = self.sign_request(method, path, body, timestamp)?;
        Ok(vec![
            ("POLY_ADDRESS", self.credentials.address.clone()),
            ("POLY_API_KEY", self.credentials.api_key.clone()),
            ("POLY_SIGNATURE", signature),
            ("POLY_TIMESTAMP", timestamp.to_string()),
            ("POLY_PASSPHRASE", self.credentials.passphrase.clone()),
        ])
    }

    fn classify_status(&self, status: reqwest::StatusCode) -> Option<anyhow::Error> {
        if status.as_u16() == 429 {
            return Some(anyhow!(crate::errors::RateLimited {
                retry_after_ms: 1000
            }));
        }
        if status.is_server_error() {
            return Some(anyhow!(TransportError(format!("server error: {status}"))));
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct OrderbookLevelWire {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct OrderbookWire {
    bids: Vec<OrderbookLevelWire>,
    asks: Vec<OrderbookLevelWire>,
}

#[derive(Debug, Serialize)]
struct OrderPayload {
    token_id: String,
    price: String,
    size: String,
    side: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(alias = "orderID", alias = "order_id", alias = "id")]
    order_id: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderStatusWire {
    status: Option<String>,
    #[serde(alias = "size_matched", alias = "filled_size")]
    filled_size: Option<String>,
    #[serde(alias = "avg_price", alias = "price")]
    avg_fill_price: Option<String>,
}

fn parse_f64_or(v: &str, default: f64) -> f64 {
    v.trim().parse::<f64>().unwrap_or(default)
}

#[async_trait]
impl WireAdapter for ClobWireAdapter {
    async fn fetch_orderbook(&self, token_id: &str) -> Result<Orderbook> {
        self.rate_limiter.acquire().await;
        let url = format!("{}/book?token_id={}", self.base_url, token_id);

        let resp = execute_with_retry(|| async {
            let r = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| anyhow!(TransportError(e.to_string())))?;
            if let Some(e) = self.classify_status(r.status()) {
                return Err(e);
            }
            r.json::<OrderbookWire>()
                .await
                .map_err(|e| anyhow!(TransportError(e.to_string())))
        })
        .await?;

        let mut book = Orderbook {
            token_id: token_id.to_string(),
            bids: resp
                .bids
                .iter()
                .map(|l| BookLevel {
                    price: parse_f64_or(&l.price, 0.0),
                    size: parse_f64_or(&l.size, 0.0),
                })
                .filter(|l| l.size > 0.0)
                .collect(),
            asks: resp
                .asks
                .iter()
                .map(|l| BookLevel {
                    price: parse_f64_or(&l.price, 0.0),
                    size: parse_f64_or(&l.size, 0.0),
                })
                .filter(|l| l.size > 0.0)
                .collect(),
            observed_at: Utc::now(),
        };
        book.sort();
        Ok(book)
    }

    async fn fetch_trades(&self, token_id: &str, max_age_seconds: i64) -> Result<Vec<crate::domain::Trade>> {
        self.rate_limiter.acquire().await;
        let url = format!("{}/trades?token_id={}", self.base_url, token_id);

        #[derive(Deserialize)]
        struct TradeWire {
            id: String,
            price: String,
            size: String,
            side: String,
            #[serde(alias = "match_time", alias = "timestamp")]
            traded_at: i64,
        }

        let wires: Vec<TradeWire> = execute_with_retry(|| async {
            let r = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| anyhow!(TransportError(e.to_string())))?;
            if let Some(e) = self.classify_status(r.status()) {
                return Err(e);
            }
            r.json().await.map_err(|e| anyhow!(TransportError(e.to_string())))
        })
        .await?;

        let now = Utc::now();
        let mut filtered_count = 0usize;
        let trades: Vec<crate::domain::Trade> = wires
            .into_iter()
            .filter_map(|w| {
                let traded_at = chrono::Utc.timestamp_opt(w.traded_at, 0).single()?;
                let age = (now - traded_at).num_seconds();
                if age > max_age_seconds {
                    filtered_count += 1;
                    return None;
                }
                Some(crate::domain::Trade {
                    id: w.id,
                    token_id: token_id.to_string(),
                    condition_id: None,
                    price: parse_f64_or(&w.price, 0.0),
                    size: parse_f64_or(&w.size, 0.0),
                    side: w.side.parse().unwrap_or(Side::Buy),
                    traded_at,
                })
            })
            .collect();

        if filtered_count > 0 {
            tracing::debug!(token_id, filtered_count, "fetch_trades filtered stale trades");
        }
        Ok(trades)
    }

    async fn fetch_balance(&self) -> Result<f64> {
        self.rate_limiter.acquire().await;
        let path = "/balance-allowance?signature_type=2";
        let url = format!("{}{}", self.base_url, path);
        let headers = self.auth_headers("GET", path, "")?;

        #[derive(Deserialize)]
        struct BalanceWire {
            balance: Option<String>,
        }

        execute_with_retry(|| async {
            let mut req = self.http.get(&url);
            for (k, v) in &headers {
                req = req.header(*k, v);
            }
            let r = req.send().await.map_err(|e| anyhow!(TransportError(e.to_string())))?;
            if let Some(e) = self.classify_status(r.status()) {
                return Err(e);
            }
            let wire: BalanceWire = r
                .json()
                .await
                .map_err(|e| anyhow!(TransportError(e.to_string())))?;
            let raw = wire.balance.unwrap_or_else(|| "0".to_string());
            // Balances are sometimes returned as wei-scale integer strings.
            let parsed = raw.parse::<f64>().unwrap_or(0.0);
            Ok(if parsed > 1_000_000.0 {
                parsed / 1_000_000.0
            } else {
                parsed
            })
        })
        .await
    }

    async fn submit_order(
        &self,
        token_id: &str,
        _condition_id: &str,
        side: Side,
        price: f64,
        size: f64,
    ) -> Result<String> {
        self.rate_limiter.acquire().await;
        let path = "/order";
        let url = format!("{}{}", self.base_url, path);

        let payload = OrderPayload {
            token_id: token_id.to_string(),
            price: format!("{:.4}", price),
            size: format!("{:.6}", size),
            side: side.as_str().to_string(),
        };
        let body = serde_json::to_string(&payload).context("failed to serialize order payload")?;
        let headers = self.auth_headers("POST", path, &body)?;

        let resp: OrderResponse = execute_with_retry(|| async {
            let mut req = self.http.post(&url).body(body.clone());
            for (k, v) in &headers {
                req = req.header(*k, v);
            }
            let r = req.send().await.map_err(|e| anyhow!(TransportError(e.to_string())))?;
            let status = r.status();
            if status.as_u16() == 400 {
                let text = r.text().await.unwrap_or_default();
                if text.to_lowercase().contains("insufficient") {
                    return Err(anyhow!(InsufficientBalance {
                        requested: price * size,
                        available: 0.0,
                    }));
                }
                return Err(anyhow!(crate::errors::ValidationError(text)));
            }
            if let Some(e) = self.classify_status(status) {
                return Err(e);
            }
            r.json().await.map_err(|e| anyhow!(TransportError(e.to_string())))
        })
        .await?;

        if let Some(id) = resp.order_id {
            if !id.trim().is_empty() {
                return Ok(id);
            }
        }
        bail!(crate::errors::SubmissionAmbiguous(
            resp.error.unwrap_or_else(|| "no order id returned".to_string())
        ))
    }

    async fn get_order(&self, order_id: &str) -> Result<Order> {
        self.rate_limiter.acquire().await;
        let path = format!("/order/{order_id}");
        let url = format!("{}{}", self.base_url, path);
        let headers = self.auth_headers("GET", &path, "")?;

        let wire: OrderStatusWire = execute_with_retry(|| async {
            let mut req = self.http.get(&url);
            for (k, v) in &headers {
                req = req.header(*k, v);
            }
            let r = req.send().await.map_err(|e| anyhow!(TransportError(e.to_string())))?;
            if let Some(e) = self.classify_status(r.status()) {
                return Err(e);
            }
            r.json().await.map_err(|e| anyhow!(TransportError(e.to_string())))
        })
        .await?;

        let size = wire
            .filled_size
            .as_deref()
            .map(|v| parse_f64_or(v, 0.0))
            .unwrap_or(0.0);
        let status = match wire.status.as_deref() {
            Some("MATCHED") | Some("FILLED") => OrderStatus::Filled,
            Some("LIVE") | Some("OPEN") => OrderStatus::Live,
            Some("PARTIAL") => OrderStatus::Partial,
            Some("CANCELLED") | Some("CANCELED") => OrderStatus::Cancelled,
            Some("REJECTED") | Some("EXPIRED") | Some("FAILED") => OrderStatus::Failed,
            _ => OrderStatus::Pending,
        };

        Ok(Order {
            order_id: order_id.to_string(),
            token_id: String::new(),
            condition_id: String::new(),
            side: Side::Buy,
            limit_price: 0.0,
            size,
            status,
            filled_size: size,
            avg_fill_price: wire.avg_fill_price.as_deref().map(|v| parse_f64_or(v, 0.0)),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        self.rate_limiter.acquire().await;
        let path = format!("/order/{order_id}");
        let url = format!("{}{}", self.base_url, path);
        let headers = self.auth_headers("DELETE", &path, "")?;

        execute_with_retry(|| async {
            let mut req = self.http.delete(&url);
            for (k, v) in &headers {
                req = req.header(*k, v);
            }
            let r = req.send().await.map_err(|e| anyhow!(TransportError(e.to_string())))?;
            if let Some(e) = self.classify_status(r.status()) {
                return Err(e);
            }
            Ok(r.status().is_success())
        })
        .await
    }
}

use chrono::TimeZone;
