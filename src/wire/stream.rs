//! Streaming client: command channel plus a persistent subscription
//! cache, ping interval, and a reconnect loop that closes the socket
//! before sleeping on a heartbeat timeout. Re-subscribes the full
//! persistent set in chunks after reconnect, with a 60 s backoff cap.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::domain::PriceUpdate;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const SUBSCRIBE_CHUNK_SIZE: usize = 100;

#[derive(Debug)]
enum StreamCommand {
    Subscribe(String),
}

/// Supervised streaming client holding the persistent subscription
/// set and dispatching `PriceUpdate`s to subscribers.
pub struct StreamClient {
    cmd_tx: mpsc::Sender<StreamCommand>,
    price_tx: broadcast::Sender<PriceUpdate>,
    subscriptions: Arc<RwLock<HashSet<String>>>,
    url: String,
    heartbeat_timeout: Duration,
}

impl StreamClient {
    pub fn spawn(
        url: impl Into<String>,
        heartbeat_timeout: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (price_tx, _) = broadcast::channel(4096);

        let client = Arc::new(Self {
            cmd_tx,
            price_tx,
            subscriptions: Arc::new(RwLock::new(HashSet::new())),
            url: url.into(),
            heartbeat_timeout,
        });

        let run_client = client.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = run_client.run(cmd_rx) => {}
                _ = shutdown_rx.recv() => {
                    info!("stream client shutting down on cancellation");
                }
            }
        });

        client
    }

    pub fn subscribe_prices(&self) -> broadcast::Receiver<PriceUpdate> {
        self.price_tx.subscribe()
    }

    pub async fn request_subscribe(&self, token_id: impl Into<String>) {
        let token_id = token_id.into();
        self.subscriptions.write().insert(token_id.clone());
        let _ = self.cmd_tx.send(StreamCommand::Subscribe(token_id)).await;
    }

    async fn run(&self, mut cmd_rx: mpsc::Receiver<StreamCommand>) {
        let mut backoff = BACKOFF_BASE;
        loop {
            match self.connect_and_stream(&mut cmd_rx).await {
                Ok(()) => {
                    backoff = BACKOFF_BASE;
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "stream connection lost, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        cmd_rx: &mut mpsc::Receiver<StreamCommand>,
    ) -> anyhow::Result<()> {
        let (ws_stream, _) = connect_async(&self.url).await?;
        let (mut write, mut read) = ws_stream.split();

        let persisted: Vec<String> = self.subscriptions.read().iter().cloned().collect();
        for chunk in persisted.chunks(SUBSCRIBE_CHUNK_SIZE) {
            let frame = serde_json::json!({ "type": "market", "assets_ids": chunk }).to_string();
            write.send(Message::Text(frame)).await?;
        }

        let mut ping_interval = tokio::time::interval(Duration::from_secs(5));
        let mut last_frame_at = tokio::time::Instant::now();

        loop {
            let heartbeat_deadline = last_frame_at + self.heartbeat_timeout;
            tokio::select! {
                _ = tokio::time::sleep_until(heartbeat_deadline) => {
                    // Close the socket before sleeping on reconnect — a prior
                    // implementation leaked the fd by sleeping first.
                    let _ = write.close().await;
                    anyhow::bail!("heartbeat timeout after {:?}", self.heartbeat_timeout);
                }
                _ = ping_interval.tick() => {
                    if write.send(Message::Text("PING".to_string())).await.is_err() {
                        let _ = write.close().await;
                        anyhow::bail!("ping send failed");
                    }
                }
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(StreamCommand::Subscribe(token_id)) => {
                            let frame = serde_json::json!({
                                "assets_ids": [token_id],
                                "operation": "subscribe",
                            }).to_string();
                            if write.send(Message::Text(frame)).await.is_err() {
                                let _ = write.close().await;
                                anyhow::bail!("subscribe send failed");
                            }
                        }
                        None => {
                            let _ = write.close().await;
                            return Ok(());
                        }
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_frame_at = tokio::time::Instant::now();
                            self.handle_text_message(&text);
                        }
                        Some(Ok(Message::Close(_))) => {
                            return Ok(());
                        }
                        Some(Ok(_)) => {
                            last_frame_at = tokio::time::Instant::now();
                        }
                        Some(Err(e)) => {
                            let _ = write.close().await;
                            anyhow::bail!("stream read error: {e}");
                        }
                        None => {
                            let _ = write.close().await;
                            anyhow::bail!("stream ended");
                        }
                    }
                }
            }
        }
    }

    fn handle_text_message(&self, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "[]" || trimmed == "PONG" {
            return;
        }

        #[derive(Deserialize)]
        struct WireMsg {
            event_type: Option<String>,
            asset_id: Option<String>,
            price: Option<String>,
            #[serde(default)]
            timestamp: Option<String>,
        }

        let parsed: Result<WireMsg, _> = serde_json::from_str(trimmed);
        let msg = match parsed {
            Ok(m) => m,
            Err(_) => {
                debug!("ignoring unrecognized stream frame");
                return;
            }
        };

        if msg.event_type.as_deref() != Some("price_change")
            && msg.event_type.as_deref() != Some("last_trade_price")
        {
            return;
        }

        let (Some(token_id), Some(price_raw)) = (msg.asset_id, msg.price) else {
            return;
        };
        let Ok(price) = price_raw.parse::<f64>() else {
            return;
        };

        let observed_at = msg
            .timestamp
            .and_then(|t| t.parse::<i64>().ok())
            .and_then(|secs| chrono::Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);

        let _ = self.price_tx.send(PriceUpdate::new(token_id, price, observed_at));
    }
}

use chrono::TimeZone;
