use crate::domain::types::{MarketEvent, Quote, StockCode};
use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Realtime quote transaction id.
const TR_QUOTE: &str = "H0STCNT0";
/// No frame (data or heartbeat) for this long means the session is dead.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_BACKOFF_SECS: u64 = 60;

/// Persistent WebSocket session against the broker's realtime gateway.
///
/// Reconnects with bounded backoff; subscriptions re-register on every
/// reconnect; a missing heartbeat forces a reconnect.
pub struct RealtimeSession {
    ws_url: String,
    approval_key: String,
    event_tx: broadcast::Sender<MarketEvent>,
    subscribed: Arc<RwLock<Vec<StockCode>>>,
    task_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RealtimeSession {
    pub fn new(ws_url: String, approval_key: String) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            ws_url,
            approval_key,
            event_tx,
            subscribed: Arc::new(RwLock::new(Vec::new())),
            task_handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Replace the subscription set and (re)start the session task.
    pub async fn subscribe(&self, codes: Vec<StockCode>) -> broadcast::Receiver<MarketEvent> {
        {
            let mut subscribed = self.subscribed.write().await;
            *subscribed = codes.clone();
        }

        let mut handle = self.task_handle.lock().await;
        if let Some(previous) = handle.take() {
            debug!("RealtimeSession: aborting previous session task");
            previous.abort();
        }

        if codes.is_empty() {
            info!("RealtimeSession: empty subscription, session not started");
            return self.event_tx.subscribe();
        }

        let ws_url = self.ws_url.clone();
        let approval_key = self.approval_key.clone();
        let event_tx = self.event_tx.clone();
        let subscribed = self.subscribed.clone();

        *handle = Some(tokio::spawn(async move {
            Self::run(ws_url, approval_key, event_tx, subscribed).await;
        }));
        info!("RealtimeSession: session task started for {} codes", codes.len());

        self.event_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<MarketEvent> {
        self.event_tx.subscribe()
    }

    pub async fn shutdown(&self) {
        let mut handle = self.task_handle.lock().await;
        if let Some(task) = handle.take() {
            task.abort();
        }
    }

    async fn run(
        ws_url: String,
        approval_key: String,
        event_tx: broadcast::Sender<MarketEvent>,
        subscribed: Arc<RwLock<Vec<StockCode>>>,
    ) {
        let mut backoff = 1u64;
        loop {
            let codes = subscribed.read().await.clone();
            match Self::connect_and_stream(&ws_url, &approval_key, &codes, &event_tx).await {
                Ok(()) => {
                    info!("Realtime session closed by peer, reconnecting");
                    backoff = 1;
                }
                Err(e) => {
                    error!("Realtime session error: {}. Reconnecting in {}s", e, backoff);
                    let _ = event_tx.send(MarketEvent::Disconnected {
                        reason: e.to_string(),
                    });
                }
            }
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn connect_and_stream(
        ws_url: &str,
        approval_key: &str,
        codes: &[StockCode],
        event_tx: &broadcast::Sender<MarketEvent>,
    ) -> Result<()> {
        let url = format!("{}/tryitout/{}", ws_url.trim_end_matches('/'), TR_QUOTE);
        info!("Connecting realtime session: {}", url);
        let (stream, _) = connect_async(&url)
            .await
            .context("Failed to connect realtime websocket")?;
        let (mut write, mut read) = stream.split();

        // Re-register every subscription on each (re)connect.
        for code in codes {
            let register = serde_json::json!({
                "header": {
                    "approval_key": approval_key,
                    "custtype": "P",
                    "tr_type": "1",
                    "content-type": "utf-8",
                },
                "body": {
                    "input": {"tr_id": TR_QUOTE, "tr_key": code.as_str()}
                }
            });
            write
                .send(Message::Text(register.to_string().into()))
                .await
                .context("Failed to send subscription frame")?;
            let _ = event_tx.send(MarketEvent::Subscribed { code: code.clone() });
        }

        loop {
            let frame = tokio::time::timeout(HEARTBEAT_TIMEOUT, read.next()).await;
            let message = match frame {
                Err(_) => {
                    anyhow::bail!("heartbeat missed for {:?}", HEARTBEAT_TIMEOUT);
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(e).context("realtime read error"),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => {
                    if let Some(response) = Self::dispatch_frame(&text, event_tx) {
                        write
                            .send(Message::Text(response.into()))
                            .await
                            .context("Failed to answer heartbeat")?;
                    }
                }
                Message::Ping(payload) => {
                    write
                        .send(Message::Pong(payload))
                        .await
                        .context("Failed to answer ping")?;
                }
                Message::Close(frame) => {
                    info!("Realtime session closed by server: {:?}", frame);
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Frame-level dispatch by message type. Data frames start with `0`
    /// (plain) or `1` (encrypted); everything else is a JSON control frame.
    /// Returns a response frame when the server expects one (heartbeat).
    fn dispatch_frame(text: &str, event_tx: &broadcast::Sender<MarketEvent>) -> Option<String> {
        if text.starts_with('0') || text.starts_with('1') {
            match parse_quote_frame(text) {
                Ok(quote) => {
                    let _ = event_tx.send(MarketEvent::Quote(quote));
                }
                Err(e) => warn!("Unparsable realtime data frame: {}", e),
            }
            return None;
        }

        // Control frame: heartbeats are echoed back verbatim.
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => {
                let tr_id = value
                    .pointer("/header/tr_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if tr_id == "PINGPONG" {
                    debug!("Realtime heartbeat received");
                    return Some(text.to_string());
                }
                let code = value.pointer("/body/msg_cd").and_then(|v| v.as_str());
                debug!("Realtime control frame: tr_id={} msg_cd={:?}", tr_id, code);
                None
            }
            Err(e) => {
                warn!("Unparsable realtime control frame: {}", e);
                None
            }
        }
    }
}

/// Parse a pipe-delimited realtime quote frame:
/// `0|H0STCNT0|001|<code>^<time>^<price>^...^<rate>^...^<volume>...`.
pub fn parse_quote_frame(text: &str) -> Result<Quote> {
    let mut parts = text.split('|');
    let _encrypted = parts.next().context("empty frame")?;
    let tr_id = parts.next().context("frame missing tr_id")?;
    if tr_id != TR_QUOTE {
        anyhow::bail!("unexpected data frame tr_id: {tr_id}");
    }
    let _count = parts.next().context("frame missing record count")?;
    let payload = parts.next().context("frame missing payload")?;

    let fields: Vec<&str> = payload.split('^').collect();
    if fields.len() < 14 {
        anyhow::bail!("quote payload has {} fields, expected at least 14", fields.len());
    }

    let code = StockCode::parse(fields[0])
        .map_err(|e| anyhow::anyhow!("bad code in data frame: {e}"))?;
    let price = Decimal::from_str(fields[2]).context("bad price field")?;
    let change_pct = Decimal::from_str(fields[5]).unwrap_or(Decimal::ZERO);
    let volume = fields[13].parse::<u64>().unwrap_or(0);

    Ok(Quote {
        code,
        price,
        change_pct,
        volume,
        timestamp: Utc::now().timestamp_millis(),
    })
}
