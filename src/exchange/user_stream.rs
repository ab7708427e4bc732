//! User data stream: pushes balance updates into the account snapshot.
//!
//! The listen key is kept alive on an interval. When the socket closes or errors the stream is
//! reopened with a fresh listen key after a bounded exponential back-off.

use super::ExchangeApi;
use crate::error::ArbError;
use crate::market::{Account, Balance, Coin, MarketData};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RawStreamBalance {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "f")]
    free: String,
    #[serde(rename = "l")]
    locked: String,
}

#[derive(Debug, Deserialize)]
struct RawAccountEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "u", default)]
    last_update: Option<i64>,
    #[serde(rename = "B", default)]
    balances: Vec<RawStreamBalance>,
}

/// Folds a balance push into `current`. `Ok(None)` for events that carry no balances.
///
/// `outboundAccountInfo` is a full snapshot; `outboundAccountPosition` only lists the assets
/// that changed, so the rest are carried over.
pub fn parse_account_event(raw: &str, current: &Account) -> Result<Option<Account>, ArbError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let event_type = value.get("e").and_then(|e| e.as_str()).unwrap_or("");
    if event_type != "outboundAccountInfo" && event_type != "outboundAccountPosition" {
        return Ok(None);
    }
    let event: RawAccountEvent = serde_json::from_value(value)?;

    let mut balances = if event.event_type == "outboundAccountPosition" {
        current.balances.clone()
    } else {
        Default::default()
    };
    for b in event.balances {
        let balance = Balance {
            coin: Coin::new(b.asset.clone()),
            free: b.free.parse()?,
            locked: b.locked.parse()?,
        };
        balances.insert(b.asset, balance);
    }
    Ok(Some(Account {
        balances,
        updated_at_ms: event.last_update.unwrap_or(event.event_time),
    }))
}

async fn stream_once(
    exchange: &Arc<dyn ExchangeApi>,
    market: &Arc<MarketData>,
    keepalive: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ArbError> {
    let listen_key = exchange.start_user_stream().await?;
    let url = exchange.user_stream_url(&listen_key);
    let (mut ws, _) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| ArbError::WebSocketError("user data stream connect timed out".to_string()))??;
    info!("✅ User data stream connected");

    let mut keepalive_tick = tokio::time::interval(keepalive);
    keepalive_tick.tick().await;

    let result = loop {
        tokio::select! {
            _ = keepalive_tick.tick() => {
                match exchange.keepalive_user_stream(&listen_key).await {
                    Ok(()) => debug!("User data stream keepalive sent"),
                    Err(e) => warn!("User data stream keepalive failed: {}", e),
                }
            }
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let current = market.account.value();
                    match parse_account_event(&text, &current) {
                        Ok(Some(account)) => {
                            let stamp = account.updated_at_ms;
                            if market.apply_account(account) {
                                debug!("Account updated from user stream at {}", stamp);
                            } else {
                                debug!("Stale account push at {} dropped", stamp);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Bad user stream payload: {}", e),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = ws.send(Message::Pong(payload)).await {
                        break Err(e.into());
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("User data stream closed by server: {:?}", frame);
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = ws.close(None).await;
                    break Ok(());
                }
            }
        }
    };

    if let Err(e) = exchange.close_user_stream(&listen_key).await {
        debug!("Listen key close failed: {}", e);
    }
    result
}

/// Keeps the account snapshot fresh from the exchange's user data stream until shutdown.
pub fn run_user_stream(
    exchange: Arc<dyn ExchangeApi>,
    market: Arc<MarketData>,
    keepalive: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = MIN_BACKOFF;
        while !*shutdown.borrow() {
            let started = tokio::time::Instant::now();
            match stream_once(&exchange, &market, keepalive, &mut shutdown).await {
                Ok(()) => info!("User data stream ended"),
                Err(e) => error!("User data stream error: {}", e),
            }
            if *shutdown.borrow() {
                break;
            }
            // A connection that lived a while resets the back-off
            if started.elapsed() > MAX_BACKOFF {
                backoff = MIN_BACKOFF;
            }
            warn!("Reconnecting user data stream in {:?}", backoff);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        info!("User data stream stopped");
    })
}
