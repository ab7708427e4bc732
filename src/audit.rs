//! Audit event stream: order lifecycle transitions and completed opportunity observations.
//!
//! Producers call `EventSink::emit`, which never blocks the hot path. `JsonLinesSink` hands
//! events to a background writer through a bounded queue and drops (with a warning) when the
//! writer falls behind.

use crate::error::ArbError;
use crate::market::{Fill, OrderSide, OrderStatus, OrderType, TimeInForce};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub arb_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: f64,
    pub orig_qty: f64,
    pub executed_qty: f64,
    pub cumulative_quote_qty: f64,
    pub time_in_force: TimeInForce,
    pub fills: Vec<Fill>,
    pub error_message: Option<String>,
    pub transact_time: DateTime<Utc>,
    /// Free balances of the triangle's coins A, B and C when the event was produced
    pub balances: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedOpportunity {
    pub id: String,
    pub key: String,
    pub triangle_key: String,
    pub coins: [String; 3],
    pub symbols: [String; 3],
    pub profit_relative: f64,
    pub qty_before: f64,
    pub qty_after: f64,
    pub orders: Vec<crate::market::OrderRequest>,
    pub balances: [f64; 3],
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub lifetime_micros: i64,
    pub frames_seen: u32,
    pub scheduled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    OrderStatusChange(OrderEvent),
    ArbitrageCompleted(CompletedOpportunity),
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Logs events and stores nothing.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: AuditEvent) {
        match &event {
            AuditEvent::OrderStatusChange(order) => info!(
                "📝 Order {} {} {} {:?} qty={} executed={} err={:?}",
                order.client_order_id,
                order.side.as_str(),
                order.symbol,
                order.status,
                order.orig_qty,
                order.executed_qty,
                order.error_message
            ),
            AuditEvent::ArbitrageCompleted(opp) => info!(
                "📝 Arb {} gone after {}us, profit={:.6} frames={} scheduled={}",
                opp.key, opp.lifetime_micros, opp.profit_relative, opp.frames_seen, opp.scheduled
            ),
        }
    }
}

/// Appends one JSON document per line to a file.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl JsonLinesSink {
    pub async fn spawn(
        path: impl AsRef<Path>,
        queue_size: usize,
    ) -> Result<(Self, JoinHandle<()>), ArbError> {
        let path = path.as_ref().to_path_buf();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(queue_size.max(1));

        let handle = tokio::spawn(async move {
            info!("Event log writer started: {}", path.display());
            while let Some(event) = rx.recv().await {
                let mut line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        error!("Failed to serialize audit event: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    error!("Failed to append to {}: {}", path.display(), e);
                }
            }
            if let Err(e) = file.flush().await {
                warn!("Failed to flush {}: {}", path.display(), e);
            }
            debug!("Event log writer stopped");
        });

        Ok((JsonLinesSink { tx }, handle))
    }
}

impl EventSink for JsonLinesSink {
    fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Audit event dropped: {}", e);
        }
    }
}
