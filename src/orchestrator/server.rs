//! Websocket endpoints of the orchestrator: the rendezvous listener and the two dedicated
//! channels of every collector.

use super::dispatch::handle_response;
use super::registry::CollectorRegistry;
use crate::error::ArbError;
use crate::market::MarketData;
use crate::protocol::{next_message, to_frame, Command, Message};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::accept_async;

/// Accepts collector handshakes until shutdown.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    host: String,
    registry: Arc<CollectorRegistry>,
    market: Arc<MarketData>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Rendezvous connection from {}", peer);
                    let host = host.clone();
                    let registry = Arc::clone(&registry);
                    let market = Arc::clone(&market);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = rendezvous(stream, host, registry, market, shutdown).await {
                            warn!("Handshake with {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("Rendezvous accept failed: {}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Rendezvous endpoint closed");
}

async fn rendezvous(
    stream: TcpStream,
    host: String,
    registry: Arc<CollectorRegistry>,
    market: Arc<MarketData>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ArbError> {
    let mut ws = accept_async(stream).await?;
    let request = next_message(&mut ws)
        .await
        .ok_or_else(|| ArbError::ProtocolError("closed before connect".to_string()))??;
    if request.command != Command::Connect {
        return Err(ArbError::ProtocolError(format!(
            "expected connect, got {}",
            request.command
        )));
    }

    let assignment = registry.register()?;
    // Both channels listen before the collector learns their ports
    let bound = async {
        let inbound = TcpListener::bind(format!("{}:{}", host, assignment.port_in)).await?;
        let outbound = TcpListener::bind(format!("{}:{}", host, assignment.port_out)).await?;
        Ok::<_, ArbError>((inbound, outbound))
    }
    .await;
    let (inbound, outbound) = match bound {
        Ok(listeners) => listeners,
        Err(e) => {
            registry.remove(assignment.id);
            return Err(e);
        }
    };

    tokio::spawn(serve_inbound(
        inbound,
        assignment.id,
        Arc::clone(&registry),
        shutdown.clone(),
    ));
    tokio::spawn(serve_outbound(outbound, assignment.id, registry, market, shutdown));

    ws.send(to_frame(&Message::confirm_ports(
        assignment.id,
        assignment.port_in,
        assignment.port_out,
    ))?)
    .await?;
    let _ = ws.close(None).await;
    Ok(())
}

async fn accept_one(
    listener: &TcpListener,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<TcpStream> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => return Some(stream),
                Err(e) => {
                    warn!("Collector channel accept failed: {}", e);
                    return None;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
        }
    }
}

/// Inbound channel: commands go to the collector, `confirm-in` comes back on it.
async fn serve_inbound(
    listener: TcpListener,
    id: usize,
    registry: Arc<CollectorRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(stream) = accept_one(&listener, &mut shutdown).await else {
        return;
    };
    drop(listener);
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Collector {} inbound upgrade failed: {}", id, e);
            return;
        }
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    registry.attach(id, tx);

    let writer = async {
        while let Some(message) = rx.recv().await {
            let frame = match to_frame(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Cannot encode {} for collector {}: {}", message.command, id, e);
                    continue;
                }
            };
            if let Err(e) = write.send(frame).await {
                warn!("Collector {} inbound send failed: {}", id, e);
                return;
            }
        }
        // Queue dropped: the collector was removed
        let _ = write.close().await;
    };

    let reader = async {
        while let Some(message) = next_message(&mut read).await {
            match message {
                Ok(m) if m.command == Command::ConfirmIn => {
                    registry.confirm_in(id);
                }
                Ok(m) => warn!("Collector {} sent {} on its inbound channel", id, m.command),
                Err(e) => {
                    warn!("Collector {} inbound read failed: {}", id, e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => debug!("Collector {} inbound channel closed", id),
        _ = reader => {
            if registry.disconnect(id) {
                warn!("Collector {} disconnected", id);
            }
        }
    }
}

/// Outbound channel: `confirm-out`, fetch responses and the kill acknowledgement.
async fn serve_outbound(
    listener: TcpListener,
    id: usize,
    registry: Arc<CollectorRegistry>,
    market: Arc<MarketData>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(stream) = accept_one(&listener, &mut shutdown).await else {
        return;
    };
    drop(listener);
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Collector {} outbound upgrade failed: {}", id, e);
            return;
        }
    };

    while let Some(message) = next_message(&mut ws).await {
        match message {
            Ok(m) => match m.command {
                Command::ConfirmOut => {
                    registry.confirm_out(id);
                }
                Command::TickerResponse | Command::DepthResponse => {
                    handle_response(&market, id, &m);
                }
                Command::Kill => {
                    registry.acknowledge_kill(id);
                    break;
                }
                other => warn!("Collector {} sent {} on its outbound channel", id, other),
            },
            Err(ArbError::ProtocolError(e)) => warn!("Collector {} sent garbage: {}", id, e),
            Err(e) => {
                warn!("Collector {} outbound read failed: {}", id, e);
                break;
            }
        }
    }
    let _ = ws.close(None).await;
    debug!("Collector {} outbound channel closed", id);
}
