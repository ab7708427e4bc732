//! Collector process: fetches market data for the brain on command.
//!
//! A collector holds no market state. It registers at the orchestrator's rendezvous endpoint,
//! opens the two channels it was assigned and then answers `ticker-request` / `depth-request`
//! frames with fetched data until it is told to `kill`.

use crate::config::Config;
use crate::error::ArbError;
use crate::exchange::ExchangeApi;
use crate::protocol::{
    next_message, to_frame, Command, Message, ARG_CURRENCY_PAIR, ARG_EXCHANGE, ARG_ID, ARG_LIMIT,
    ARG_PORT_IN, ARG_PORT_OUT,
};
use crate::utils::unix_micros;
use futures_util::SinkExt;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DEPTH_LIMIT: u32 = 100;

type Channel = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open(url: &str) -> Result<Channel, ArbError> {
    let (ws, _) = timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| ArbError::WebSocketError(format!("connect to {} timed out", url)))??;
    Ok(ws)
}

pub struct Collector {
    id: usize,
    exchange: Arc<dyn ExchangeApi>,
    inbound: Channel,
    outbound: Channel,
}

impl Collector {
    /// Registers with the orchestrator and confirms both assigned channels.
    pub async fn connect(config: &Config, exchange: Arc<dyn ExchangeApi>) -> Result<Self, ArbError> {
        let host = &config.orchestrator_address;
        let mut rendezvous =
            open(&format!("ws://{}:{}", host, config.connection_receiver_port)).await?;
        rendezvous.send(to_frame(&Message::connect())?).await?;

        let reply = next_message(&mut rendezvous).await.ok_or_else(|| {
            ArbError::ProtocolError("orchestrator closed before assigning ports".to_string())
        })??;
        if reply.command != Command::ConfirmPorts {
            return Err(ArbError::ProtocolError(format!(
                "expected confirm-ports, got {}",
                reply.command
            )));
        }
        let id: usize = reply.arg_parsed(ARG_ID)?;
        let port_in: u16 = reply.arg_parsed(ARG_PORT_IN)?;
        let port_out: u16 = reply.arg_parsed(ARG_PORT_OUT)?;
        let _ = rendezvous.close(None).await;

        let mut outbound = open(&format!("ws://{}:{}", host, port_out)).await?;
        outbound.send(to_frame(&Message::confirm_out(id))?).await?;
        let mut inbound = open(&format!("ws://{}:{}", host, port_in)).await?;
        inbound.send(to_frame(&Message::confirm_in(id))?).await?;

        info!(
            "👁️ Collector {} connected for {} (in {}, out {})",
            id,
            exchange.name(),
            port_in,
            port_out
        );
        Ok(Collector {
            id,
            exchange,
            inbound,
            outbound,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Serves commands until `kill` or until the orchestrator goes away.
    pub async fn run(mut self) -> Result<(), ArbError> {
        while let Some(message) = next_message(&mut self.inbound).await {
            let request = match message {
                Ok(request) => request,
                Err(ArbError::ProtocolError(e)) => {
                    warn!("Collector {} ignoring bad frame: {}", self.id, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match request.command {
                Command::Kill => {
                    info!("Collector {} killed", self.id);
                    self.outbound.send(to_frame(&Message::kill())?).await?;
                    let _ = self.outbound.close(None).await;
                    let _ = self.inbound.close(None).await;
                    return Ok(());
                }
                Command::TickerRequest | Command::DepthRequest => {
                    if let Some(response) = self.fetch(&request).await {
                        self.outbound.send(to_frame(&response)?).await?;
                    }
                }
                other => warn!("Collector {} ignoring unexpected {}", self.id, other),
            }
        }
        info!("Collector {}: orchestrator closed the channel", self.id);
        Ok(())
    }

    /// Answers one fetch command. `None` when the request is not for this collector's exchange.
    async fn fetch(&self, request: &Message) -> Option<Message> {
        let exchange = request.arg(ARG_EXCHANGE).unwrap_or_default();
        if exchange != self.exchange.name() {
            warn!(
                "Collector {} cannot serve exchange '{}' ({} only)",
                self.id,
                exchange,
                self.exchange.name()
            );
            return None;
        }

        let started = unix_micros();
        let response = match request.command {
            Command::TickerRequest => match self.exchange.all_tickers().await {
                Ok(tickers) => Message::ticker_response(request, &tickers, unix_micros()),
                Err(e) => Ok(Message::error_response(
                    request,
                    Command::TickerResponse,
                    &e.to_string(),
                    unix_micros(),
                )),
            },
            Command::DepthRequest => {
                let symbol = match request.arg(ARG_CURRENCY_PAIR) {
                    Ok(symbol) => symbol,
                    Err(e) => {
                        warn!("Collector {} ignoring depth request: {}", self.id, e);
                        return None;
                    }
                };
                let limit = request.arg_parsed(ARG_LIMIT).unwrap_or(DEFAULT_DEPTH_LIMIT);
                match self.exchange.depth(symbol, limit).await {
                    Ok(depth) => Message::depth_response(request, &depth, unix_micros()),
                    Err(e) => Ok(Message::error_response(
                        request,
                        Command::DepthResponse,
                        &e.to_string(),
                        unix_micros(),
                    )),
                }
            }
            _ => return None,
        };
        debug!(
            "Collector {} served {} in {}us",
            self.id,
            request.command,
            unix_micros() - started
        );

        match response {
            Ok(response) => Some(response),
            Err(e) => {
                warn!("Collector {} cannot encode response: {}", self.id, e);
                None
            }
        }
    }
}
