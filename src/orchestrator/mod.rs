//! Brain-side coordination of collectors.
//!
//! Collectors register through the rendezvous endpoint, receive a dedicated port pair and
//! become dispatchable once both channels confirmed. Fetch commands are round-robined across
//! ready collectors so their combined request rate stays within the exchange budget; responses
//! are folded into the shared market model.

pub mod dispatch;
pub mod registry;
mod server;

pub use dispatch::{dispatch_delay, handle_response, spawn_dispatch_loop, FetchPlan};
pub use registry::{CollectorRegistry, CollectorState, PortAssignment};

use crate::config::{Config, TickerSource};
use crate::error::ArbError;
use crate::market::MarketData;
use crate::protocol::Command;
use futures::future::join_all;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const KILL_ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<CollectorRegistry>,
    rendezvous_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Binds the rendezvous endpoint and starts accepting collectors.
    pub async fn start(config: Arc<Config>, market: Arc<MarketData>) -> Result<Self, ArbError> {
        let bind = format!(
            "{}:{}",
            config.orchestrator_address, config.connection_receiver_port
        );
        let listener = TcpListener::bind(&bind).await?;
        let rendezvous_addr = listener.local_addr()?;
        info!("🧠 Orchestrator accepting collectors on {}", rendezvous_addr);

        let registry = Arc::new(CollectorRegistry::new(config.base_port));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(server::accept_loop(
            listener,
            config.orchestrator_address.clone(),
            Arc::clone(&registry),
            market,
            shutdown_rx,
        ));

        Ok(Orchestrator {
            config,
            registry,
            rendezvous_addr,
            shutdown_tx,
            tasks: Mutex::new(vec![accept]),
        })
    }

    pub fn rendezvous_addr(&self) -> SocketAddr {
        self.rendezvous_addr
    }

    pub fn registry(&self) -> Arc<CollectorRegistry> {
        Arc::clone(&self.registry)
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Starts the ticker loop (unless tickers are polled directly) and the depth loop for the
    /// configured exchange. Returns how many loops were started.
    pub fn spawn_dispatch(&self) -> usize {
        let exchange = self.config.exchange.clone();
        let mut started = 0;

        if self.config.ticker_source == TickerSource::Collectors {
            self.track(spawn_dispatch_loop(
                Arc::clone(&self.registry),
                FetchPlan::Tickers {
                    exchange: exchange.clone(),
                },
                self.config.fetch_delay(&exchange, Command::TickerRequest),
                self.shutdown_tx.subscribe(),
            ));
            started += 1;
        }

        let symbols = self
            .config
            .depth_pairs
            .get(&exchange)
            .cloned()
            .unwrap_or_default();
        if !symbols.is_empty() {
            self.track(spawn_dispatch_loop(
                Arc::clone(&self.registry),
                FetchPlan::Depth {
                    exchange: exchange.clone(),
                    symbols,
                    limit: self.config.depth_limit,
                },
                self.config.fetch_delay(&exchange, Command::DepthRequest),
                self.shutdown_tx.subscribe(),
            ));
            started += 1;
        }
        started
    }

    /// Stops dispatching, kills every collector and closes its channels once it acknowledged
    /// (or `ack_timeout` passed). Returns how many collectors acknowledged.
    pub async fn shutdown(&self, ack_timeout: Duration) -> usize {
        info!("Orchestrator shutting down {} collector(s)", self.registry.len());
        self.shutdown_tx.send_replace(true);

        let kills = self.registry.ids().into_iter().map(|id| {
            let registry = Arc::clone(&self.registry);
            async move {
                let acked = match registry.kill(id) {
                    Ok(ack) => match tokio::time::timeout(ack_timeout, ack).await {
                        Ok(Ok(())) => true,
                        Ok(Err(_)) => {
                            warn!("Collector {} went away before acknowledging kill", id);
                            false
                        }
                        Err(_) => {
                            warn!("Collector {} did not acknowledge kill in {:?}", id, ack_timeout);
                            false
                        }
                    },
                    Err(e) => {
                        warn!("Cannot kill collector {}: {}", id, e);
                        false
                    }
                };
                registry.remove(id);
                acked
            }
        });
        let acked = join_all(kills).await.into_iter().filter(|acked| *acked).count();

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("Orchestrator stopped, {} collector(s) acknowledged kill", acked);
        acked
    }
}
