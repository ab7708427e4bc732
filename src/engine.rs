//! The brain process: market model, orchestrator, scanner, reaper and execution wired together.

use crate::arbitrage::{
    build_triangles, spawn_reaper, ArbitrageScanner, ArbitrageStateStore, ExecutionGate,
    GateConfig, Triangle,
};
use crate::audit::EventSink;
use crate::config::{Config, TickerSource};
use crate::error::ArbError;
use crate::exchange::user_stream::run_user_stream;
use crate::exchange::ExchangeApi;
use crate::market::{FeeSchedule, MarketData};
use crate::orchestrator::{Orchestrator, KILL_ACK_TIMEOUT};
use crate::utils::unix_micros;
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Fetches exchange metadata and derives the triangle set from the tradable pairs.
pub async fn load_exchange_model(
    exchange: &dyn ExchangeApi,
    market: &MarketData,
) -> Result<Vec<Triangle>, ArbError> {
    let info = exchange.exchange_info().await?;
    let pairs = info.pairs();
    let filters = info.filters()?;
    let triangles = build_triangles(&pairs)?;
    info!(
        "🔺 {} triangles from {} tradable pairs ({} with filters)",
        triangles.len(),
        pairs.len(),
        filters.len()
    );
    market.install_exchange_info(pairs, filters);
    Ok(triangles)
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_micros(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; bootstrap already did that work
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("{} loop stopped", name);
    })
}

pub struct Engine {
    config: Arc<Config>,
    exchange: Arc<dyn ExchangeApi>,
    market: Arc<MarketData>,
    store: Arc<ArbitrageStateStore>,
    sink: Arc<dyn EventSink>,
    scanner: Arc<ArbitrageScanner>,
}

impl Engine {
    /// Loads the exchange model and seeds tickers and balances. Fails if the pair set cannot be
    /// turned into triangles.
    pub async fn bootstrap(
        config: Arc<Config>,
        exchange: Arc<dyn ExchangeApi>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ArbError> {
        info!("🚀 Bootstrapping brain for {}", exchange.name());
        let market = Arc::new(MarketData::new());
        let triangles = load_exchange_model(exchange.as_ref(), &market).await?;

        let request_ts = unix_micros();
        match exchange.all_tickers().await {
            Ok(tickers) => {
                info!("Initial ticker snapshot: {} symbols", tickers.len());
                market.apply_tickers(request_ts, tickers);
            }
            Err(e) => warn!("Initial ticker snapshot failed: {}", e),
        }
        match exchange.account().await {
            Ok(account) => {
                info!("Account loaded: {} balances", account.balances.len());
                market.apply_account(account);
            }
            Err(e) => warn!("Account snapshot failed, balances start empty: {}", e),
        }

        let store = Arc::new(ArbitrageStateStore::new());
        let mut scanner = ArbitrageScanner::new(
            Arc::clone(&market),
            Arc::clone(&store),
            triangles,
            FeeSchedule::from_config(&config),
            config.min_frames_seen,
        );
        if config.execution_enabled {
            let gate = ExecutionGate::new(
                Arc::clone(&exchange),
                Arc::clone(&market),
                Arc::clone(&store),
                Arc::clone(&sink),
                GateConfig {
                    min_frames_seen: config.min_frames_seen,
                    min_profit_relative: config.min_profit_relative,
                    test_mode: config.execution_test_mode,
                },
            );
            scanner = scanner.with_gate(Arc::new(gate));
        } else {
            info!("Execution disabled: detection and audit only");
        }

        Ok(Engine {
            config,
            exchange,
            market,
            store,
            sink,
            scanner: Arc::new(scanner),
        })
    }

    pub fn market(&self) -> Arc<MarketData> {
        Arc::clone(&self.market)
    }

    pub fn store(&self) -> Arc<ArbitrageStateStore> {
        Arc::clone(&self.store)
    }

    pub fn scanner(&self) -> Arc<ArbitrageScanner> {
        Arc::clone(&self.scanner)
    }

    /// A corrupted model is reported on `fatal`; transient failures keep the previous model.
    fn spawn_exchange_info_refresh(
        &self,
        shutdown: watch::Receiver<bool>,
        fatal: mpsc::Sender<ArbError>,
    ) -> JoinHandle<()> {
        let exchange = Arc::clone(&self.exchange);
        let market = Arc::clone(&self.market);
        let scanner = Arc::clone(&self.scanner);
        spawn_periodic(
            "exchange info",
            Duration::from_secs(self.config.exchange_info_refresh_secs),
            shutdown,
            move || {
                let exchange = Arc::clone(&exchange);
                let market = Arc::clone(&market);
                let scanner = Arc::clone(&scanner);
                let fatal = fatal.clone();
                async move {
                    match load_exchange_model(exchange.as_ref(), &market).await {
                        Ok(triangles) => scanner.replace_triangles(triangles),
                        Err(e) if e.is_fatal() => {
                            error!("💥 Exchange info refresh produced an invalid model: {}", e);
                            let _ = fatal.try_send(e);
                        }
                        Err(e) => warn!("Exchange info refresh failed, keeping previous model: {}", e),
                    }
                }
            },
        )
    }

    fn spawn_account_refresh(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let exchange = Arc::clone(&self.exchange);
        let market = Arc::clone(&self.market);
        spawn_periodic(
            "account",
            Duration::from_secs(self.config.account_refresh_secs),
            shutdown,
            move || {
                let exchange = Arc::clone(&exchange);
                let market = Arc::clone(&market);
                async move {
                    match exchange.account().await {
                        Ok(account) => {
                            let stamp = account.updated_at_ms;
                            if !market.apply_account(account) {
                                debug!("Polled account at {} older than current, dropped", stamp);
                            }
                        }
                        Err(e) => warn!("Account refresh failed: {}", e),
                    }
                }
            },
        )
    }

    fn spawn_direct_tickers(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let exchange = Arc::clone(&self.exchange);
        let market = Arc::clone(&self.market);
        info!(
            "Polling tickers directly every {:?}",
            self.config.tickers_update_period()
        );
        spawn_periodic(
            "direct tickers",
            self.config.tickers_update_period(),
            shutdown,
            move || {
                let exchange = Arc::clone(&exchange);
                let market = Arc::clone(&market);
                async move {
                    let request_ts = unix_micros();
                    match exchange.all_tickers().await {
                        Ok(tickers) => {
                            if !market.apply_tickers(request_ts, tickers) {
                                debug!("Stale direct ticker snapshot dropped");
                            }
                        }
                        Err(e) => warn!("Ticker poll failed: {}", e),
                    }
                }
            },
        )
    }

    /// Runs every background task until ctrl-c.
    pub async fn run(self) -> Result<(), ArbError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for ctrl-c: {}", e);
            }
            info!("Ctrl-C received, shutting down");
        })
        .await
    }

    /// Runs every background task until `stop` resolves or a fatal error surfaces, then tears
    /// everything down. The fatal error is returned.
    pub async fn run_until(self, stop: impl Future<Output = ()>) -> Result<(), ArbError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ArbError>(1);
        let mut tasks = vec![
            self.spawn_exchange_info_refresh(shutdown_rx.clone(), fatal_tx),
            self.spawn_account_refresh(shutdown_rx.clone()),
            spawn_reaper(
                Arc::clone(&self.store),
                Arc::clone(&self.sink),
                self.config.staleness_threshold(),
                self.config.reaper_tick(),
                shutdown_rx.clone(),
            ),
        ];

        let orchestrator = Orchestrator::start(Arc::clone(&self.config), Arc::clone(&self.market)).await?;
        let loops = orchestrator.spawn_dispatch();
        debug!("{} dispatch loop(s) running", loops);
        if self.config.ticker_source == TickerSource::Direct {
            tasks.push(self.spawn_direct_tickers(shutdown_rx.clone()));
        }

        if self.config.execution_enabled && !self.config.binance_api_key.is_empty() {
            tasks.push(run_user_stream(
                Arc::clone(&self.exchange),
                Arc::clone(&self.market),
                Duration::from_secs(self.config.user_stream_keepalive_secs.max(1)),
                shutdown_rx.clone(),
            ));
        }

        let scanner = Arc::clone(&self.scanner);
        let scan_interval = self.config.scan_interval();
        let scanner_shutdown = shutdown_rx.clone();
        // The scan loop never awaits; keep it off the async workers
        tasks.push(tokio::task::spawn_blocking(move || {
            scanner.run(scan_interval, scanner_shutdown);
        }));

        let outcome = tokio::select! {
            _ = stop => Ok(()),
            Some(e) = fatal_rx.recv() => {
                error!("Stopping brain: {}", e);
                Err(e)
            }
        };

        shutdown_tx.send_replace(true);
        orchestrator.shutdown(KILL_ACK_TIMEOUT).await;
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!(
            "Brain stopped with {} live opportunities",
            self.store.len()
        );
        outcome
    }
}
