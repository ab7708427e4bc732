// src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::sync::Arc;
use triangular_arb_bot::{
    audit::{EventSink, JsonLinesSink, LogSink},
    collector::Collector,
    config::load_config,
    engine::Engine,
    exchange::exchange_for,
    utils::setup_logging,
};

#[derive(Parser, Debug)]
#[command(name = "triangular-arb-bot")]
#[command(about = "Triangular arbitrage detection and execution")]
struct Cli {
    /// Overrides LOG_LEVEL
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Orchestrator, scanner and execution
    Brain,
    /// One market-data collector
    Collector,
}

async fn run_brain(config: Arc<triangular_arb_bot::config::Config>) -> Result<()> {
    let exchange = exchange_for(&config, &config.exchange).context("create exchange client")?;

    let (sink, writer) =
        match JsonLinesSink::spawn(&config.event_log_path, config.event_queue_size).await {
            Ok((sink, writer)) => (Arc::new(sink) as Arc<dyn EventSink>, Some(writer)),
            Err(e) => {
                warn!("Event log unavailable ({}), audit events are only logged", e);
                (Arc::new(LogSink) as Arc<dyn EventSink>, None)
            }
        };

    let engine = Engine::bootstrap(Arc::clone(&config), exchange, Arc::clone(&sink))
        .await
        .context("bootstrap brain")?;
    engine.run().await.context("run brain")?;

    // Dropping the last sender lets the writer drain its queue
    drop(sink);
    if let Some(writer) = writer {
        let _ = writer.await;
    }
    Ok(())
}

async fn run_collector(config: Arc<triangular_arb_bot::config::Config>) -> Result<()> {
    let exchange = exchange_for(&config, &config.exchange).context("create exchange client")?;
    let collector = Collector::connect(&config, exchange)
        .await
        .context("register with orchestrator")?;
    collector.run().await.context("serve orchestrator")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();

    let level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&level).context("initialize logging")?;
    let config = load_config().context("load configuration")?;
    info!("Starting {:?} (exchange {})", cli.role, config.exchange);

    let result = match cli.role {
        Role::Brain => run_brain(config).await,
        Role::Collector => run_collector(config).await,
    };
    if let Err(e) = &result {
        error!("Fatal: {:#}", e);
    }
    result
}
