pub mod arbitrage;
pub mod audit;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod market;
pub mod orchestrator;
pub mod protocol;
pub mod testing; // In-memory exchange and sinks for tests
pub mod utils;

pub use arbitrage::{ArbitrageScanner, ArbitrageStateStore, ExecutionGate, Triangle};
pub use collector::Collector;
pub use engine::Engine;
pub use error::ArbError;
pub use market::MarketData;
pub use orchestrator::Orchestrator;
