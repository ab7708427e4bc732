//! Exchange access: REST market data, account, orders and the user data stream.

pub mod binance;
pub mod user_stream;

use crate::config::Config;
use crate::error::ArbError;
use crate::market::{Account, Depth, ExchangeInfo, OrderAck, OrderRequest, TickersMap};
use async_trait::async_trait;
use std::sync::Arc;

pub use binance::BinanceClient;

#[async_trait]
pub trait ExchangeApi: Send + Sync {
    fn name(&self) -> &str;

    async fn exchange_info(&self) -> Result<ExchangeInfo, ArbError>;

    /// Best bid/ask for every symbol.
    async fn all_tickers(&self) -> Result<TickersMap, ArbError>;

    async fn depth(&self, symbol: &str, limit: u32) -> Result<Depth, ArbError>;

    async fn account(&self) -> Result<Account, ArbError>;

    /// Places an IOC limit order. With `test_mode` the exchange only validates it.
    async fn new_order(
        &self,
        order: &OrderRequest,
        client_order_id: &str,
        timestamp_ms: i64,
        test_mode: bool,
    ) -> Result<OrderAck, ArbError>;

    /// Opens a user data stream and returns its listen key.
    async fn start_user_stream(&self) -> Result<String, ArbError>;

    async fn keepalive_user_stream(&self, listen_key: &str) -> Result<(), ArbError>;

    async fn close_user_stream(&self, listen_key: &str) -> Result<(), ArbError>;

    fn user_stream_url(&self, listen_key: &str) -> String;
}

/// Client for `exchange`, or a config error for an exchange this build cannot talk to.
pub fn exchange_for(config: &Config, exchange: &str) -> Result<Arc<dyn ExchangeApi>, ArbError> {
    match exchange {
        "binance" => Ok(Arc::new(BinanceClient::from_config(config)?)),
        other => Err(ArbError::ConfigError(format!("unsupported exchange '{}'", other))),
    }
}
