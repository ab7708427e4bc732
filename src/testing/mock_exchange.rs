//! In-memory exchange for tests.
//!
//! Market data is programmable, submitted orders are recorded, and order submission can be
//! held open to simulate a slow exchange or made to fail per symbol.

use crate::error::ArbError;
use crate::exchange::ExchangeApi;
use crate::market::{
    Account, Depth, ExchangeInfo, OrderAck, OrderRequest, OrderStatus, TickersMap, TimeInForce,
};
use crate::market::exchange_info::SymbolInfo;
use async_trait::async_trait;
use log::debug;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An order as the mock received it.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedOrder {
    pub order: OrderRequest,
    pub client_order_id: String,
    pub timestamp_ms: i64,
    pub test_mode: bool,
}

/// Filters loose enough for any test price, with a 0.001 lot step.
pub fn permissive_filters() -> Vec<serde_json::Value> {
    vec![
        json!({"filterType": "PRICE_FILTER", "minPrice": "0.00000100", "maxPrice": "100000.00000000", "tickSize": "0.00000100"}),
        json!({"filterType": "LOT_SIZE", "minQty": "0.00100000", "maxQty": "100000.00000000", "stepSize": "0.00100000"}),
        json!({"filterType": "MIN_NOTIONAL", "minNotional": "0.00010000"}),
    ]
}

pub fn exchange_info_for(pairs: &[(&str, &str)]) -> ExchangeInfo {
    ExchangeInfo {
        timezone: "UTC".to_string(),
        server_time: 0,
        rate_limits: Vec::new(),
        symbols: pairs
            .iter()
            .map(|(base, quote)| SymbolInfo {
                symbol: format!("{}{}", base, quote),
                status: "TRADING".to_string(),
                base_asset: base.to_string(),
                quote_asset: quote.to_string(),
                order_types: vec!["LIMIT".to_string(), "MARKET".to_string()],
                filters: permissive_filters(),
            })
            .collect(),
    }
}

pub struct MockExchange {
    exchange_info: Mutex<ExchangeInfo>,
    tickers: Mutex<TickersMap>,
    depths: Mutex<HashMap<String, Depth>>,
    account: Mutex<Account>,
    submitted: Mutex<Vec<SubmittedOrder>>,
    failing_symbols: Mutex<HashSet<String>>,
    fail_market_data: AtomicBool,
    hold: watch::Sender<bool>,
    ticker_calls: AtomicUsize,
    depth_calls: AtomicUsize,
}

impl MockExchange {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let (hold, _) = watch::channel(false);
        MockExchange {
            exchange_info: Mutex::new(exchange_info_for(pairs)),
            tickers: Mutex::new(TickersMap::new()),
            depths: Mutex::new(HashMap::new()),
            account: Mutex::new(Account::default()),
            submitted: Mutex::new(Vec::new()),
            failing_symbols: Mutex::new(HashSet::new()),
            fail_market_data: AtomicBool::new(false),
            hold,
            ticker_calls: AtomicUsize::new(0),
            depth_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_tickers(&self, tickers: TickersMap) {
        *lock(&self.tickers) = tickers;
    }

    pub fn set_depth(&self, symbol: &str, depth: Depth) {
        lock(&self.depths).insert(symbol.to_string(), depth);
    }

    pub fn set_account(&self, account: Account) {
        *lock(&self.account) = account;
    }

    pub fn set_exchange_info(&self, info: ExchangeInfo) {
        *lock(&self.exchange_info) = info;
    }

    pub fn fail_orders_for(&self, symbol: &str) {
        lock(&self.failing_symbols).insert(symbol.to_string());
    }

    pub fn fail_market_data(&self, fail: bool) {
        self.fail_market_data.store(fail, Ordering::SeqCst);
    }

    /// Orders block inside `new_order` until `release_orders` is called.
    pub fn hold_orders(&self) {
        self.hold.send_replace(true);
    }

    pub fn release_orders(&self) {
        self.hold.send_replace(false);
    }

    pub fn submitted(&self) -> Vec<SubmittedOrder> {
        lock(&self.submitted).clone()
    }

    pub fn ticker_calls(&self) -> usize {
        self.ticker_calls.load(Ordering::SeqCst)
    }

    pub fn depth_calls(&self) -> usize {
        self.depth_calls.load(Ordering::SeqCst)
    }

    fn market_data_guard(&self) -> Result<(), ArbError> {
        if self.fail_market_data.load(Ordering::SeqCst) {
            Err(ArbError::NetworkError("mock exchange unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    fn name(&self) -> &str {
        "binance"
    }

    async fn exchange_info(&self) -> Result<ExchangeInfo, ArbError> {
        self.market_data_guard()?;
        Ok(lock(&self.exchange_info).clone())
    }

    async fn all_tickers(&self) -> Result<TickersMap, ArbError> {
        self.ticker_calls.fetch_add(1, Ordering::SeqCst);
        self.market_data_guard()?;
        Ok(lock(&self.tickers).clone())
    }

    async fn depth(&self, symbol: &str, _limit: u32) -> Result<Depth, ArbError> {
        self.depth_calls.fetch_add(1, Ordering::SeqCst);
        self.market_data_guard()?;
        lock(&self.depths)
            .get(symbol)
            .cloned()
            .ok_or_else(|| ArbError::ExchangeError(format!("code -1121: Invalid symbol {}", symbol)))
    }

    async fn account(&self) -> Result<Account, ArbError> {
        self.market_data_guard()?;
        Ok(lock(&self.account).clone())
    }

    async fn new_order(
        &self,
        order: &OrderRequest,
        client_order_id: &str,
        timestamp_ms: i64,
        test_mode: bool,
    ) -> Result<OrderAck, ArbError> {
        lock(&self.submitted).push(SubmittedOrder {
            order: order.clone(),
            client_order_id: client_order_id.to_string(),
            timestamp_ms,
            test_mode,
        });

        let mut hold = self.hold.subscribe();
        loop {
            let held = *hold.borrow();
            if !held || hold.changed().await.is_err() {
                break;
            }
        }

        if lock(&self.failing_symbols).contains(&order.symbol) {
            debug!("Mock rejecting {}", client_order_id);
            return Err(ArbError::ExecutionError(format!(
                "HTTP 400 code -2010: rejected {}",
                order.symbol
            )));
        }

        Ok(OrderAck {
            symbol: order.symbol.clone(),
            order_id: timestamp_ms,
            client_order_id: client_order_id.to_string(),
            status: OrderStatus::Filled,
            price: order.price,
            orig_qty: order.qty,
            executed_qty: order.qty,
            cumulative_quote_qty: order.qty * order.price,
            time_in_force: TimeInForce::Ioc,
            transact_time: timestamp_ms,
            fills: Vec::new(),
        })
    }

    async fn start_user_stream(&self) -> Result<String, ArbError> {
        Ok("mock-listen-key".to_string())
    }

    async fn keepalive_user_stream(&self, _listen_key: &str) -> Result<(), ArbError> {
        Ok(())
    }

    async fn close_user_stream(&self, _listen_key: &str) -> Result<(), ArbError> {
        Ok(())
    }

    fn user_stream_url(&self, listen_key: &str) -> String {
        format!("ws://127.0.0.1:1/{}", listen_key)
    }
}
