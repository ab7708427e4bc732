//! Exchange metadata as served by `GET /api/v3/exchangeInfo`.

use super::filters::TradingFilters;
use super::types::CoinPair;
use crate::error::ArbError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

pub const FILTER_TYPE_PRICE_FILTER: &str = "PRICE_FILTER";
pub const FILTER_TYPE_LOT_SIZE: &str = "LOT_SIZE";
pub const FILTER_TYPE_MIN_NOTIONAL: &str = "MIN_NOTIONAL";
pub const FILTER_TYPE_NOTIONAL: &str = "NOTIONAL";

pub type FiltersMap = HashMap<String, TradingFilters>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub rate_limit_type: String,
    pub interval: String,
    #[serde(default)]
    pub interval_num: u32,
    pub limit: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub order_types: Vec<String>,
    /// Filters are heterogeneous objects keyed by `filterType`
    #[serde(default)]
    pub filters: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeInfo {
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub server_time: i64,
    #[serde(default)]
    pub rate_limits: Vec<RateLimit>,
    pub symbols: Vec<SymbolInfo>,
}

fn field_f64(filter: &Value, key: &str) -> Result<f64, ArbError> {
    match filter.get(key) {
        Some(Value::String(s)) => Ok(s.parse::<f64>()?),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| ArbError::ParseError(format!("{} is not a float", key))),
        Some(other) => Err(ArbError::ParseError(format!("{} has unexpected value {}", key, other))),
        None => Ok(0.0),
    }
}

impl SymbolInfo {
    pub fn is_trading(&self) -> bool {
        self.status == "TRADING"
    }

    pub fn pair(&self) -> CoinPair {
        CoinPair {
            symbol: self.symbol.clone(),
            base: super::types::Coin::new(self.base_asset.clone()),
            quote: super::types::Coin::new(self.quote_asset.clone()),
        }
    }

    /// Collapses the raw filter list into one `TradingFilters`. Unknown filter types are ignored.
    pub fn trading_filters(&self) -> Result<TradingFilters, ArbError> {
        let mut filters = TradingFilters::default();
        for filter in &self.filters {
            let filter_type = filter.get("filterType").and_then(Value::as_str).unwrap_or("");
            match filter_type {
                FILTER_TYPE_PRICE_FILTER => {
                    filters.min_price = field_f64(filter, "minPrice")?;
                    filters.max_price = field_f64(filter, "maxPrice")?;
                    filters.tick_size = field_f64(filter, "tickSize")?;
                }
                FILTER_TYPE_LOT_SIZE => {
                    filters.min_qty = field_f64(filter, "minQty")?;
                    filters.max_qty = field_f64(filter, "maxQty")?;
                    filters.step_size = field_f64(filter, "stepSize")?;
                }
                FILTER_TYPE_MIN_NOTIONAL | FILTER_TYPE_NOTIONAL => {
                    filters.min_notional = field_f64(filter, "minNotional")?;
                }
                _ => {}
            }
        }
        Ok(filters)
    }
}

impl ExchangeInfo {
    /// Pairs that can currently be traded.
    pub fn pairs(&self) -> Vec<CoinPair> {
        self.symbols
            .iter()
            .filter(|s| s.is_trading())
            .map(SymbolInfo::pair)
            .collect()
    }

    pub fn filters(&self) -> Result<FiltersMap, ArbError> {
        let mut map = FiltersMap::with_capacity(self.symbols.len());
        for symbol in self.symbols.iter().filter(|s| s.is_trading()) {
            map.insert(symbol.symbol.clone(), symbol.trading_filters()?);
        }
        Ok(map)
    }
}
