//! Plain market data types shared by the brain, the collectors and the exchange client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coin(pub String);

impl Coin {
    pub fn new(symbol: impl Into<String>) -> Self {
        Coin(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tradable pair. `symbol` is `base` followed by `quote`, e.g. ETHBTC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoinPair {
    pub symbol: String,
    pub base: Coin,
    pub quote: Coin,
}

impl CoinPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        let base = Coin::new(base);
        let quote = Coin::new(quote);
        CoinPair {
            symbol: format!("{}{}", base, quote),
            base,
            quote,
        }
    }

    pub fn contains(&self, coin: &Coin) -> bool {
        &self.base == coin || &self.quote == coin
    }

    /// The coin on the other side of `coin`, if `coin` is part of this pair.
    pub fn other(&self, coin: &Coin) -> Option<&Coin> {
        if &self.base == coin {
            Some(&self.quote)
        } else if &self.quote == coin {
            Some(&self.base)
        } else {
            None
        }
    }

    /// True when the pair connects exactly `a` and `b`, in either order.
    pub fn connects(&self, a: &Coin, b: &Coin) -> bool {
        (&self.base == a && &self.quote == b) || (&self.base == b && &self.quote == a)
    }
}

impl fmt::Display for CoinPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.symbol, self.base, self.quote)
    }
}

/// Best bid/ask for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid_price: f64,
    pub bid_qty: f64,
    pub ask_price: f64,
    pub ask_qty: f64,
}

impl Ticker {
    /// A ticker with a zero or negative side cannot be priced.
    pub fn is_usable(&self) -> bool {
        self.bid_price > 0.0 && self.ask_price > 0.0
    }
}

pub type TickersMap = HashMap<String, Ticker>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub qty: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Depth {
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub last_update_id: u64,
}

impl Depth {
    pub fn best_bid(&self) -> Option<DepthLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<DepthLevel> {
        self.asks.first().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub coin: Coin,
    pub free: f64,
    pub locked: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub balances: HashMap<String, Balance>,
    /// Exchange-side update time, milliseconds since epoch
    pub updated_at_ms: i64,
}

impl Account {
    pub fn from_balances(balances: Vec<Balance>, updated_at_ms: i64) -> Self {
        Account {
            balances: balances
                .into_iter()
                .map(|b| (b.coin.0.clone(), b))
                .collect(),
            updated_at_ms,
        }
    }

    /// Free balance of `coin`, zero when unknown.
    pub fn free(&self, coin: &Coin) -> f64 {
        self.balances.get(coin.as_str()).map(|b| b.free).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    Ioc,
    Gtc,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Ioc => "IOC",
            TimeInForce::Gtc => "GTC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
    /// Local pseudo-status for a submission that never got an exchange answer
    Error,
}

impl OrderStatus {
    pub fn parse(raw: &str) -> OrderStatus {
        match raw {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Canceled,
            "PENDING_CANCEL" => OrderStatus::PendingCancel,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            _ => OrderStatus::Error,
        }
    }
}

/// One leg as proposed by the scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: f64,
}

impl fmt::Display for OrderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} {} qty={:.8} price={:.8}]",
            self.side.as_str(),
            self.symbol,
            self.order_type.as_str(),
            self.qty,
            self.price
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub price: f64,
    pub qty: f64,
    pub commission: f64,
    pub commission_asset: String,
}

/// What the exchange reported back for a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub symbol: String,
    pub order_id: i64,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub price: f64,
    pub orig_qty: f64,
    pub executed_qty: f64,
    pub cumulative_quote_qty: f64,
    pub time_in_force: TimeInForce,
    pub transact_time: i64,
    pub fills: Vec<Fill>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_symbol_is_base_then_quote() {
        let pair = CoinPair::new("ETH", "BTC");
        assert_eq!(pair.symbol, "ETHBTC");
        assert!(pair.connects(&Coin::new("BTC"), &Coin::new("ETH")));
        assert_eq!(pair.other(&Coin::new("ETH")), Some(&Coin::new("BTC")));
        assert_eq!(pair.other(&Coin::new("BNB")), None);
    }

    #[test]
    fn test_account_free_defaults_to_zero() {
        let account = Account::from_balances(
            vec![Balance { coin: Coin::new("BTC"), free: 1.5, locked: 0.0 }],
            10,
        );
        assert_eq!(account.free(&Coin::new("BTC")), 1.5);
        assert_eq!(account.free(&Coin::new("XRP")), 0.0);
    }

    #[test]
    fn test_order_status_parse() {
        assert_eq!(OrderStatus::parse("FILLED"), OrderStatus::Filled);
        assert_eq!(OrderStatus::parse("EXPIRED"), OrderStatus::Expired);
        assert_eq!(OrderStatus::parse("???"), OrderStatus::Error);
    }
}
