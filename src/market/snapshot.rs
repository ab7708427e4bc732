//! Whole-value snapshots shared between one writer and many readers.
//!
//! Readers take an `Arc` to the current snapshot and never block writers. Writers replace the
//! snapshot wholesale, and only if their stamp is not older than the one already applied, so
//! responses that arrive out of order can never roll the state back.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;

use super::exchange_info::FiltersMap;
use super::filters::TradingFilters;
use super::types::{Account, CoinPair, Depth, TickersMap};

#[derive(Debug)]
pub struct Snapshot<T> {
    /// Ordering stamp of the fetch that produced `value` (request time for tickers/depth,
    /// exchange update time for accounts)
    pub stamp: i64,
    pub value: Arc<T>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Snapshot {
            stamp: self.stamp,
            value: Arc::clone(&self.value),
        }
    }
}

pub struct MonotonicCell<T> {
    inner: ArcSwap<Snapshot<T>>,
}

impl<T> MonotonicCell<T> {
    pub fn new(initial: T) -> Self {
        MonotonicCell {
            inner: ArcSwap::from_pointee(Snapshot {
                stamp: i64::MIN,
                value: Arc::new(initial),
            }),
        }
    }

    /// Installs `value` unless a newer stamp was applied already. Returns false for a stale frame.
    pub fn apply(&self, stamp: i64, value: T) -> bool {
        let candidate = Arc::new(Snapshot {
            stamp,
            value: Arc::new(value),
        });
        let mut applied = false;
        self.inner.rcu(|current| {
            if current.stamp <= stamp {
                applied = true;
                Arc::clone(&candidate)
            } else {
                applied = false;
                Arc::clone(current)
            }
        });
        applied
    }

    pub fn load(&self) -> Arc<Snapshot<T>> {
        self.inner.load_full()
    }

    pub fn value(&self) -> Arc<T> {
        Arc::clone(&self.inner.load().value)
    }

    pub fn stamp(&self) -> i64 {
        self.inner.load().stamp
    }
}

impl<T: Default> Default for MonotonicCell<T> {
    fn default() -> Self {
        MonotonicCell::new(T::default())
    }
}

/// Everything the scanner and the execution gate read about the market.
pub struct MarketData {
    pub pairs: ArcSwap<Vec<CoinPair>>,
    pub filters: ArcSwap<FiltersMap>,
    pub tickers: MonotonicCell<TickersMap>,
    pub account: MonotonicCell<Account>,
    pub depths: DashMap<String, Snapshot<Depth>>,
}

impl Default for MarketData {
    fn default() -> Self {
        MarketData::new()
    }
}

impl MarketData {
    pub fn new() -> Self {
        MarketData {
            pairs: ArcSwap::from_pointee(Vec::new()),
            filters: ArcSwap::from_pointee(FiltersMap::new()),
            tickers: MonotonicCell::default(),
            account: MonotonicCell::default(),
            depths: DashMap::new(),
        }
    }

    pub fn install_exchange_info(&self, pairs: Vec<CoinPair>, filters: FiltersMap) {
        self.pairs.store(Arc::new(pairs));
        self.filters.store(Arc::new(filters));
    }

    pub fn filters_for(&self, symbol: &str) -> Option<TradingFilters> {
        self.filters.load().get(symbol).cloned()
    }

    pub fn apply_tickers(&self, request_ts_micros: i64, tickers: TickersMap) -> bool {
        self.tickers.apply(request_ts_micros, tickers)
    }

    /// Last-write-wins by the exchange's account update time.
    pub fn apply_account(&self, account: Account) -> bool {
        let stamp = account.updated_at_ms;
        self.account.apply(stamp, account)
    }

    pub fn apply_depth(&self, symbol: &str, request_ts_micros: i64, depth: Depth) -> bool {
        let mut entry = self
            .depths
            .entry(symbol.to_string())
            .or_insert_with(|| Snapshot {
                stamp: i64::MIN,
                value: Arc::new(Depth::default()),
            });
        if entry.stamp > request_ts_micros {
            return false;
        }
        *entry = Snapshot {
            stamp: request_ts_micros,
            value: Arc::new(depth),
        };
        true
    }

    pub fn depth(&self, symbol: &str) -> Option<Arc<Depth>> {
        self.depths.get(symbol).map(|s| Arc::clone(&s.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{Balance, Coin, Ticker};

    fn tickers(bid: f64) -> TickersMap {
        let mut map = TickersMap::new();
        map.insert(
            "ETHBTC".to_string(),
            Ticker {
                symbol: "ETHBTC".to_string(),
                bid_price: bid,
                bid_qty: 1.0,
                ask_price: bid + 0.001,
                ask_qty: 1.0,
            },
        );
        map
    }

    #[test]
    fn test_stale_ticker_frame_is_dropped() {
        let market = MarketData::new();
        assert!(market.apply_tickers(200, tickers(0.2)));
        assert!(!market.apply_tickers(100, tickers(0.1)));
        assert_eq!(market.tickers.value()["ETHBTC"].bid_price, 0.2);
        assert_eq!(market.tickers.stamp(), 200);
    }

    #[test]
    fn test_account_last_write_wins() {
        let market = MarketData::new();
        let fresh = Account::from_balances(
            vec![Balance { coin: Coin::new("BTC"), free: 2.0, locked: 0.0 }],
            2_000,
        );
        let stale = Account::from_balances(
            vec![Balance { coin: Coin::new("BTC"), free: 1.0, locked: 0.0 }],
            1_000,
        );
        assert!(market.apply_account(fresh));
        assert!(!market.apply_account(stale));
        assert_eq!(market.account.value().free(&Coin::new("BTC")), 2.0);
    }

    #[test]
    fn test_depth_is_monotonic_per_symbol() {
        let market = MarketData::new();
        let depth = |id| Depth { bids: vec![], asks: vec![], last_update_id: id };
        assert!(market.apply_depth("ETHBTC", 10, depth(1)));
        assert!(market.apply_depth("BNBBTC", 5, depth(7)));
        assert!(!market.apply_depth("ETHBTC", 9, depth(2)));
        assert_eq!(market.depth("ETHBTC").unwrap().last_update_id, 1);
        assert_eq!(market.depth("BNBBTC").unwrap().last_update_id, 7);
    }
}
