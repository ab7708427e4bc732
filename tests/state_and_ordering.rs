use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use triangular_arb_bot::arbitrage::{
    make_triangle, spawn_reaper, ArbitrageStateStore, Observation,
};
use triangular_arb_bot::audit::EventSink;
use triangular_arb_bot::market::{
    Account, Balance, Coin, CoinPair, MarketData, OrderRequest, OrderSide, OrderType, Ticker,
    TickersMap,
};
use triangular_arb_bot::testing::MemorySink;

fn observation(profit: f64) -> Observation {
    let triangle = make_triangle(
        &CoinPair::new("ETH", "BTC"),
        &CoinPair::new("BNB", "ETH"),
        &CoinPair::new("BNB", "BTC"),
    )
    .unwrap();
    let order = |symbol: &str, side| OrderRequest {
        symbol: symbol.to_string(),
        side,
        order_type: OrderType::Limit,
        qty: 1.0,
        price: 0.1,
    };
    Observation {
        triangle: Arc::new(triangle),
        profit_relative: profit,
        qty_before: 1.0,
        qty_after: 1.0 + profit,
        orders: [
            order("ETHBTC", OrderSide::Sell),
            order("BNBBTC", OrderSide::Buy),
            order("BNBETH", OrderSide::Sell),
        ],
        balances: [1.0, 1.0, 1.0],
    }
}

fn tickers(bid: f64) -> TickersMap {
    let mut map = TickersMap::new();
    map.insert(
        "ETHBTC".to_string(),
        Ticker {
            symbol: "ETHBTC".to_string(),
            bid_price: bid,
            bid_qty: 1.0,
            ask_price: bid * 1.01,
            ask_qty: 1.0,
        },
    );
    map
}

#[test]
fn stale_entries_are_evicted_and_fresh_ones_kept() {
    let store = ArbitrageStateStore::new();
    let start = Utc::now();
    let old = store.upsert(observation(0.01), start);
    let fresh = store.upsert(observation(0.02), start + ChronoDuration::milliseconds(900));

    let evicted = store.evict_stale(start + ChronoDuration::milliseconds(1500), Duration::from_secs(1));
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].key, old.key);
    assert!(store.get(&old.key).is_none());
    assert!(store.get(&fresh.key).is_some());
}

#[tokio::test]
async fn reaper_reports_vanished_opportunities() {
    let store = Arc::new(ArbitrageStateStore::new());
    let sink = Arc::new(MemorySink::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let opp = store.upsert(observation(0.01), Utc::now());
    store.upsert(observation(0.01), Utc::now());

    let reaper = spawn_reaper(
        Arc::clone(&store),
        Arc::clone(&sink) as Arc<dyn EventSink>,
        Duration::from_millis(50),
        Duration::from_millis(10),
        shutdown_rx,
    );

    let mut waited = 0;
    while store.get(&opp.key).is_some() && waited < 200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert!(store.get(&opp.key).is_none());
    assert!(store.is_empty());

    shutdown_tx.send(true).unwrap();
    reaper.await.unwrap();

    let completed = sink.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].key, opp.key);
    assert_eq!(completed[0].frames_seen, 1);
    assert_eq!(completed[0].triangle_key, "BNBBTCETH");
}

#[test]
fn out_of_order_ticker_frames_keep_the_latest_request() {
    let market = MarketData::new();
    // Responses arrive as 300, 100, 200 by request time
    assert!(market.apply_tickers(300, tickers(0.3)));
    assert!(!market.apply_tickers(100, tickers(0.1)));
    assert!(!market.apply_tickers(200, tickers(0.2)));

    let current = market.tickers.load();
    assert_eq!(current.stamp, 300);
    assert_eq!(current.value["ETHBTC"].bid_price, 0.3);
}

#[test]
fn out_of_order_account_frames_keep_the_latest_update() {
    let market = MarketData::new();
    let account = |free: f64, at: i64| {
        Account::from_balances(
            vec![Balance { coin: Coin::new("BTC"), free, locked: 0.0 }],
            at,
        )
    };
    assert!(market.apply_account(account(2.0, 2_000)));
    assert!(!market.apply_account(account(1.0, 1_000)));
    assert_eq!(market.account.value().free(&Coin::new("BTC")), 2.0);
    assert!(market.apply_account(account(3.0, 3_000)));
    assert_eq!(market.account.value().free(&Coin::new("BTC")), 3.0);
}

#[test]
fn out_of_order_depth_frames_are_dropped_per_symbol() {
    use triangular_arb_bot::market::{Depth, DepthLevel};
    let market = MarketData::new();
    let depth = |id: u64| Depth {
        bids: vec![DepthLevel { price: 0.05, qty: 1.0 }],
        asks: vec![DepthLevel { price: 0.051, qty: 1.0 }],
        last_update_id: id,
    };
    assert!(market.apply_depth("ETHBTC", 20, depth(2)));
    assert!(!market.apply_depth("ETHBTC", 10, depth(1)));
    // Another symbol has its own ordering
    assert!(market.apply_depth("BNBBTC", 10, depth(9)));
    assert_eq!(market.depth("ETHBTC").unwrap().last_update_id, 2);
    assert_eq!(market.depth("BNBBTC").unwrap().last_update_id, 9);
}
