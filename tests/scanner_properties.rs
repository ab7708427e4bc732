use assert_approx_eq::assert_approx_eq;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use triangular_arb_bot::arbitrage::{
    build_triangles, evaluate_cycle, simulate_trade, ArbitrageScanner, ArbitrageStateStore,
    LegQuote,
};
use triangular_arb_bot::market::{
    Account, Balance, Coin, CoinPair, FeeSchedule, MarketData, Ticker, TickersMap,
};
use triangular_arb_bot::utils::floor_to_step;

fn ticker(symbol: &str, bid: f64, ask: f64) -> Ticker {
    Ticker {
        symbol: symbol.to_string(),
        bid_price: bid,
        bid_qty: 50.0,
        ask_price: ask,
        ask_qty: 50.0,
    }
}

fn book(eth_btc: (f64, f64), bnb_eth: (f64, f64), bnb_btc: (f64, f64)) -> TickersMap {
    let mut tickers = TickersMap::new();
    tickers.insert("ETHBTC".into(), ticker("ETHBTC", eth_btc.0, eth_btc.1));
    tickers.insert("BNBETH".into(), ticker("BNBETH", bnb_eth.0, bnb_eth.1));
    tickers.insert("BNBBTC".into(), ticker("BNBBTC", bnb_btc.0, bnb_btc.1));
    tickers
}

fn pairs() -> Vec<CoinPair> {
    vec![
        CoinPair::new("ETH", "BTC"),
        CoinPair::new("BNB", "ETH"),
        CoinPair::new("BNB", "BTC"),
    ]
}

#[test]
fn btc_eth_bnb_btc_matches_hand_computation() {
    let tickers = book((0.03, 0.031), (5.0, 5.1), (0.151, 0.153));
    let btc = Coin::new("BTC");
    let eth = Coin::new("ETH");
    let bnb = Coin::new("BNB");

    // BTC -> ETH buys ETHBTC at the ask, ETH -> BNB buys BNBETH at the ask,
    // BNB -> BTC sells BNBBTC at the bid
    let to_eth = LegQuote::new(&CoinPair::new("ETH", "BTC"), &btc, &tickers["ETHBTC"], 0.0).unwrap();
    let to_bnb = LegQuote::new(&CoinPair::new("BNB", "ETH"), &eth, &tickers["BNBETH"], 0.0).unwrap();
    let to_btc = LegQuote::new(&CoinPair::new("BNB", "BTC"), &bnb, &tickers["BNBBTC"], 0.0).unwrap();

    let after = [&to_eth, &to_bnb, &to_btc]
        .iter()
        .fold(1.0, |qty, leg| simulate_trade(qty, leg));
    let expected = 0.151 / (0.031 * 5.1);
    assert_approx_eq!(after, expected, 1e-9);
    assert!(after < 1.0);
}

#[test]
fn losing_cycles_never_enter_the_store() {
    let triangles = build_triangles(&pairs()).unwrap();
    let triangle = &triangles[0];

    // Both directions of the property-5 book lose money
    let tickers = book((0.03, 0.031), (5.0, 5.1), (0.151, 0.153));
    let eval = evaluate_cycle(triangle, &tickers, &FeeSchedule::zero()).unwrap();
    assert!(eval.qty_after <= eval.qty_before);

    let market = Arc::new(MarketData::new());
    let store = Arc::new(ArbitrageStateStore::new());
    market.apply_tickers(10, tickers);
    let scanner = ArbitrageScanner::new(
        Arc::clone(&market),
        Arc::clone(&store),
        triangles,
        FeeSchedule::zero(),
        2,
    );
    for _ in 0..5 {
        assert_eq!(scanner.scan_once(), 0);
    }
    assert!(store.is_empty());
}

#[test]
fn barely_losing_cycle_is_not_an_opportunity() {
    let triangles = build_triangles(&pairs()).unwrap();
    // ETH -> BTC -> BNB -> ETH: 0.04 / 0.008 * 0.1999 = 0.9995
    let tickers = book((0.04, 0.041), (0.1999, 0.21), (0.0079, 0.008));
    let eval = evaluate_cycle(&triangles[0], &tickers, &FeeSchedule::zero()).unwrap();
    assert!(!eval.is_profitable());
    assert!(eval.profit_relative < 0.0);
}

#[test]
fn fees_can_turn_a_cycle_unprofitable() {
    let triangles = build_triangles(&pairs()).unwrap();
    // 0.04 / 0.008 * 0.2005 = 1.0025 before fees
    let tickers = book((0.04, 0.041), (0.2005, 0.21), (0.0079, 0.008));
    let gross = evaluate_cycle(&triangles[0], &tickers, &FeeSchedule::zero()).unwrap();
    assert!(gross.is_profitable());
    assert_approx_eq!(gross.profit_relative, 0.0025, 1e-9);

    let fees = FeeSchedule {
        taker_fee: 0.001,
        native_token: Coin::new("BNB"),
        native_token_fee: 0.0005,
    };
    let net = evaluate_cycle(&triangles[0], &tickers, &fees).unwrap();
    assert!(!net.is_profitable());
}

#[test]
fn scanned_opportunity_counts_frames_from_zero() {
    let market = Arc::new(MarketData::new());
    let store = Arc::new(ArbitrageStateStore::new());
    market.apply_tickers(1, book((0.04, 0.041), (0.21, 0.22), (0.0079, 0.008)));
    market.apply_account(Account::from_balances(
        vec![
            Balance { coin: Coin::new("ETH"), free: 2.0, locked: 0.0 },
            Balance { coin: Coin::new("BTC"), free: 1.0, locked: 0.0 },
            Balance { coin: Coin::new("BNB"), free: 100.0, locked: 0.0 },
        ],
        1,
    ));
    let scanner = ArbitrageScanner::new(
        Arc::clone(&market),
        Arc::clone(&store),
        build_triangles(&pairs()).unwrap(),
        FeeSchedule::zero(),
        2,
    );
    scanner.scan_once();
    scanner.scan_once();
    scanner.scan_once();

    assert_eq!(store.len(), 1);
    let key = format!("BNBBTCETH_{:.6}", 0.04 / 0.008 * 0.21 - 1.0);
    let opportunity = store.get(&key).unwrap();
    assert_eq!(opportunity.frames_seen, 2);
    assert!(!opportunity.scheduled);
    assert_eq!(opportunity.balances, [2.0, 1.0, 100.0]);
}

#[test]
fn quantities_are_floored_to_the_step() {
    assert_eq!(floor_to_step(1.2347, 0.001), 1.234);
    assert_eq!(floor_to_step(1.2349999, 0.001), 1.234);
    assert_eq!(floor_to_step(0.3, 0.1), 0.3);
    assert_eq!(floor_to_step(42.0, 1.0), 42.0);
    assert!(floor_to_step(1.2347, 0.001) <= 1.2347);
}

#[tokio::test]
async fn tight_scan_loop_leaves_the_runtime_responsive() {
    let market = Arc::new(MarketData::new());
    let store = Arc::new(ArbitrageStateStore::new());
    market.apply_tickers(1, book((0.04, 0.041), (0.21, 0.22), (0.0079, 0.008)));
    let scanner = Arc::new(ArbitrageScanner::new(
        Arc::clone(&market),
        Arc::clone(&store),
        build_triangles(&pairs()).unwrap(),
        FeeSchedule::zero(),
        2,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let looping = Arc::clone(&scanner);
    let handle = tokio::task::spawn_blocking(move || looping.run(Duration::ZERO, shutdown_rx));

    // Timers on this single-threaded runtime still fire while the loop spins
    let started = Instant::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(started.elapsed() < Duration::from_secs(1));

    let mut frames = 0;
    for _ in 0..100 {
        if let Some(opportunity) = store.get(&format!("BNBBTCETH_{:.6}", 0.04 / 0.008 * 0.21 - 1.0)) {
            frames = opportunity.frames_seen;
            if frames >= 2 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(frames >= 2);

    shutdown_tx.send_replace(true);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
