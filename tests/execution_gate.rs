use chrono::Utc;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use triangular_arb_bot::arbitrage::{
    make_triangle, ArbitrageOpportunity, ArbitrageStateStore, ExecutionGate, GateConfig,
    GateDecision, Observation, Rejection,
};
use triangular_arb_bot::market::{
    CoinPair, MarketData, OrderRequest, OrderSide, OrderStatus, OrderType,
};
use triangular_arb_bot::testing::{exchange_info_for, MemorySink, MockExchange};

const PAIRS: [(&str, &str); 5] = [
    ("ETH", "BTC"),
    ("BNB", "ETH"),
    ("BNB", "BTC"),
    ("XRP", "BTC"),
    ("XRP", "ETH"),
];

struct Harness {
    gate: ExecutionGate,
    store: Arc<ArbitrageStateStore>,
    exchange: Arc<MockExchange>,
    sink: Arc<MemorySink>,
}

fn harness() -> Harness {
    let exchange = Arc::new(MockExchange::new(&PAIRS));
    let market = Arc::new(MarketData::new());
    let info = exchange_info_for(&PAIRS);
    market.install_exchange_info(info.pairs(), info.filters().unwrap());
    let store = Arc::new(ArbitrageStateStore::new());
    let sink = Arc::new(MemorySink::new());
    let gate = ExecutionGate::new(
        exchange.clone(),
        market,
        store.clone(),
        sink.clone(),
        GateConfig {
            min_frames_seen: 2,
            min_profit_relative: 0.0,
            test_mode: true,
        },
    );
    Harness { gate, store, exchange, sink }
}

/// Records the same observation three times so it clears the frame threshold.
fn ready(store: &ArbitrageStateStore, pairs: [(&str, &str); 3], legs: [(&str, OrderSide, f64); 3]) -> ArbitrageOpportunity {
    let triangle = make_triangle(
        &CoinPair::new(pairs[0].0, pairs[0].1),
        &CoinPair::new(pairs[1].0, pairs[1].1),
        &CoinPair::new(pairs[2].0, pairs[2].1),
    )
    .unwrap();
    let orders = legs.map(|(symbol, side, price)| OrderRequest {
        symbol: symbol.to_string(),
        side,
        order_type: OrderType::Limit,
        qty: 1.0,
        price,
    });
    let observation = Observation {
        triangle: Arc::new(triangle),
        profit_relative: 0.004,
        qty_before: 1.0,
        qty_after: 1.004,
        orders,
        balances: [1.0, 1.0, 1.0],
    };
    let now = Utc::now();
    store.upsert(observation.clone(), now);
    store.upsert(observation.clone(), now);
    store.upsert(observation, now)
}

fn bnb_cycle(store: &ArbitrageStateStore) -> ArbitrageOpportunity {
    ready(
        store,
        [("ETH", "BTC"), ("BNB", "ETH"), ("BNB", "BTC")],
        [
            ("ETHBTC", OrderSide::Sell, 0.04),
            ("BNBBTC", OrderSide::Buy, 0.008),
            ("BNBETH", OrderSide::Sell, 0.21),
        ],
    )
}

fn xrp_cycle(store: &ArbitrageStateStore) -> ArbitrageOpportunity {
    ready(
        store,
        [("ETH", "BTC"), ("XRP", "BTC"), ("XRP", "ETH")],
        [
            ("ETHBTC", OrderSide::Sell, 0.04),
            ("XRPBTC", OrderSide::Buy, 0.0002),
            ("XRPETH", OrderSide::Sell, 0.005),
        ],
    )
}

#[tokio::test]
async fn one_execution_at_a_time() {
    let h = harness();
    let first = bnb_cycle(&h.store);
    let second = xrp_cycle(&h.store);
    assert!(h.gate.should_execute(&first).is_ok());
    assert!(h.gate.should_execute(&second).is_ok());

    h.exchange.hold_orders();
    let handle = match h.gate.submit(&first) {
        GateDecision::Submitted(handle) => handle,
        GateDecision::Rejected(r) => panic!("first rejected: {}", r),
    };
    assert!(h.gate.is_busy());

    // While the first is in flight the second is turned away
    match h.gate.submit(&second) {
        GateDecision::Rejected(Rejection::Busy) => {}
        other => panic!("expected busy, got {:?}", other),
    }
    assert_eq!(h.gate.should_execute(&second), Err(Rejection::Busy));
    assert!(!h.store.is_scheduled(&second.key));

    // Let the three legs reach the exchange, then release them
    let mut waited = 0;
    while h.exchange.submitted().len() < 3 && waited < 200 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        waited += 1;
    }
    assert_eq!(h.exchange.submitted().len(), 3);
    assert!(h.gate.is_busy());
    h.exchange.release_orders();

    let outcomes = handle.wait().await;
    assert_eq!(outcomes.len(), 3);
    assert!(!h.gate.is_busy());
    assert_eq!(h.gate.legs_in_flight(), 0);

    // Now the second one goes through
    let handle = match h.gate.submit(&second) {
        GateDecision::Submitted(handle) => handle,
        GateDecision::Rejected(r) => panic!("second rejected: {}", r),
    };
    handle.wait().await;
    assert_eq!(h.exchange.submitted().len(), 6);
    assert!(h.store.is_scheduled(&first.key));
    assert!(h.store.is_scheduled(&second.key));
}

#[tokio::test]
async fn client_order_ids_are_unique_per_leg() {
    let h = harness();
    let opp = bnb_cycle(&h.store);
    let handle = match h.gate.submit(&opp) {
        GateDecision::Submitted(handle) => handle,
        GateDecision::Rejected(r) => panic!("rejected: {}", r),
    };
    handle.wait().await;

    let mut submitted = h.exchange.submitted();
    submitted.sort_by_key(|s| s.timestamp_ms);
    let stamps: Vec<i64> = submitted.iter().map(|s| s.timestamp_ms).collect();
    assert_eq!(stamps[1], stamps[0] + 1);
    assert_eq!(stamps[2], stamps[0] + 2);
    for s in &submitted {
        assert_eq!(s.client_order_id, format!("{}_{}", s.order.symbol, s.timestamp_ms));
        assert_eq!(s.order.order_type, OrderType::Limit);
    }

    let new_events: Vec<_> = h
        .sink
        .order_events()
        .into_iter()
        .filter(|e| e.status == OrderStatus::New)
        .collect();
    assert_eq!(new_events.len(), 3);
    assert!(new_events.iter().all(|e| e.arb_id == opp.id));
}

#[tokio::test]
async fn partial_failure_is_reported_not_rolled_back() {
    let h = harness();
    h.exchange.fail_orders_for("BNBETH");
    let opp = bnb_cycle(&h.store);
    let handle = match h.gate.submit(&opp) {
        GateDecision::Submitted(handle) => handle,
        GateDecision::Rejected(r) => panic!("rejected: {}", r),
    };
    let outcomes = handle.wait().await;

    let failed: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].symbol, "BNBETH");
    // Exactly the three legs went out, nothing compensating
    assert_eq!(h.exchange.submitted().len(), 3);

    let terminal: Vec<_> = h
        .sink
        .order_events()
        .into_iter()
        .filter(|e| e.status != OrderStatus::New)
        .collect();
    assert_eq!(terminal.len(), 3);
    assert_eq!(terminal.iter().filter(|e| e.status == OrderStatus::Error).count(), 1);
    assert!(!h.gate.is_busy());
}
