//! Execution gate.
//!
//! Decides whether an opportunity's three orders go out and, if so, sends them with at most one
//! opportunity in flight system-wide. The single permit is taken before any per-opportunity
//! check and handed to the legs; the last leg to finish releases it.
//!
//! Legs are independent: a failed leg is reported, the others are not cancelled and nothing is
//! rolled back.

use crate::arbitrage::state::{ArbitrageOpportunity, ArbitrageStateStore};
use crate::audit::{AuditEvent, EventSink, OrderEvent};
use crate::error::ArbError;
use crate::exchange::ExchangeApi;
use crate::market::{FilterCheck, MarketData, OrderRequest, OrderStatus, TimeInForce};
use crate::utils::unix_millis;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    NotEnoughFrames { seen: u32, required: u32 },
    Busy,
    AlreadyScheduled,
    MissingFilter { symbol: String },
    FilterViolation { symbol: String, check: FilterCheck },
    BelowMinProfit { profit: f64, min: f64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotEnoughFrames { seen, required } => {
                write!(f, "seen in {} frames, {} required", seen, required)
            }
            Rejection::Busy => f.write_str("another execution is in flight"),
            Rejection::AlreadyScheduled => f.write_str("already scheduled"),
            Rejection::MissingFilter { symbol } => write!(f, "no trading filters for {}", symbol),
            Rejection::FilterViolation { symbol, check } => write!(f, "{}: {}", symbol, check),
            Rejection::BelowMinProfit { profit, min } => {
                write!(f, "profit {:.6} not above {:.6}", profit, min)
            }
        }
    }
}

impl Rejection {
    /// Rejections that point at broken local state rather than market conditions.
    pub fn as_error(&self) -> Option<ArbError> {
        match self {
            Rejection::MissingFilter { symbol } => Some(ArbError::MissingFilter(symbol.clone())),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct LegOutcome {
    pub symbol: String,
    pub client_order_id: String,
    pub result: Result<crate::market::OrderAck, ArbError>,
}

/// The three submitted legs of one opportunity.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub opportunity_id: String,
    legs: Vec<JoinHandle<LegOutcome>>,
}

impl ExecutionHandle {
    /// Waits for every leg. Nothing is cancelled when one fails.
    pub async fn wait(self) -> Vec<LegOutcome> {
        let mut outcomes = Vec::with_capacity(self.legs.len());
        for leg in self.legs {
            match leg.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Leg task for {} failed to join: {}", self.opportunity_id, e),
            }
        }
        outcomes
    }
}

#[derive(Debug)]
pub enum GateDecision {
    Submitted(ExecutionHandle),
    Rejected(Rejection),
}

impl GateDecision {
    pub fn is_submitted(&self) -> bool {
        matches!(self, GateDecision::Submitted(_))
    }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub min_frames_seen: u32,
    pub min_profit_relative: f64,
    pub test_mode: bool,
}

pub struct ExecutionGate {
    exchange: Arc<dyn ExchangeApi>,
    market: Arc<MarketData>,
    store: Arc<ArbitrageStateStore>,
    sink: Arc<dyn EventSink>,
    config: GateConfig,
    permit: Arc<Semaphore>,
    legs_in_flight: Arc<AtomicUsize>,
}

impl ExecutionGate {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        market: Arc<MarketData>,
        store: Arc<ArbitrageStateStore>,
        sink: Arc<dyn EventSink>,
        config: GateConfig,
    ) -> Self {
        info!(
            "Execution gate ready: min_frames={} min_profit={} test_mode={}",
            config.min_frames_seen, config.min_profit_relative, config.test_mode
        );
        ExecutionGate {
            exchange,
            market,
            store,
            sink,
            config,
            permit: Arc::new(Semaphore::new(1)),
            legs_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.permit.available_permits() == 0
    }

    pub fn legs_in_flight(&self) -> usize {
        self.legs_in_flight.load(Ordering::SeqCst)
    }

    fn check_frames(&self, opp: &ArbitrageOpportunity) -> Result<(), Rejection> {
        if opp.frames_seen < self.config.min_frames_seen {
            return Err(Rejection::NotEnoughFrames {
                seen: opp.frames_seen,
                required: self.config.min_frames_seen,
            });
        }
        Ok(())
    }

    fn check_candidate(&self, opp: &ArbitrageOpportunity) -> Result<(), Rejection> {
        if opp.scheduled || self.store.is_scheduled(&opp.key) {
            return Err(Rejection::AlreadyScheduled);
        }
        for order in &opp.orders {
            let filters = self
                .market
                .filters_for(&order.symbol)
                .ok_or_else(|| Rejection::MissingFilter {
                    symbol: order.symbol.clone(),
                })?;
            let check = filters.check(order.price, order.qty);
            if !check.is_ok() {
                return Err(Rejection::FilterViolation {
                    symbol: order.symbol.clone(),
                    check,
                });
            }
        }
        if opp.profit_relative <= self.config.min_profit_relative {
            return Err(Rejection::BelowMinProfit {
                profit: opp.profit_relative,
                min: self.config.min_profit_relative,
            });
        }
        Ok(())
    }

    /// The admission predicate without side effects.
    pub fn should_execute(&self, opp: &ArbitrageOpportunity) -> Result<(), Rejection> {
        self.check_frames(opp)?;
        if self.is_busy() {
            return Err(Rejection::Busy);
        }
        self.check_candidate(opp)
    }

    fn log_rejection(&self, opp: &ArbitrageOpportunity, rejection: &Rejection) {
        match rejection {
            Rejection::NotEnoughFrames { .. } | Rejection::Busy | Rejection::AlreadyScheduled => {
                debug!("Skipping {}: {}", opp.key, rejection)
            }
            Rejection::MissingFilter { .. } => {
                if let Some(err) = rejection.as_error() {
                    error!("🚨 Cannot validate {}: {}", opp.key, err);
                }
            }
            Rejection::FilterViolation { .. } | Rejection::BelowMinProfit { .. } => {
                info!("Rejected {}: {}", opp.key, rejection)
            }
        }
    }

    /// Admits `opp` and sends its legs, or says why not. Must be called inside a tokio runtime.
    pub fn submit(&self, opp: &ArbitrageOpportunity) -> GateDecision {
        if let Err(rejection) = self.check_frames(opp) {
            self.log_rejection(opp, &rejection);
            return GateDecision::Rejected(rejection);
        }
        let permit = match Arc::clone(&self.permit).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.log_rejection(opp, &Rejection::Busy);
                return GateDecision::Rejected(Rejection::Busy);
            }
        };
        // From here on, returning drops `permit` and frees the gate
        if let Err(rejection) = self.check_candidate(opp) {
            self.log_rejection(opp, &rejection);
            return GateDecision::Rejected(rejection);
        }
        if !self.store.mark_scheduled(&opp.key) {
            self.log_rejection(opp, &Rejection::AlreadyScheduled);
            return GateDecision::Rejected(Rejection::AlreadyScheduled);
        }
        GateDecision::Submitted(self.launch(opp, permit))
    }

    fn balances_now(&self, opp: &ArbitrageOpportunity) -> [f64; 3] {
        let account = self.market.account.value();
        let [a, b, c] = opp.triangle.coins();
        [account.free(a), account.free(b), account.free(c)]
    }

    fn launch(&self, opp: &ArbitrageOpportunity, permit: OwnedSemaphorePermit) -> ExecutionHandle {
        info!(
            "🚀 Started execution for {} (profit {:.6}): {} | {} | {}",
            opp.key, opp.profit_relative, opp.orders[0], opp.orders[1], opp.orders[2]
        );
        let base_ts = unix_millis();
        let remaining = Arc::new(AtomicUsize::new(opp.orders.len()));
        let permit = Arc::new(Mutex::new(Some(permit)));
        self.legs_in_flight.store(opp.orders.len(), Ordering::SeqCst);

        let legs = opp
            .orders
            .iter()
            .enumerate()
            .map(|(i, order)| {
                // Distinct timestamps keep client order ids unique within one millisecond
                let ts = base_ts + i as i64;
                let client_order_id = format!("{}_{}", order.symbol, ts);
                self.sink.emit(AuditEvent::OrderStatusChange(new_order_event(
                    opp,
                    order,
                    &client_order_id,
                    self.balances_now(opp),
                )));

                let leg = LegTask {
                    exchange: Arc::clone(&self.exchange),
                    market: Arc::clone(&self.market),
                    sink: Arc::clone(&self.sink),
                    opp: opp.clone(),
                    order: order.clone(),
                    client_order_id,
                    ts,
                    test_mode: self.config.test_mode,
                    remaining: Arc::clone(&remaining),
                    legs_in_flight: Arc::clone(&self.legs_in_flight),
                    permit: Arc::clone(&permit),
                };
                tokio::spawn(leg.run())
            })
            .collect();

        ExecutionHandle {
            opportunity_id: opp.id.clone(),
            legs,
        }
    }
}

fn new_order_event(
    opp: &ArbitrageOpportunity,
    order: &OrderRequest,
    client_order_id: &str,
    balances: [f64; 3],
) -> OrderEvent {
    OrderEvent {
        arb_id: opp.id.clone(),
        client_order_id: client_order_id.to_string(),
        symbol: order.symbol.clone(),
        side: order.side,
        order_type: order.order_type,
        status: OrderStatus::New,
        price: order.price,
        orig_qty: order.qty,
        executed_qty: 0.0,
        cumulative_quote_qty: 0.0,
        time_in_force: TimeInForce::Ioc,
        fills: Vec::new(),
        error_message: None,
        transact_time: Utc::now(),
        balances,
    }
}

struct LegTask {
    exchange: Arc<dyn ExchangeApi>,
    market: Arc<MarketData>,
    sink: Arc<dyn EventSink>,
    opp: ArbitrageOpportunity,
    order: OrderRequest,
    client_order_id: String,
    ts: i64,
    test_mode: bool,
    remaining: Arc<AtomicUsize>,
    legs_in_flight: Arc<AtomicUsize>,
    permit: Arc<Mutex<Option<OwnedSemaphorePermit>>>,
}

impl LegTask {
    async fn run(self) -> LegOutcome {
        let result = self
            .exchange
            .new_order(&self.order, &self.client_order_id, self.ts, self.test_mode)
            .await;

        let account = self.market.account.value();
        let [a, b, c] = self.opp.triangle.coins();
        let balances = [account.free(a), account.free(b), account.free(c)];
        let mut event = new_order_event(&self.opp, &self.order, &self.client_order_id, balances);
        match &result {
            Ok(ack) => {
                info!("✅ Order {} {:?}", ack.client_order_id, ack.status);
                event.status = ack.status;
                event.price = ack.price;
                event.orig_qty = ack.orig_qty;
                event.executed_qty = ack.executed_qty;
                event.cumulative_quote_qty = ack.cumulative_quote_qty;
                event.time_in_force = ack.time_in_force;
                event.fills = ack.fills.clone();
            }
            Err(e) => {
                warn!("❌ Order {} error: {}", self.client_order_id, e);
                event.status = OrderStatus::Error;
                event.error_message = Some(e.to_string());
            }
        }
        event.transact_time = Utc::now();
        self.sink.emit(AuditEvent::OrderStatusChange(event));

        self.legs_in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            let released = match self.permit.lock() {
                Ok(mut slot) => slot.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            drop(released);
            info!("Finished execution for {}", self.opp.key);
        }

        LegOutcome {
            symbol: self.order.symbol,
            client_order_id: self.client_order_id,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::state::Observation;
    use crate::arbitrage::triangle::make_triangle;
    use crate::market::{CoinPair, OrderSide, OrderType};
    use crate::testing::{MemorySink, MockExchange};

    fn setup(min_profit: f64) -> (ExecutionGate, Arc<ArbitrageStateStore>, Arc<MockExchange>, Arc<MemorySink>) {
        let exchange = Arc::new(MockExchange::new(&[("ETH", "BTC"), ("BNB", "ETH"), ("BNB", "BTC")]));
        let market = Arc::new(MarketData::new());
        let info = crate::testing::exchange_info_for(&[("ETH", "BTC"), ("BNB", "ETH"), ("BNB", "BTC")]);
        market.install_exchange_info(info.pairs(), info.filters().unwrap());
        let store = Arc::new(ArbitrageStateStore::new());
        let sink = Arc::new(MemorySink::new());
        let gate = ExecutionGate::new(
            exchange.clone(),
            market,
            store.clone(),
            sink.clone(),
            GateConfig { min_frames_seen: 2, min_profit_relative: min_profit, test_mode: true },
        );
        (gate, store, exchange, sink)
    }

    fn seen_three_times(store: &ArbitrageStateStore, qty: f64) -> ArbitrageOpportunity {
        let triangle = Arc::new(
            make_triangle(
                &CoinPair::new("ETH", "BTC"),
                &CoinPair::new("BNB", "ETH"),
                &CoinPair::new("BNB", "BTC"),
            )
            .unwrap(),
        );
        let order = |symbol: &str, side, price| OrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            qty,
            price,
        };
        let observation = Observation {
            triangle,
            profit_relative: 0.01,
            qty_before: 1.0,
            qty_after: 1.01,
            orders: [
                order("ETHBTC", OrderSide::Sell, 0.04),
                order("BNBBTC", OrderSide::Buy, 0.008),
                order("BNBETH", OrderSide::Sell, 0.21),
            ],
            balances: [1.0, 1.0, 1.0],
        };
        let now = Utc::now();
        store.upsert(observation.clone(), now);
        store.upsert(observation.clone(), now);
        store.upsert(observation, now)
    }

    #[tokio::test]
    async fn test_fresh_opportunity_needs_frames() {
        let (gate, store, _, _) = setup(0.0);
        let opp = seen_three_times(&store, 1.0);
        let mut fresh = opp.clone();
        fresh.frames_seen = 1;
        assert_eq!(
            gate.should_execute(&fresh),
            Err(Rejection::NotEnoughFrames { seen: 1, required: 2 })
        );
    }

    #[tokio::test]
    async fn test_submit_sends_three_ioc_legs_and_releases() {
        let (gate, store, exchange, sink) = setup(0.0);
        let opp = seen_three_times(&store, 1.0);
        assert!(gate.should_execute(&opp).is_ok());

        let handle = match gate.submit(&opp) {
            GateDecision::Submitted(handle) => handle,
            GateDecision::Rejected(r) => panic!("rejected: {}", r),
        };
        let outcomes = handle.wait().await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert!(!gate.is_busy());
        assert_eq!(gate.legs_in_flight(), 0);
        assert!(store.is_scheduled(&opp.key));

        let submitted = exchange.submitted();
        assert_eq!(submitted.len(), 3);
        assert!(submitted.iter().all(|s| s.test_mode));
        let mut ids: Vec<String> = submitted.iter().map(|s| s.client_order_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        // One NEW and one terminal event per leg
        let events = sink.order_events();
        assert_eq!(events.len(), 6);
        assert_eq!(events.iter().filter(|e| e.status == OrderStatus::New).count(), 3);
        assert_eq!(events.iter().filter(|e| e.status == OrderStatus::Filled).count(), 3);

        // Scheduled opportunities never go out twice
        let again = store.get(&opp.key).unwrap();
        assert!(!gate.submit(&again).is_submitted());
    }

    #[tokio::test]
    async fn test_filter_violation_rejects_and_frees_gate() {
        let (gate, store, exchange, _) = setup(0.0);
        // 1.2345 is not a multiple of the 0.001 step
        let opp = seen_three_times(&store, 1.2345);
        match gate.submit(&opp) {
            GateDecision::Rejected(Rejection::FilterViolation { check, .. }) => {
                assert_eq!(check, FilterCheck::StepSize)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!gate.is_busy());
        assert!(!store.is_scheduled(&opp.key));
        assert!(exchange.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_min_profit_threshold_is_exclusive() {
        let (gate, store, _, _) = setup(0.01);
        let opp = seen_three_times(&store, 1.0);
        assert!(matches!(
            gate.should_execute(&opp),
            Err(Rejection::BelowMinProfit { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_filter_is_a_typed_rejection() {
        let exchange = Arc::new(MockExchange::new(&[]));
        let store = Arc::new(ArbitrageStateStore::new());
        let gate = ExecutionGate::new(
            exchange,
            Arc::new(MarketData::new()),
            store.clone(),
            Arc::new(MemorySink::new()),
            GateConfig { min_frames_seen: 2, min_profit_relative: 0.0, test_mode: true },
        );
        let opp = seen_three_times(&store, 1.0);
        assert_eq!(
            gate.should_execute(&opp),
            Err(Rejection::MissingFilter { symbol: "ETHBTC".to_string() })
        );
        let rejection = Rejection::MissingFilter { symbol: "ETHBTC".to_string() };
        assert!(matches!(rejection.as_error(), Some(ArbError::MissingFilter(_))));
        assert!(Rejection::Busy.as_error().is_none());
    }

    #[tokio::test]
    async fn test_failed_leg_is_reported_without_rollback() {
        let (gate, store, exchange, sink) = setup(0.0);
        exchange.fail_orders_for("BNBBTC");
        let opp = seen_three_times(&store, 1.0);
        let handle = match gate.submit(&opp) {
            GateDecision::Submitted(handle) => handle,
            GateDecision::Rejected(r) => panic!("rejected: {}", r),
        };
        let outcomes = handle.wait().await;
        assert_eq!(outcomes.iter().filter(|o| o.result.is_err()).count(), 1);
        assert_eq!(exchange.submitted().len(), 3);

        let errors: Vec<OrderEvent> = sink
            .order_events()
            .into_iter()
            .filter(|e| e.status == OrderStatus::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].symbol, "BNBBTC");
        assert!(errors[0].error_message.as_deref().unwrap_or("").contains("-2010"));
        assert!(!gate.is_busy());
    }
}
