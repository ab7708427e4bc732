//! Arbitrage scanner.
//!
//! Every cycle prices each triangle against the latest ticker snapshot, starting from one unit
//! of coin A and trading A -> B -> C -> A. Profitable cycles are sized against balances and top
//! of book liquidity, turned into three limit orders and recorded in the state store.

use crate::arbitrage::execution::{ExecutionGate, GateDecision};
use crate::arbitrage::state::{ArbitrageStateStore, Observation};
use crate::arbitrage::triangle::Triangle;
use crate::market::{
    Account, Coin, CoinPair, FeeSchedule, FiltersMap, MarketData, OrderRequest, OrderSide,
    OrderType, Ticker, TickersMap,
};
use crate::utils::floor_to_step;
use arc_swap::ArcSwap;
use chrono::Utc;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// One leg priced against the book.
#[derive(Debug, Clone, PartialEq)]
pub struct LegQuote {
    pub symbol: String,
    pub from: Coin,
    pub to: Coin,
    pub side: OrderSide,
    /// Limit price: bid when selling the base coin, ask when buying it
    pub price: f64,
    pub fee: f64,
    /// Units of `to` received per unit of `from`, after fees
    pub rate: f64,
    /// Top of book liquidity expressed in units of `from`
    pub liquidity: f64,
}

impl LegQuote {
    pub fn new(pair: &CoinPair, from: &Coin, ticker: &Ticker, fee: f64) -> Option<LegQuote> {
        if !ticker.is_usable() {
            return None;
        }
        let (side, to, price, gross_rate, liquidity) = if &pair.base == from {
            (OrderSide::Sell, &pair.quote, ticker.bid_price, ticker.bid_price, ticker.bid_qty)
        } else if &pair.quote == from {
            (
                OrderSide::Buy,
                &pair.base,
                ticker.ask_price,
                1.0 / ticker.ask_price,
                ticker.ask_qty * ticker.ask_price,
            )
        } else {
            return None;
        };
        Some(LegQuote {
            symbol: pair.symbol.clone(),
            from: from.clone(),
            to: to.clone(),
            side,
            price,
            fee,
            rate: gross_rate * (1.0 - fee),
            liquidity,
        })
    }

    /// Base-asset order quantity for giving up `from_amount` of the leg's `from` coin.
    pub fn order_qty(&self, from_amount: f64) -> f64 {
        match self.side {
            OrderSide::Sell => from_amount,
            OrderSide::Buy => from_amount / self.price,
        }
    }
}

/// Trades `qty` of the leg's `from` coin and returns the amount of `to` received.
pub fn simulate_trade(qty: f64, leg: &LegQuote) -> f64 {
    qty * leg.rate
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleEvaluation {
    pub legs: [LegQuote; 3],
    pub qty_before: f64,
    pub qty_after: f64,
    pub profit_relative: f64,
}

impl CycleEvaluation {
    pub fn is_profitable(&self) -> bool {
        self.qty_after > self.qty_before
    }

    /// Largest starting amount of coin A that no balance and no top-of-book level can refuse.
    pub fn max_start_qty(&self, balances: [f64; 3]) -> f64 {
        let cumulative = [1.0, self.legs[0].rate, self.legs[0].rate * self.legs[1].rate];
        (0..3)
            .flat_map(|i| [balances[i] / cumulative[i], self.legs[i].liquidity / cumulative[i]])
            .fold(f64::INFINITY, f64::min)
            .max(0.0)
    }

    /// Limit orders for starting with `start_qty` of coin A, quantities floored to each
    /// symbol's step size.
    pub fn orders(&self, start_qty: f64, filters: &FiltersMap) -> [OrderRequest; 3] {
        let mut from_amount = start_qty;
        let mut build = |leg: &LegQuote| {
            let step = filters.get(&leg.symbol).map(|f| f.step_size).unwrap_or(0.0);
            let order = OrderRequest {
                symbol: leg.symbol.clone(),
                side: leg.side,
                order_type: OrderType::Limit,
                qty: floor_to_step(leg.order_qty(from_amount), step),
                price: leg.price,
            };
            from_amount = simulate_trade(from_amount, leg);
            order
        };
        let first = build(&self.legs[0]);
        let second = build(&self.legs[1]);
        let third = build(&self.legs[2]);
        [first, second, third]
    }
}

/// Prices the cycle A -> B -> C -> A from one unit of A. `None` while any ticker is missing.
pub fn evaluate_cycle(
    triangle: &Triangle,
    tickers: &TickersMap,
    fees: &FeeSchedule,
) -> Option<CycleEvaluation> {
    let mut quotes = Vec::with_capacity(3);
    for (pair, from) in triangle.legs() {
        let ticker = tickers.get(&pair.symbol)?;
        quotes.push(LegQuote::new(pair, from, ticker, fees.fee_for(pair))?);
    }
    let legs: [LegQuote; 3] = quotes.try_into().ok()?;

    let qty_before = 1.0;
    let qty_after = legs
        .iter()
        .fold(qty_before, |qty, leg| simulate_trade(qty, leg));
    Some(CycleEvaluation {
        profit_relative: (qty_after - qty_before) / qty_before,
        legs,
        qty_before,
        qty_after,
    })
}

pub struct ArbitrageScanner {
    market: Arc<MarketData>,
    store: Arc<ArbitrageStateStore>,
    triangles: ArcSwap<Vec<Arc<Triangle>>>,
    fees: FeeSchedule,
    gate: Option<Arc<ExecutionGate>>,
    min_frames_seen: u32,
}

impl ArbitrageScanner {
    pub fn new(
        market: Arc<MarketData>,
        store: Arc<ArbitrageStateStore>,
        triangles: Vec<Triangle>,
        fees: FeeSchedule,
        min_frames_seen: u32,
    ) -> Self {
        ArbitrageScanner {
            market,
            store,
            triangles: ArcSwap::from_pointee(triangles.into_iter().map(Arc::new).collect()),
            fees,
            gate: None,
            min_frames_seen,
        }
    }

    /// Opportunities seen often enough are handed to `gate`.
    pub fn with_gate(mut self, gate: Arc<ExecutionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn replace_triangles(&self, triangles: Vec<Triangle>) {
        info!("Scanner now tracks {} triangles", triangles.len());
        self.triangles
            .store(Arc::new(triangles.into_iter().map(Arc::new).collect()));
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.load().len()
    }

    fn observe(
        &self,
        triangle: &Arc<Triangle>,
        tickers: &TickersMap,
        account: &Account,
        filters: &FiltersMap,
    ) -> Option<Observation> {
        let evaluation = evaluate_cycle(triangle, tickers, &self.fees)?;
        if !evaluation.is_profitable() {
            return None;
        }
        let balances = [
            account.free(&triangle.coin_a),
            account.free(&triangle.coin_b),
            account.free(&triangle.coin_c),
        ];
        let start_qty = evaluation.max_start_qty(balances);
        Some(Observation {
            triangle: Arc::clone(triangle),
            profit_relative: evaluation.profit_relative,
            qty_before: evaluation.qty_before,
            qty_after: evaluation.qty_after,
            orders: evaluation.orders(start_qty, filters),
            balances,
        })
    }

    /// One pass over every triangle. Returns how many profitable observations were recorded.
    pub fn scan_once(&self) -> usize {
        let triangles = self.triangles.load_full();
        let tickers = self.market.tickers.value();
        if tickers.is_empty() {
            return 0;
        }
        let account = self.market.account.value();
        let filters = self.market.filters.load_full();

        let observations: Vec<Observation> = triangles
            .par_iter()
            .filter_map(|t| self.observe(t, &tickers, &account, &filters))
            .collect();

        let now = Utc::now();
        let count = observations.len();
        for observation in observations {
            let opportunity = self.store.upsert(observation, now);
            if let Some(gate) = &self.gate {
                if opportunity.frames_seen >= self.min_frames_seen && !opportunity.scheduled {
                    if let GateDecision::Submitted(_) = gate.submit(&opportunity) {
                        debug!("Submitted {} from scanner", opportunity.key);
                    }
                }
            }
        }
        count
    }

    /// Scans until `shutdown` flips. Blocks the calling thread, so run it on a dedicated one
    /// (`spawn_blocking`). A zero `interval` only yields between cycles.
    pub fn run(&self, interval: Duration, shutdown: watch::Receiver<bool>) {
        info!(
            "🔍 Looking for arb opportunities over {} triangles...",
            self.triangle_count()
        );
        let mut cycles: u64 = 0;
        let mut last_report = Instant::now();
        while !*shutdown.borrow() {
            let found = self.scan_once();
            cycles += 1;
            if found > 0 {
                debug!("Cycle {}: {} profitable triangles", cycles, found);
            }
            if last_report.elapsed() >= Duration::from_secs(60) {
                info!(
                    "Scanner: {} cycles, {} live opportunities",
                    cycles,
                    self.store.len()
                );
                last_report = Instant::now();
            }
            if interval.is_zero() {
                std::thread::yield_now();
            } else {
                std::thread::sleep(interval);
            }
        }
        if cycles == 0 {
            warn!("Scanner stopped before its first cycle");
        }
        info!("Scanner stopped after {} cycles", cycles);
    }
}
