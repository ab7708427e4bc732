//! Rate-budgeted fetch dispatch and response demultiplexing.

use super::registry::CollectorRegistry;
use crate::market::MarketData;
use crate::protocol::{Command, Message, ARG_CURRENCY_PAIR, ARG_FETCH_TIME};
use crate::utils::unix_micros;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Pause between two sends so that `ready` collectors together stay within `base` per request.
pub fn dispatch_delay(base: Duration, ready: usize) -> Duration {
    if ready == 0 {
        return base;
    }
    base / ready as u32
}

/// What one dispatch loop keeps asking for.
#[derive(Debug, Clone)]
pub enum FetchPlan {
    Tickers { exchange: String },
    Depth { exchange: String, symbols: Vec<String>, limit: u32 },
}

impl FetchPlan {
    fn command(&self) -> Command {
        match self {
            FetchPlan::Tickers { .. } => Command::TickerRequest,
            FetchPlan::Depth { .. } => Command::DepthRequest,
        }
    }

    fn request(&self, round: usize, request_ts_micros: i64) -> Option<Message> {
        match self {
            FetchPlan::Tickers { exchange } => Some(Message::ticker_request(exchange, request_ts_micros)),
            FetchPlan::Depth { exchange, symbols, limit } => {
                if symbols.is_empty() {
                    return None;
                }
                let symbol = &symbols[round % symbols.len()];
                Some(Message::depth_request(exchange, symbol, *limit, request_ts_micros))
            }
        }
    }
}

async fn pause(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}

/// Round-robins `plan` across ready collectors until shutdown.
pub fn spawn_dispatch_loop(
    registry: Arc<CollectorRegistry>,
    plan: FetchPlan,
    base_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Dispatching {} every {:?} (budget across all collectors)",
            plan.command(),
            base_delay
        );
        let mut round = 0usize;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let ready = registry.ready_ids();
            let delay = if ready.is_empty() {
                IDLE_WAIT
            } else {
                let id = ready[round % ready.len()];
                if let Some(request) = plan.request(round, unix_micros()) {
                    if let Err(e) = registry.send(id, request) {
                        warn!("Dispatch to collector {} failed: {}", id, e);
                    }
                }
                round = round.wrapping_add(1);
                dispatch_delay(base_delay, ready.len())
            };
            tokio::select! {
                _ = pause(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("{} dispatch stopped", plan.command());
    })
}

/// Applies one response frame from collector `id` to the market model. Returns true if applied.
pub fn handle_response(market: &MarketData, id: usize, message: &Message) -> bool {
    if let Some(error) = message.error() {
        warn!("Collector {} reported {} failure: {}", id, message.command, error);
        return false;
    }
    let request_ts = match message.request_ts_micros() {
        Ok(ts) => ts,
        Err(e) => {
            warn!("Collector {} response without request stamp: {}", id, e);
            return false;
        }
    };
    let fetch_time: i64 = message.arg_parsed(ARG_FETCH_TIME).unwrap_or(request_ts);

    match message.command {
        Command::TickerResponse => {
            let previous = market.tickers.stamp();
            let tickers = match message.tickers_payload() {
                Ok(tickers) => tickers,
                Err(e) => {
                    warn!("Collector {} sent unreadable tickers: {}", id, e);
                    return false;
                }
            };
            let applied = market.apply_tickers(request_ts, tickers);
            if applied {
                debug!(
                    "Tickers from collector {}: interval {}us, fetch {}us",
                    id,
                    request_ts.saturating_sub(previous),
                    fetch_time.saturating_sub(request_ts)
                );
            } else {
                debug!("Stale tickers from collector {} dropped ({} < {})", id, request_ts, previous);
            }
            applied
        }
        Command::DepthResponse => {
            let symbol = match message.arg(ARG_CURRENCY_PAIR) {
                Ok(symbol) => symbol.to_string(),
                Err(e) => {
                    warn!("Collector {} depth without pair: {}", id, e);
                    return false;
                }
            };
            let depth = match message.depth_payload() {
                Ok(depth) => depth,
                Err(e) => {
                    warn!("Collector {} sent unreadable depth for {}: {}", id, symbol, e);
                    return false;
                }
            };
            let applied = market.apply_depth(&symbol, request_ts, depth);
            if applied {
                debug!("Depth {} from collector {}: fetch {}us", symbol, id, fetch_time.saturating_sub(request_ts));
            } else {
                debug!("Stale depth {} from collector {} dropped", symbol, id);
            }
            applied
        }
        other => {
            warn!("Collector {} sent unexpected {}", id, other);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Depth, DepthLevel, Ticker, TickersMap};
    use pretty_assertions::assert_eq;

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
    fn test_delay_divided_among_ready_collectors() {
        let base = Duration::from_micros(100_000);
        assert_eq!(dispatch_delay(base, 1), Duration::from_micros(100_000));
        assert_eq!(dispatch_delay(base, 4), Duration::from_micros(25_000));
        assert_eq!(dispatch_delay(base, 0), base);
    }

    #[test]
    fn test_depth_plan_cycles_symbols() {
        let plan = FetchPlan::Depth {
            exchange: "binance".to_string(),
            symbols: vec!["ETHBTC".to_string(), "BNBBTC".to_string()],
            limit: 5,
        };
        let first = plan.request(0, 1).unwrap();
        let second = plan.request(1, 2).unwrap();
        let third = plan.request(2, 3).unwrap();
        assert_eq!(first.arg(ARG_CURRENCY_PAIR).unwrap(), "ETHBTC");
        assert_eq!(second.arg(ARG_CURRENCY_PAIR).unwrap(), "BNBBTC");
        assert_eq!(third.arg(ARG_CURRENCY_PAIR).unwrap(), "ETHBTC");
    }

    #[test]
    fn test_out_of_order_ticker_response_is_dropped() {
        let market = MarketData::new();
        let newer = Message::ticker_response(&Message::ticker_request("binance", 200), &tickers(0.05), 250).unwrap();
        let older = Message::ticker_response(&Message::ticker_request("binance", 100), &tickers(0.04), 300).unwrap();

        assert!(handle_response(&market, 0, &newer));
        assert!(!handle_response(&market, 1, &older));
        assert_eq!(market.tickers.stamp(), 200);
        assert_eq!(market.tickers.value()["ETHBTC"].bid_price, 0.05);
    }

    #[test]
    fn test_error_frame_applies_nothing() {
        let market = MarketData::new();
        let request = Message::ticker_request("binance", 100);
        let error = Message::error_response(&request, Command::TickerResponse, "timeout", 120);
        assert!(!handle_response(&market, 0, &error));
        assert!(market.tickers.value().is_empty());
    }

    #[test]
    fn test_depth_response_is_stored_per_symbol() {
        let market = MarketData::new();
        let depth = Depth {
            bids: vec![DepthLevel { price: 0.05, qty: 2.0 }],
            asks: vec![DepthLevel { price: 0.051, qty: 1.0 }],
            last_update_id: 7,
        };
        let request = Message::depth_request("binance", "ETHBTC", 5, 100);
        let response = Message::depth_response(&request, &depth, 110).unwrap();
        assert!(handle_response(&market, 0, &response));
        assert_eq!(market.depth("ETHBTC").unwrap().last_update_id, 7);
        assert!(market.depth("BNBBTC").is_none());
    }
}
