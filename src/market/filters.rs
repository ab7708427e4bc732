use serde::{Deserialize, Serialize};
use std::fmt;

/// Relative tolerance for tick/step divisibility; exchange values are decimal strings
/// and never land exactly on binary floats.
const DIVISIBILITY_TOLERANCE: f64 = 1e-9;

/// Per-symbol order constraints (PRICE_FILTER, LOT_SIZE, MIN_NOTIONAL).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradingFilters {
    pub min_price: f64,
    pub max_price: f64,
    pub tick_size: f64,
    pub min_qty: f64,
    pub max_qty: f64,
    pub step_size: f64,
    pub min_notional: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterCheck {
    Ok,
    MinPrice,
    MaxPrice,
    TickSize,
    MinNotional,
    MinQty,
    MaxQty,
    StepSize,
}

impl FilterCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, FilterCheck::Ok)
    }
}

impl fmt::Display for FilterCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterCheck::Ok => "ok",
            FilterCheck::MinPrice => "price below minPrice",
            FilterCheck::MaxPrice => "price above maxPrice",
            FilterCheck::TickSize => "price not a multiple of tickSize",
            FilterCheck::MinNotional => "notional below minNotional",
            FilterCheck::MinQty => "qty below minQty",
            FilterCheck::MaxQty => "qty above maxQty",
            FilterCheck::StepSize => "qty not a multiple of stepSize",
        };
        f.write_str(name)
    }
}

fn is_multiple_of(value: f64, step: f64) -> bool {
    if step <= 0.0 {
        return true;
    }
    let ratio = value / step;
    (ratio - ratio.round()).abs() <= DIVISIBILITY_TOLERANCE * ratio.abs().max(1.0)
}

impl TradingFilters {
    /// Validates a limit order. A zero price skips the price-side checks (market orders).
    /// A zero bound means the exchange does not enforce it.
    pub fn check(&self, price: f64, qty: f64) -> FilterCheck {
        if price != 0.0 {
            if self.min_price > 0.0 && price < self.min_price {
                return FilterCheck::MinPrice;
            }
            if self.max_price > 0.0 && price > self.max_price {
                return FilterCheck::MaxPrice;
            }
            if !is_multiple_of(price - self.min_price, self.tick_size) {
                return FilterCheck::TickSize;
            }
            if price * qty < self.min_notional {
                return FilterCheck::MinNotional;
            }
        }

        if qty < self.min_qty {
            return FilterCheck::MinQty;
        }
        if self.max_qty > 0.0 && qty > self.max_qty {
            return FilterCheck::MaxQty;
        }
        if !is_multiple_of(qty - self.min_qty, self.step_size) {
            return FilterCheck::StepSize;
        }

        FilterCheck::Ok
    }
}
