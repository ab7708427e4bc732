//! Market model: pairs, tickers, depth, balances, trading filters and fees.

pub mod exchange_info;
pub mod fees;
pub mod filters;
pub mod snapshot;
pub mod types;

pub use exchange_info::{ExchangeInfo, FiltersMap};
pub use fees::FeeSchedule;
pub use filters::{FilterCheck, TradingFilters};
pub use snapshot::{MarketData, MonotonicCell, Snapshot};
pub use types::*;
