//! Triangle discovery, profitability scanning, opportunity tracking and order execution.

pub mod execution;
pub mod scanner;
pub mod state;
pub mod triangle;

pub use execution::{
    ExecutionGate, ExecutionHandle, GateConfig, GateDecision, LegOutcome, Rejection,
};
pub use scanner::{evaluate_cycle, simulate_trade, ArbitrageScanner, CycleEvaluation, LegQuote};
pub use state::{
    opportunity_key, spawn_reaper, ArbitrageOpportunity, ArbitrageStateStore, Observation,
};
pub use triangle::{build_triangles, is_triangle, make_triangle, triangle_key, Triangle};
