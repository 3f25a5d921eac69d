//! Cross-venue arbitrage
//!
//! The detector watches top-of-book per venue and publishes fee-adjusted
//! opportunities on a bounded channel; the executor consumes them and runs
//! each to a flat or fully hedged terminal state.

mod detector;
mod executor;

pub use detector::{ArbitrageDetector, ArbitrageOpportunity, DetectorStats};
pub use executor::{ArbitrageExecutor, ArbitragePosition, ArbitrageStats, Leg, PositionState, STRATEGY};
