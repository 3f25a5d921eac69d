//! Smart order router - Splitting, fee ranking and decision orchestration

pub mod fees;
mod routing;
pub mod splitter;

pub use fees::{FeeOptimizer, FeeSchedule, FeeSuggestion, RateClass, SuggestionKind, VolumeInfo};
pub use routing::{DecisionState, RoutingDecision, RoutingEngine, RoutingOutcome};
pub use splitter::{MarketConditions, OrderSplitter, SplitParams, SplitPolicy};
