//! Execution layer - Bounded dispatch of child orders

mod engine;
pub mod pool;
pub mod rate_limit;

pub use engine::{
    DispatchPolicy, ExecutionEngine, ExecutionMetrics, ExecutionReport, ExecutionStatus, SliceReport, SliceStatus,
};
pub use pool::WorkerPool;
pub use rate_limit::{RateLimitUsage, RateLimiter};
