//! AlephOMS - Order execution core
//! Smart order routing, risk admission, position aggregation and cross-venue arbitrage

// Public modules
pub mod core;
pub mod context;
pub mod position;
pub mod risk;
pub mod router;
pub mod execution;
pub mod arbitrage;
pub mod exchanges;

// Re-exports
pub use context::EngineContext;
pub use core::{Config, Error, Result};
