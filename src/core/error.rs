//! Error handling - One taxonomy for the whole execution core

use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

use crate::arbitrage::ArbitragePosition;
use crate::core::types::{AccountKey, ExchangeId, Symbol};
use crate::risk::RiskCheckResult;

pub type Result<T> = std::result::Result<T, Error>;

/// AlephOMS error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Split parameters inconsistent with the order
    #[error("invalid split params: {0}")]
    InvalidPolicyParams(String),

    /// A slice would fall under the exchange minimum lot
    #[error("slice quantity {quantity} below min lot {min_lot} for {symbol}")]
    ResidualBelowMinLot {
        symbol: Symbol,
        quantity: Decimal,
        min_lot: Decimal,
    },

    /// Account weight budget exhausted for the current window
    #[error("rate limited on {account}: requested {requested}, used {used}/{limit} in window")]
    RateLimited {
        account: AccountKey,
        requested: u32,
        used: u32,
        limit: u32,
    },

    /// Every candidate venue quotes worse than the slippage cap allows
    #[error("slippage {slippage} on {exchange} exceeds max {max} for {symbol}")]
    SlippageExceeded {
        symbol: Symbol,
        exchange: ExchangeId,
        slippage: Decimal,
        max: Decimal,
    },

    #[error("worker queue full (depth {0})")]
    QueueFull(usize),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Admission control rejected the order
    #[error("risk rejected: {0}")]
    RiskRejected(Box<RiskCheckResult>),

    #[error("kill switch engaged: {0}")]
    KillSwitchEngaged(Box<RiskCheckResult>),

    #[error("arbitrage leg failed: {0}")]
    LegFailed(String),

    /// Compensating order failed; the position needs manual intervention
    #[error("rollback failed ({reason}): {position}")]
    RollbackFailed {
        position: Box<ArbitragePosition>,
        reason: String,
    },

    /// Exchange API errors
    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("unknown exchange: {0}")]
    UnknownExchange(ExchangeId),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(Symbol),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG",
            Error::InvalidPolicyParams(_) => "INVALID_POLICY_PARAMS",
            Error::ResidualBelowMinLot { .. } => "RESIDUAL_BELOW_MIN_LOT",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::SlippageExceeded { .. } => "SLIPPAGE_EXCEEDED",
            Error::QueueFull(_) => "QUEUE_FULL",
            Error::Timeout(_) => "TIMEOUT",
            Error::RiskRejected(result) => result.code(),
            Error::KillSwitchEngaged(_) => "KILL_SWITCH_ENGAGED",
            Error::LegFailed(_) => "LEG_FAILED",
            Error::RollbackFailed { .. } => "ROLLBACK_FAILED",
            Error::Exchange(_) => "EXCHANGE",
            Error::UnknownExchange(_) => "UNKNOWN_EXCHANGE",
            Error::UnknownSymbol(_) => "UNKNOWN_SYMBOL",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::ChannelClosed(_) => "CHANNEL_CLOSED",
            Error::Io(_) => "IO",
            Error::Serialization(_) => "SERIALIZATION",
        }
    }

    /// Only timeouts are resubmitted; everything else surfaces immediately
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}
