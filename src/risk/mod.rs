//! Risk Engine - Pre-trade admission control
//!
//! `check` is synchronous and lock-light: it reads one limits snapshot and one
//! account snapshot, then evaluates rules in a fixed order so the first
//! violated rule is the one reported.

pub mod kill_switch;

pub use kill_switch::{KillRecord, KillScope, KillSwitch};

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::context::EngineContext;
use crate::core::config::RiskLimits;
use crate::core::{AccountKey, Order, PositionSource};
use crate::position::AccountState;

/// Rule that rejected an order, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    NoReferencePrice,
    MaxOrderValue,
    MaxPositionSize,
    MaxLeverage,
    NoMargin,
    DailyLoss,
    KillSwitch,
    MaxExposure,
}

impl RejectReason {
    const ALL: [RejectReason; 8] = [
        RejectReason::NoReferencePrice,
        RejectReason::MaxOrderValue,
        RejectReason::MaxPositionSize,
        RejectReason::MaxLeverage,
        RejectReason::NoMargin,
        RejectReason::DailyLoss,
        RejectReason::KillSwitch,
        RejectReason::MaxExposure,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::NoReferencePrice => "NO_REFERENCE_PRICE",
            RejectReason::MaxOrderValue => "MAX_ORDER_VALUE",
            RejectReason::MaxPositionSize => "MAX_POSITION_SIZE",
            RejectReason::MaxLeverage => "MAX_LEVERAGE",
            RejectReason::NoMargin => "NO_MARGIN",
            RejectReason::DailyLoss => "DAILY_LOSS",
            RejectReason::KillSwitch => "KILL_SWITCH_ENGAGED",
            RejectReason::MaxExposure => "MAX_EXPOSURE",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// The violated rule with the value seen and the limit it broke
#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub observed: Decimal,
    pub limit: Decimal,
    pub scope: Option<KillScope>,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (observed, limit) = (self.observed.normalize(), self.limit.normalize());
        match self.reason {
            RejectReason::NoReferencePrice => write!(f, "cannot price order: no limit price, quote or mark"),
            RejectReason::MaxOrderValue => {
                write!(f, "order notional {} exceeds max order value {}", observed, limit)
            }
            RejectReason::MaxPositionSize => {
                write!(f, "resulting position {} exceeds max position size {}", observed, limit)
            }
            RejectReason::MaxLeverage => {
                write!(f, "estimated leverage {} exceeds max leverage {}", observed.round_dp(2), limit)
            }
            RejectReason::NoMargin => {
                write!(f, "position value {} with no available margin", observed)
            }
            RejectReason::DailyLoss => {
                write!(f, "daily loss {} breaches stop-loss floor {}", observed, limit)
            }
            RejectReason::KillSwitch => match &self.scope {
                Some(scope) => write!(f, "kill switch engaged for {}", scope),
                None => write!(f, "kill switch engaged"),
            },
            RejectReason::MaxExposure => {
                write!(f, "account exposure {} exceeds max exposure {}", observed, limit)
            }
        }
    }
}

/// Limits consulted, for audit
#[derive(Debug, Clone, Serialize)]
pub struct LimitsConsulted {
    pub max_order_value: Decimal,
    pub max_position_size: Decimal,
    pub max_leverage: Decimal,
    pub max_daily_loss: Decimal,
    pub max_exposure: Decimal,
}

/// Values computed from the order and account snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct Observed {
    pub order_notional: Decimal,
    pub resulting_position: Decimal,
    pub leverage: Option<Decimal>,
    pub daily_pnl: Decimal,
    pub exposure_after: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskCheckResult {
    pub passed: bool,
    pub rejection: Option<Rejection>,
    pub account: AccountKey,
    pub limits: LimitsConsulted,
    pub observed: Observed,
    pub snapshot_version: u64,
    pub check_duration: Duration,
}

impl RiskCheckResult {
    pub fn code(&self) -> &'static str {
        self.rejection
            .as_ref()
            .map(|r| r.reason.code())
            .unwrap_or("PASSED")
    }

    pub fn reason(&self) -> Option<String> {
        self.rejection.as_ref().map(|r| r.to_string())
    }

    pub fn is_kill_switch(&self) -> bool {
        matches!(&self.rejection, Some(r) if r.reason == RejectReason::KillSwitch)
    }
}

impl std::fmt::Display for RiskCheckResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.rejection {
            Some(rejection) => write!(f, "{} [{}] on {}", rejection, rejection.reason.code(), self.account),
            None => write!(f, "passed on {}", self.account),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub checks: u64,
    pub passed: u64,
    pub rejected: u64,
    pub rejected_by_reason: Vec<(RejectReason, u64)>,
    pub avg_check_ns: u64,
    pub max_check_ns: u64,
}

#[derive(Default)]
struct Counters {
    checks: AtomicU64,
    passed: AtomicU64,
    by_reason: [AtomicU64; 8],
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

pub struct RiskEngine {
    ctx: Arc<EngineContext>,
    counters: Counters,
}

impl RiskEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            counters: Counters::default(),
        }
    }

    /// Admission check at the order's limit price (or the account mark for priceless orders).
    /// An order with neither is refused before any limit is evaluated.
    pub fn check(&self, order: &Order, account: &AccountKey) -> RiskCheckResult {
        self.check_with_reference(order, account, None)
    }

    /// Admission check; `reference` prices orders that carry no limit price
    pub fn check_with_reference(
        &self,
        order: &Order,
        account: &AccountKey,
        reference: Option<Decimal>,
    ) -> RiskCheckResult {
        let start = Instant::now();
        let limits = self.ctx.limits.load();
        let state = self.ctx.positions.account_state(account);

        let priced = order
            .price
            .or(reference)
            .or_else(|| state.mark_price(&order.symbol));
        let price = priced.unwrap_or(Decimal::ZERO);
        let position_limit = limits.position_limit(&order.symbol);

        let mut observed = Observed {
            order_notional: price * order.quantity,
            resulting_position: state.position(&order.symbol) + order.side.sign() * order.quantity,
            leverage: None,
            daily_pnl: state.daily_pnl(),
            exposure_after: state.gross_exposure,
        };

        let rejection = match priced {
            Some(price) => self.evaluate(order, account, &limits, position_limit, price, &state, &mut observed),
            None => Some(Rejection {
                reason: RejectReason::NoReferencePrice,
                observed: Decimal::ZERO,
                limit: Decimal::ZERO,
                scope: None,
            }),
        };

        let elapsed = start.elapsed();
        self.record(rejection.as_ref().map(|r| r.reason), elapsed);
        if let Some(r) = &rejection {
            debug!("Risk reject {} {} on {}: {}", order.side, order.symbol, account, r);
        }

        RiskCheckResult {
            passed: rejection.is_none(),
            rejection,
            account: account.clone(),
            limits: LimitsConsulted {
                max_order_value: limits.max_order_value,
                max_position_size: position_limit,
                max_leverage: limits.max_leverage,
                max_daily_loss: limits.max_daily_loss,
                max_exposure: limits.max_exposure,
            },
            observed,
            snapshot_version: state.version,
            check_duration: elapsed,
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[inline]
    fn evaluate(
        &self,
        order: &Order,
        account: &AccountKey,
        limits: &RiskLimits,
        position_limit: Decimal,
        price: Decimal,
        state: &AccountState,
        observed: &mut Observed,
    ) -> Option<Rejection> {
        let reject = |reason, observed, limit| {
            Some(Rejection {
                reason,
                observed,
                limit,
                scope: None,
            })
        };

        // 1. Order notional
        if observed.order_notional > limits.max_order_value {
            return reject(RejectReason::MaxOrderValue, observed.order_notional, limits.max_order_value);
        }

        // 2. Resulting position
        if observed.resulting_position.abs() > position_limit {
            return reject(RejectReason::MaxPositionSize, observed.resulting_position.abs(), position_limit);
        }

        // 3. Leverage (futures only)
        if order.is_futures() {
            let position_value = observed.resulting_position.abs() * price;
            let margin = state.free(&limits.margin_asset);
            if margin <= Decimal::ZERO {
                if !position_value.is_zero() {
                    return reject(RejectReason::NoMargin, position_value, Decimal::ZERO);
                }
            } else {
                let leverage = position_value / margin;
                observed.leverage = Some(leverage);
                if leverage > limits.max_leverage {
                    return reject(RejectReason::MaxLeverage, leverage, limits.max_leverage);
                }
            }
        }

        // 4. Daily stop-loss floor
        let loss = -observed.daily_pnl;
        if loss > Decimal::ZERO && loss >= limits.max_daily_loss {
            return reject(RejectReason::DailyLoss, loss, limits.max_daily_loss);
        }

        // 5. Kill switch
        if let Some(scope) = self.ctx.kill_switch.engaged_for(account, order.strategy.as_deref()) {
            return Some(Rejection {
                reason: RejectReason::KillSwitch,
                observed: Decimal::ZERO,
                limit: Decimal::ZERO,
                scope: Some(scope),
            });
        }

        // 6. Gross exposure; reducing orders never add exposure
        if !order.reduce_only {
            observed.exposure_after = state.gross_exposure + observed.order_notional;
            if observed.exposure_after > limits.max_exposure {
                return reject(RejectReason::MaxExposure, observed.exposure_after, limits.max_exposure);
            }
        }

        None
    }

    fn record(&self, reason: Option<RejectReason>, elapsed: Duration) {
        let c = &self.counters;
        let ns = elapsed.as_nanos() as u64;
        c.checks.fetch_add(1, Ordering::Relaxed);
        c.total_ns.fetch_add(ns, Ordering::Relaxed);
        c.max_ns.fetch_max(ns, Ordering::Relaxed);
        match reason {
            Some(r) => c.by_reason[r.index()].fetch_add(1, Ordering::Relaxed),
            None => c.passed.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Swap in new limits; in-flight checks finish against the old snapshot
    pub fn update_limits(&self, f: impl FnOnce(&mut RiskLimits)) -> u64 {
        self.ctx.limits.update(|current| {
            let mut next = current.clone();
            f(&mut next);
            next
        })
    }

    pub fn limits(&self) -> Arc<RiskLimits> {
        self.ctx.limits.load()
    }

    pub fn engage_kill_switch(&self, scope: KillScope, reason: impl Into<String>) {
        self.ctx.kill_switch.engage(scope, reason);
    }

    pub fn clear_kill_switch(&self, scope: &KillScope) -> bool {
        self.ctx.kill_switch.clear(scope)
    }

    pub fn metrics(&self) -> RiskMetrics {
        let c = &self.counters;
        let checks = c.checks.load(Ordering::Relaxed);
        let rejected_by_reason: Vec<_> = RejectReason::ALL
            .iter()
            .map(|r| (*r, c.by_reason[r.index()].load(Ordering::Relaxed)))
            .collect();
        RiskMetrics {
            checks,
            passed: c.passed.load(Ordering::Relaxed),
            rejected: rejected_by_reason.iter().map(|(_, n)| n).sum(),
            rejected_by_reason,
            avg_check_ns: c.total_ns.load(Ordering::Relaxed).checked_div(checks).unwrap_or(0),
            max_check_ns: c.max_ns.load(Ordering::Relaxed),
        }
    }

    /// Start-of-day reset of counters
    pub fn reset_daily(&self) {
        let c = &self.counters;
        c.checks.store(0, Ordering::Relaxed);
        c.passed.store(0, Ordering::Relaxed);
        c.total_ns.store(0, Ordering::Relaxed);
        c.max_ns.store(0, Ordering::Relaxed);
        for counter in &c.by_reason {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
