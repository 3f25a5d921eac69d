//! Arbitrage executor - Two IOC legs, all or rollback
//!
//! Both legs are risk-checked before anything is sent, then dispatched
//! concurrently. Any fill imbalance is flattened with a reduce-only market
//! order on the over-filled venue. A compensating order that does not fully
//! fill is fatal for the opportunity and comes back as `RollbackFailed`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::detector::ArbitrageOpportunity;
use crate::context::EngineContext;
use crate::core::config::ArbitrageConfig;
use crate::core::{
    CancelToken, Error, ExchangeId, Order, Result, Route, RouteSlice, Side, Symbol, TimeInForce,
};
use crate::execution::{DispatchPolicy, ExecutionEngine, SliceReport};
use crate::risk::{KillScope, RiskEngine};

/// Strategy tag on every arbitrage order; scope of the circuit breaker
pub const STRATEGY: &str = "arbitrage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Planned,
    BuyLegSent,
    SellLegSent,
    BothFilled,
    RollingBack,
    RolledBack,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Leg {
    pub route: Route,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub report: Option<SliceReport>,
}

impl Leg {
    fn new(route: Route, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            route,
            side,
            quantity,
            price,
            report: None,
        }
    }

    pub fn filled(&self) -> Decimal {
        self.report.as_ref().map(|r| r.filled_quantity).unwrap_or(Decimal::ZERO)
    }

    fn avg_price(&self) -> Decimal {
        self.report
            .as_ref()
            .and_then(|r| r.avg_price)
            .unwrap_or(self.price)
    }

    fn error(&self) -> String {
        self.report
            .as_ref()
            .and_then(|r| r.error.clone())
            .unwrap_or_else(|| "no report".to_string())
    }

    fn order(&self, symbol: &Symbol) -> Order {
        Order::new_limit(symbol.clone(), self.side, self.quantity, self.price)
            .with_time_in_force(TimeInForce::Ioc)
            .with_account(self.route.account_key())
            .with_strategy(STRATEGY)
    }
}

/// Cash flow of a report: sells add, buys spend, fees always spend
fn cash_flow(side: Side, report: &SliceReport) -> Decimal {
    let value = report.filled_quantity * report.avg_price.unwrap_or(Decimal::ZERO);
    -side.sign() * value - report.fee
}

#[derive(Debug, Clone, Serialize)]
pub struct ArbitragePosition {
    pub id: Uuid,
    pub opportunity: ArbitrageOpportunity,
    pub state: PositionState,
    pub buy: Leg,
    pub sell: Leg,
    /// Compensating order, when one was needed
    pub rollback: Option<(Side, SliceReport)>,
    /// Cost of the compensating order against the leg it unwound
    pub rollback_slippage: Option<Decimal>,
    pub realized_pnl: Decimal,
    pub failure: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ArbitragePosition {
    fn new(opportunity: ArbitrageOpportunity) -> Self {
        let q = opportunity.quantity;
        Self {
            id: Uuid::new_v4(),
            buy: Leg::new(opportunity.buy.clone(), Side::Buy, q, opportunity.buy_price),
            sell: Leg::new(opportunity.sell.clone(), Side::Sell, q, opportunity.sell_price),
            opportunity,
            state: PositionState::Planned,
            rollback: None,
            rollback_slippage: None,
            realized_pnl: Decimal::ZERO,
            failure: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    fn set_state(&mut self, next: PositionState) {
        debug!("Arb {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        if matches!(next, PositionState::BothFilled | PositionState::RolledBack | PositionState::Failed) {
            self.closed_at = Some(Utc::now());
        }
    }

    /// Net base quantity still open: positive is long on the buy venue
    pub fn imbalance(&self) -> Decimal {
        let unwound = match &self.rollback {
            Some((side, report)) => side.sign() * report.filled_quantity,
            None => Decimal::ZERO,
        };
        self.buy.filled() - self.sell.filled() + unwound
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, PositionState::BothFilled | PositionState::RolledBack | PositionState::Failed)
    }

    fn settle_pnl(&mut self) {
        let legs = [(&self.buy, Side::Buy), (&self.sell, Side::Sell)];
        let mut pnl: Decimal = legs
            .iter()
            .filter_map(|(leg, side)| leg.report.as_ref().map(|r| cash_flow(*side, r)))
            .sum();
        if let Some((side, report)) = &self.rollback {
            pnl += cash_flow(*side, report);
        }
        self.realized_pnl = pnl;
    }
}

impl std::fmt::Display for ArbitragePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "arb {} {} buy {} {}/{} sell {} {}/{} open {} [{:?}]",
            self.id,
            self.opportunity.symbol,
            self.buy.route,
            self.buy.filled(),
            self.buy.quantity,
            self.sell.route,
            self.sell.filled(),
            self.sell.quantity,
            self.imbalance(),
            self.state
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ArbitrageStats {
    pub attempted: u64,
    pub both_filled: u64,
    pub rolled_back: u64,
    pub failed: u64,
    pub rollback_failures: u64,
    pub skipped: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub daily_volume: Decimal,
    pub daily_pnl: Decimal,
}

#[derive(Default)]
struct Counters {
    attempted: AtomicU64,
    both_filled: AtomicU64,
    rolled_back: AtomicU64,
    failed: AtomicU64,
    rollback_failures: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Default)]
struct Daily {
    volume: Decimal,
    pnl: Decimal,
}

type PairKey = (Symbol, ExchangeId, ExchangeId);

pub struct ArbitrageExecutor {
    ctx: Arc<EngineContext>,
    risk: Arc<RiskEngine>,
    execution: Arc<ExecutionEngine>,
    config: ArbitrageConfig,
    permits: Semaphore,
    last_sequence: Mutex<HashMap<PairKey, u64>>,
    consecutive_failures: AtomicU32,
    daily: Mutex<Daily>,
    counters: Counters,
}

impl ArbitrageExecutor {
    pub fn new(ctx: Arc<EngineContext>, risk: Arc<RiskEngine>, execution: Arc<ExecutionEngine>) -> Self {
        let config = ctx.config.arbitrage.clone();
        Self {
            permits: Semaphore::new(config.max_concurrent.max(1)),
            ctx,
            risk,
            execution,
            config,
            last_sequence: Mutex::new(HashMap::new()),
            consecutive_failures: AtomicU32::new(0),
            daily: Mutex::new(Daily::default()),
            counters: Counters::default(),
        }
    }

    /// Consume opportunities until the detector side of the channel closes
    pub async fn run(self: Arc<Self>, rx: flume::Receiver<ArbitrageOpportunity>, cancel: CancelToken) {
        info!("🔁 Arbitrage executor started");
        let mut tasks = JoinSet::new();
        while let Ok(opportunity) = rx.recv_async().await {
            if cancel.is_cancelled() {
                break;
            }
            let executor = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                match executor.execute(opportunity, &cancel).await {
                    Ok(position) => debug!("{}", position),
                    Err(e @ Error::RollbackFailed { .. }) => error!("🚨 {}", e),
                    Err(e) => debug!("Opportunity not executed: {}", e),
                }
            });
            while tasks.try_join_next().is_some() {}
        }
        while tasks.join_next().await.is_some() {}
        info!("Arbitrage executor stopped: {:?}", self.stats());
    }

    /// Execute one opportunity to a terminal state.
    ///
    /// `Ok` carries a `BothFilled` or `RolledBack` position. Refusals before any
    /// order is sent and legs that both fail come back as errors.
    pub async fn execute(&self, opportunity: ArbitrageOpportunity, cancel: &CancelToken) -> Result<ArbitragePosition> {
        self.admit(&opportunity)?;
        let Ok(_permit) = self.permits.try_acquire() else {
            return Err(self.skip(format!("{} executions already in flight", self.config.max_concurrent)));
        };

        let mut position = ArbitragePosition::new(opportunity);
        let symbol = position.opportunity.symbol.clone();
        for leg in [&position.buy, &position.sell] {
            let result = self.risk.check(&leg.order(&symbol), &leg.route.account_key());
            if !result.passed {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                debug!("Arb {} leg {} refused: {}", position.id, leg.side, result);
                return Err(if result.is_kill_switch() {
                    Error::KillSwitchEngaged(Box::new(result))
                } else {
                    Error::RiskRejected(Box::new(result))
                });
            }
        }
        if cancel.is_cancelled() {
            return Err(self.skip(format!("arb {} cancelled before dispatch", position.id)));
        }

        self.counters.attempted.fetch_add(1, Ordering::Relaxed);
        let policy = DispatchPolicy {
            timeout: self.config.execution_timeout(),
            max_retries: 0,
        };
        let (buy_slice, sell_slice) = (self.leg_slice(&position.buy, &symbol), self.leg_slice(&position.sell, &symbol));
        position.set_state(PositionState::BuyLegSent);
        position.set_state(PositionState::SellLegSent);
        let (buy, sell) = tokio::join!(self.run_leg(buy_slice, policy), self.run_leg(sell_slice, policy));
        position.buy.report = Some(buy);
        position.sell.report = Some(sell);

        let result = self.resolve(&mut position).await;
        self.record(&position);
        result.map(|_| position)
    }

    /// Freshness, sequence, breaker and daily caps; nothing is sent if these fail
    fn admit(&self, opportunity: &ArbitrageOpportunity) -> Result<()> {
        if opportunity.is_expired(Utc::now()) {
            return Err(self.skip(format!("opportunity {} expired", opportunity.id)));
        }
        {
            let key = (
                opportunity.symbol.clone(),
                opportunity.buy.exchange.clone(),
                opportunity.sell.exchange.clone(),
            );
            let mut seen = self.last_sequence.lock();
            let last = seen.entry(key).or_insert(0);
            if opportunity.sequence <= *last {
                return Err(self.skip(format!(
                    "opportunity {} superseded by sequence {}",
                    opportunity.id, *last
                )));
            }
            *last = opportunity.sequence;
        }

        let daily = self.daily.lock();
        if daily.volume + opportunity.notional() * Decimal::TWO > self.config.max_daily_volume {
            return Err(self.skip(format!("daily volume cap {} reached", self.config.max_daily_volume)));
        }
        if -daily.pnl >= self.config.max_daily_loss {
            return Err(self.skip(format!("daily loss cap {} reached", self.config.max_daily_loss)));
        }
        Ok(())
    }

    fn skip(&self, reason: String) -> Error {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        Error::InvalidState(reason)
    }

    fn leg_slice(&self, leg: &Leg, symbol: &Symbol) -> RouteSlice {
        let order = leg.order(symbol);
        RouteSlice::new(&order, leg.route.clone(), leg.quantity, 1)
    }

    /// Dispatch one leg. Past twice its timeout a leg still waiting for a
    /// worker is cancelled; one already in flight runs to its own timeout.
    async fn run_leg(&self, slice: RouteSlice, policy: DispatchPolicy) -> SliceReport {
        let cancel = CancelToken::new();
        let leg = self.execution.dispatch(slice, policy, &cancel);
        tokio::pin!(leg);
        tokio::select! {
            report = &mut leg => report,
            _ = tokio::time::sleep(policy.timeout * 2) => {
                cancel.cancel();
                leg.await
            }
        }
    }

    async fn resolve(&self, position: &mut ArbitragePosition) -> Result<()> {
        let (bought, sold) = (position.buy.filled(), position.sell.filled());

        if bought.is_zero() && sold.is_zero() {
            position.failure = Some(format!("buy: {}; sell: {}", position.buy.error(), position.sell.error()));
            position.set_state(PositionState::Failed);
            return Err(Error::LegFailed(format!("arb {} both legs unfilled: {}", position.id, position.failure.as_deref().unwrap_or_default())));
        }
        if bought == sold {
            position.set_state(PositionState::BothFilled);
            position.settle_pnl();
            info!("✅ Arb {} filled both legs, pnl {}", position.id, position.realized_pnl.round_dp(4));
            return Ok(());
        }

        // one side over-filled: flatten the excess on that venue
        let excess = bought - sold;
        let (leg, side) = if excess > Decimal::ZERO {
            (&position.buy, Side::Sell)
        } else {
            (&position.sell, Side::Buy)
        };
        let quantity = excess.abs();
        let (route, leg_price) = (leg.route.clone(), leg.avg_price());
        let single_leg = bought.is_zero() || sold.is_zero();

        position.set_state(PositionState::RollingBack);
        warn!("↩️ Arb {} unbalanced by {}, flattening {} {} on {}", position.id, excess, side, quantity, route);

        let order = Order::new_market(position.opportunity.symbol.clone(), side, quantity)
            .reduce_only()
            .with_account(route.account_key())
            .with_strategy(STRATEGY);
        let slice = RouteSlice::new(&order, route, quantity, 1);
        let policy = DispatchPolicy {
            timeout: self.config.rollback_timeout(),
            max_retries: 0,
        };
        let report = self.run_leg(slice, policy).await;
        let flattened = report.filled_quantity >= quantity;
        if let Some(price) = report.avg_price {
            // positive is a loss against the leg being unwound
            position.rollback_slippage = Some((leg_price - price) * side.opposite().sign() * report.filled_quantity);
        }
        let reason = report.error.clone().unwrap_or_else(|| format!("filled {}/{}", report.filled_quantity, quantity));
        position.rollback = Some((side, report));
        position.settle_pnl();

        if !flattened {
            position.failure = Some(reason.clone());
            position.set_state(PositionState::Failed);
            error!("🚨 Arb {} rollback failed, position left open: {}", position.id, position);
            return Err(Error::RollbackFailed {
                position: Box::new(position.clone()),
                reason,
            });
        }

        position.set_state(if single_leg {
            PositionState::RolledBack
        } else {
            PositionState::BothFilled
        });
        warn!(
            "Arb {} flattened ({:?}), pnl {}, rollback slippage {:?}",
            position.id, position.state, position.realized_pnl.round_dp(4), position.rollback_slippage
        );
        Ok(())
    }

    fn record(&self, position: &ArbitragePosition) {
        let c = &self.counters;
        match position.state {
            PositionState::BothFilled if position.rollback.is_none() => {
                c.both_filled.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            PositionState::BothFilled => {
                c.both_filled.fetch_add(1, Ordering::Relaxed);
            }
            PositionState::RolledBack => {
                c.rolled_back.fetch_add(1, Ordering::Relaxed);
                self.on_failure();
            }
            _ => {
                c.failed.fetch_add(1, Ordering::Relaxed);
                if position.rollback.is_some() {
                    c.rollback_failures.fetch_add(1, Ordering::Relaxed);
                }
                self.on_failure();
            }
        }

        let mut daily = self.daily.lock();
        let traded: Decimal = [&position.buy, &position.sell]
            .iter()
            .filter_map(|leg| leg.report.as_ref())
            .chain(position.rollback.as_ref().map(|(_, r)| r))
            .map(|r| r.filled_quantity * r.avg_price.unwrap_or(Decimal::ZERO))
            .sum();
        daily.volume += traded;
        daily.pnl += position.realized_pnl;
    }

    fn on_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.max_consecutive_failures {
            self.ctx.kill_switch.engage(
                KillScope::Strategy(STRATEGY.to_string()),
                format!("{} consecutive arbitrage failures", failures),
            );
        }
    }

    /// Operator reset after the breaker tripped
    pub fn reset_circuit_breaker(&self) -> bool {
        self.consecutive_failures.store(0, Ordering::Release);
        self.ctx.kill_switch.clear(&KillScope::Strategy(STRATEGY.to_string()))
    }

    pub fn reset_daily(&self) {
        *self.daily.lock() = Daily::default();
    }

    pub fn stats(&self) -> ArbitrageStats {
        let c = &self.counters;
        let attempted = c.attempted.load(Ordering::Relaxed);
        let both_filled = c.both_filled.load(Ordering::Relaxed);
        let daily = self.daily.lock();
        ArbitrageStats {
            attempted,
            both_filled,
            rolled_back: c.rolled_back.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            rollback_failures: c.rollback_failures.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            success_rate: if attempted == 0 {
                0.0
            } else {
                both_filled as f64 / attempted as f64
            },
            daily_volume: daily.volume,
            daily_pnl: daily.pnl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RiskLimits;
    use crate::core::{AccountKey, Config, Market, PositionSource};
    use crate::exchanges::{PaperBehavior, PaperExchange};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Harness {
        ctx: Arc<EngineContext>,
        executor: ArbitrageExecutor,
        binance: Arc<PaperExchange>,
        okx: Arc<PaperExchange>,
    }

    fn harness() -> Harness {
        let mut config = Config::default();
        config.arbitrage.execution_timeout_ms = 100;
        config.arbitrage.rollback_timeout_ms = 100;
        config.arbitrage.opportunity_ttl_ms = 60_000;
        let ctx = EngineContext::new(config).unwrap();

        let venue = |id: &str| {
            let exchange = Arc::new(PaperExchange::new(id, Duration::from_millis(1), dec!(0.001)));
            exchange.set_quote(Symbol::new("BTCUSDT"), dec!(40190), dec!(40200));
            ctx.register_exchange(exchange.clone());
            exchange
        };
        let (binance, okx) = (venue("binance"), venue("okx"));
        binance.set_quote(Symbol::new("BTCUSDT"), dec!(39990), dec!(40000));

        let risk = Arc::new(RiskEngine::new(ctx.clone()));
        let execution = Arc::new(ExecutionEngine::new(ctx.clone()));
        Harness {
            executor: ArbitrageExecutor::new(ctx.clone(), risk, execution),
            ctx,
            binance,
            okx,
        }
    }

    fn opportunity(sequence: u64) -> ArbitrageOpportunity {
        let now = Utc::now();
        ArbitrageOpportunity {
            id: format!("BTCUSDT_binance_okx_{}", sequence),
            sequence,
            symbol: Symbol::new("BTCUSDT"),
            buy: Route::new("binance", "main", Market::Spot),
            sell: Route::new("okx", "main", Market::Spot),
            buy_price: dec!(40000),
            sell_price: dec!(40190),
            quantity: dec!(0.25),
            buy_fee_rate: dec!(0.001),
            sell_fee_rate: dec!(0.001),
            profit_rate: dec!(0.00275),
            net_profit: dec!(27.5),
            detected_at: now,
            valid_until: now + chrono::Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn test_both_legs_fill() {
        let h = harness();
        let position = h.executor.execute(opportunity(1), &CancelToken::new()).await.unwrap();

        assert_eq!(position.state, PositionState::BothFilled);
        assert_eq!(position.imbalance(), dec!(0));
        // 0.25 * 190 minus fees on both legs
        assert_eq!(position.realized_pnl, dec!(47.5) - dec!(10) - dec!(10.0475));
        assert_eq!(h.executor.stats().both_filled, 1);
    }

    #[tokio::test]
    async fn test_sell_reject_rolls_back_buy() {
        let h = harness();
        h.okx.set_behavior(PaperBehavior::Reject("insufficient balance".into()));

        let position = h.executor.execute(opportunity(1), &CancelToken::new()).await.unwrap();
        assert_eq!(position.state, PositionState::RolledBack);
        let (side, report) = position.rollback.as_ref().unwrap();
        assert_eq!(*side, Side::Sell);
        assert_eq!(report.route.exchange.as_str(), "binance");
        assert_eq!(position.imbalance(), dec!(0));
        assert_eq!(h.binance.placed(), 2);

        let key = AccountKey::new("binance", "main");
        h.ctx.positions.flush(&key).await.unwrap();
        assert_eq!(h.ctx.positions.account_state(&key).position(&Symbol::new("BTCUSDT")), dec!(0));
    }

    #[tokio::test]
    async fn test_partial_sell_flattens_excess() {
        let h = harness();
        h.okx.set_behavior(PaperBehavior::Partial(dec!(0.4)));

        let position = h.executor.execute(opportunity(1), &CancelToken::new()).await.unwrap();
        assert_eq!(position.state, PositionState::BothFilled);
        let (_, report) = position.rollback.as_ref().unwrap();
        assert_eq!(report.filled_quantity, dec!(0.15));
        assert_eq!(position.imbalance(), dec!(0));
    }

    #[tokio::test]
    async fn test_both_legs_fail() {
        let h = harness();
        h.binance.set_behavior(PaperBehavior::Reject("halted".into()));
        h.okx.set_behavior(PaperBehavior::Reject("halted".into()));

        let err = h.executor.execute(opportunity(1), &CancelToken::new()).await.unwrap_err();
        assert_eq!(err.code(), "LEG_FAILED");
        assert_eq!(h.executor.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_risk_refusal_sends_nothing() {
        let h = harness();
        h.ctx.limits.update(|l| RiskLimits {
            max_order_value: dec!(1000),
            ..l.clone()
        });

        let err = h.executor.execute(opportunity(1), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::RiskRejected(_)));
        assert_eq!(h.binance.placed() + h.okx.placed(), 0);
    }

    #[tokio::test]
    async fn test_stale_and_superseded_skipped() {
        let h = harness();
        let mut expired = opportunity(1);
        expired.valid_until = Utc::now() - chrono::Duration::seconds(1);
        assert!(h.executor.execute(expired, &CancelToken::new()).await.is_err());

        h.executor.execute(opportunity(5), &CancelToken::new()).await.unwrap();
        assert!(h.executor.execute(opportunity(4), &CancelToken::new()).await.is_err());
        assert_eq!(h.executor.stats().skipped, 2);
    }

    #[tokio::test]
    async fn test_breaker_trips_after_consecutive_failures() {
        let h = harness();
        h.okx.set_behavior(PaperBehavior::Reject("halted".into()));
        for seq in 1..=3 {
            h.executor.execute(opportunity(seq), &CancelToken::new()).await.unwrap();
        }

        let err = h.executor.execute(opportunity(4), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::KillSwitchEngaged(_)));

        assert!(h.executor.reset_circuit_breaker());
        h.okx.set_behavior(PaperBehavior::Fill);
        let position = h.executor.execute(opportunity(5), &CancelToken::new()).await.unwrap();
        assert_eq!(position.state, PositionState::BothFilled);
    }
}
