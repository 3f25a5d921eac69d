//! Routing engine - Risk check, split, fee ranking, dispatch

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::fees::{RateClass, VolumeInfo};
use super::splitter::{MarketConditions, OrderSplitter, SplitParams, SplitPolicy};
use crate::context::EngineContext;
use crate::core::{
    BidAsk, CancelToken, Error, ExchangeId, Order, OrderType, Result, Route, RouteSlice, Side, Symbol, SymbolSpec,
};
use crate::execution::{ExecutionEngine, ExecutionReport, ExecutionStatus};
use crate::risk::{RiskCheckResult, RiskEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Created,
    RiskChecked,
    Split,
    FeeRanked,
    Dispatched,
    Completed,
    PartiallyFailed,
    Rejected,
}

impl DecisionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyFailed | Self::Rejected)
    }

    fn can_advance(&self, next: DecisionState) -> bool {
        use DecisionState::*;
        matches!(
            (self, next),
            (Created, RiskChecked)
                | (Created, Rejected)
                | (RiskChecked, Split)
                | (Split, FeeRanked)
                | (FeeRanked, Dispatched)
                | (Dispatched, Completed)
                | (Dispatched, PartiallyFailed)
        )
    }
}

/// One parent order's plan and its progress
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub id: Uuid,
    pub order: Order,
    pub state: DecisionState,
    /// Dispatch order is ascending priority
    pub slices: Vec<RouteSlice>,
    pub policy: Option<&'static str>,
    pub risk: Option<RiskCheckResult>,
    /// Quote used to price a priceless order
    pub reference_price: Option<Decimal>,
    pub estimated_fees: Decimal,
    pub created_at: DateTime<Utc>,
}

impl RoutingDecision {
    pub fn new(order: Order) -> Self {
        Self {
            id: Uuid::new_v4(),
            order,
            state: DecisionState::Created,
            slices: Vec::new(),
            policy: None,
            risk: None,
            reference_price: None,
            estimated_fees: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }

    /// A decision built outside the router, ready for the execution engine
    pub fn dispatched(order: Order, slices: Vec<RouteSlice>) -> Self {
        Self {
            state: DecisionState::Dispatched,
            slices,
            ..Self::new(order)
        }
    }

    pub fn total_quantity(&self) -> Decimal {
        self.slices.iter().map(|s| s.quantity).sum()
    }

    fn advance(&mut self, next: DecisionState) -> Result<()> {
        if !self.state.can_advance(next) {
            return Err(Error::InvalidState(format!(
                "decision {} cannot move {:?} -> {:?}",
                self.id, self.state, next
            )));
        }
        debug!("Decision {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingOutcome {
    pub decision: RoutingDecision,
    pub report: ExecutionReport,
}

pub struct RoutingEngine {
    ctx: Arc<EngineContext>,
    risk: Arc<RiskEngine>,
    execution: Arc<ExecutionEngine>,
    splitter: OrderSplitter,
    conditions: RwLock<HashMap<Symbol, MarketConditions>>,
}

impl RoutingEngine {
    pub fn new(ctx: Arc<EngineContext>, risk: Arc<RiskEngine>, execution: Arc<ExecutionEngine>) -> Self {
        let splitter = OrderSplitter::new(ctx.config.routing.clone());
        Self {
            ctx,
            risk,
            execution,
            splitter,
            conditions: RwLock::new(HashMap::new()),
        }
    }

    /// Latest volatility/liquidity picture for a symbol; drives policy choice
    pub fn update_market_conditions(&self, symbol: Symbol, conditions: MarketConditions) {
        self.conditions.write().insert(symbol, conditions);
    }

    pub fn market_conditions(&self, symbol: &Symbol) -> Option<MarketConditions> {
        self.conditions.read().get(symbol).cloned()
    }

    /// Route with a policy picked from order size and venue liquidity
    pub async fn route_order(&self, order: Order, cancel: &CancelToken) -> Result<RoutingOutcome> {
        self.route(order, None, cancel).await
    }

    pub async fn route_order_with(
        &self,
        order: Order,
        policy: SplitPolicy,
        cancel: &CancelToken,
    ) -> Result<RoutingOutcome> {
        self.route(order, Some(policy), cancel).await
    }

    async fn route(&self, order: Order, policy: Option<SplitPolicy>, cancel: &CancelToken) -> Result<RoutingOutcome> {
        let mut decision = self.plan(order, policy).await?;
        decision.advance(DecisionState::Dispatched)?;

        let report = self.execution.execute(&decision, cancel).await;
        let terminal = match report.status {
            ExecutionStatus::Completed => DecisionState::Completed,
            _ => DecisionState::PartiallyFailed,
        };
        decision.advance(terminal)?;

        Ok(RoutingOutcome { decision, report })
    }

    /// Everything up to dispatch: quote, slippage filter, risk, split, fee ranking.
    ///
    /// Venues quoting past `max_slippage` from the expected price drop out of
    /// the candidate routes; `SlippageExceeded` when none are left.
    ///
    /// Rejections are terminal and returned as `RiskRejected` or
    /// `KillSwitchEngaged` carrying the full check result. No suspension point
    /// sits between the risk check and handing slices to the executor.
    pub async fn plan(&self, order: Order, policy: Option<SplitPolicy>) -> Result<RoutingDecision> {
        let spec = self.ctx.symbol(&order.symbol)?.clone();
        let routes = self.ctx.routes_for(&order);
        if routes.is_empty() {
            return Err(Error::InvalidState(format!(
                "no {} route for {}",
                order.market, order.symbol
            )));
        }

        let quotes = self.venue_quotes(&order.symbol, &routes).await;
        let reference = order.price.or_else(|| best_touch(&quotes, order.side));
        let routes = self.within_slippage(&order, reference, routes, &quotes)?;

        let mut decision = RoutingDecision::new(order);
        decision.reference_price = reference;
        let account = decision
            .order
            .account
            .clone()
            .unwrap_or_else(|| routes[0].account_key());

        let risk = self.risk.check_with_reference(&decision.order, &account, reference);
        if !risk.passed {
            decision.advance(DecisionState::Rejected)?;
            info!("🚫 {} rejected: {}", decision.order.client_order_id, risk);
            return Err(if risk.is_kill_switch() {
                Error::KillSwitchEngaged(Box::new(risk))
            } else {
                Error::RiskRejected(Box::new(risk))
            });
        }
        decision.risk = Some(risk);
        decision.advance(DecisionState::RiskChecked)?;

        let policy = policy.unwrap_or_else(|| self.choose_policy(&decision.order, reference, &routes, &spec));
        let params = SplitParams {
            routes: &routes,
            spec: &spec,
            now: Utc::now(),
        };
        let mut slices = self.splitter.split(&decision.order, &policy, &params)?;
        for slice in &mut slices {
            slice.expected_price = slice.expected_price.or(reference);
        }
        decision.policy = Some(policy.name());
        decision.advance(DecisionState::Split)?;

        let volume = self.ctx.volume_info(rate_class(&decision.order));
        let side = decision.order.side;
        decision.slices = self.ctx.fees.optimize_for_fees(slices, side, &volume);
        decision.estimated_fees = self.ctx.fees.calculate_total_fees(&decision.slices, side, &volume);
        decision.advance(DecisionState::FeeRanked)?;

        info!(
            "🧭 {} {} {} {}: {} slices via {}, est. fee {}",
            decision.order.client_order_id,
            decision.order.side,
            decision.order.quantity,
            decision.order.symbol,
            decision.slices.len(),
            policy.name(),
            decision.estimated_fees
        );
        Ok(decision)
    }

    /// Valid touch per distinct candidate venue; venues without a book are left out
    async fn venue_quotes(&self, symbol: &Symbol, routes: &[Route]) -> HashMap<ExchangeId, BidAsk> {
        let timeout = self.ctx.config.execution.order_timeout();
        let mut quotes = HashMap::new();
        for route in routes {
            if quotes.contains_key(&route.exchange) {
                continue;
            }
            let Ok(exchange) = self.ctx.exchange(&route.exchange) else {
                continue;
            };
            match tokio::time::timeout(timeout, exchange.get_quote(symbol)).await {
                Ok(Ok(quote)) if quote.is_valid() => {
                    quotes.insert(route.exchange.clone(), quote);
                }
                Ok(Ok(_)) => warn!("Ignoring crossed quote for {} on {}", symbol, route.exchange),
                Ok(Err(e)) => debug!("No quote for {} on {}: {}", symbol, route.exchange, e),
                Err(_) => warn!("⏱️ Quote for {} on {} timed out", symbol, route.exchange),
            }
        }
        quotes
    }

    /// Drop routes whose venue touch is worse than `expected` by more than
    /// `max_slippage`. Unquoted venues stay; if every quoted venue is dropped
    /// and nothing else remains, the worst offender is reported.
    fn within_slippage(
        &self,
        order: &Order,
        expected: Option<Decimal>,
        routes: Vec<Route>,
        quotes: &HashMap<ExchangeId, BidAsk>,
    ) -> Result<Vec<Route>> {
        let Some(expected) = expected.filter(|p| *p > Decimal::ZERO) else {
            return Ok(routes);
        };
        let max = self.ctx.config.routing.max_slippage;
        let mut worst: Option<(ExchangeId, Decimal)> = None;
        let mut kept = Vec::with_capacity(routes.len());
        for route in routes {
            let Some(quote) = quotes.get(&route.exchange) else {
                kept.push(route);
                continue;
            };
            let slippage = adverse_slippage(order.side, expected, quote.touch(order.side));
            if slippage > max {
                debug!(
                    "Skipping {} for {}: touch {} is {} off {}",
                    route, order.client_order_id, quote.touch(order.side), slippage, expected
                );
                if worst.as_ref().is_none_or(|(_, w)| slippage > *w) {
                    worst = Some((route.exchange.clone(), slippage));
                }
                continue;
            }
            kept.push(route);
        }

        match (kept.is_empty(), worst) {
            (true, Some((exchange, slippage))) => {
                warn!("🛑 {} {}: every venue over slippage cap {}", order.client_order_id, order.symbol, max);
                Err(Error::SlippageExceeded {
                    symbol: order.symbol.clone(),
                    exchange,
                    slippage,
                    max,
                })
            }
            _ => Ok(kept),
        }
    }

    fn choose_policy(&self, order: &Order, reference: Option<Decimal>, routes: &[Route], spec: &SymbolSpec) -> SplitPolicy {
        let cfg = &self.ctx.config.routing;
        let notional = order.notional(reference.unwrap_or(Decimal::ZERO));
        let single = SplitPolicy::Fixed { chunk: order.quantity };

        if notional < cfg.min_split_notional {
            return single;
        }
        if let Some(conditions) = self.market_conditions(&order.symbol) {
            return if notional >= cfg.large_order_notional {
                SplitPolicy::Optimal(conditions)
            } else {
                SplitPolicy::Liquidity {
                    shares: conditions.venue_liquidity,
                }
            };
        }

        // one slice per distinct route, chunk rounded up to the lot
        let lanes = Decimal::from(routes.len().min(cfg.max_splits) as u64);
        let chunk = if spec.lot_size > Decimal::ZERO {
            (order.quantity / lanes / spec.lot_size).ceil() * spec.lot_size
        } else {
            order.quantity / lanes
        };
        if chunk <= Decimal::ZERO || chunk < spec.min_lot || chunk > order.quantity {
            return single;
        }
        let remainder = order.quantity - (order.quantity / chunk).floor() * chunk;
        if !remainder.is_zero() && remainder < spec.min_lot {
            return single;
        }
        SplitPolicy::Fixed { chunk }
    }
}

/// Best touch across venues: lowest ask for a buy, highest bid for a sell
fn best_touch(quotes: &HashMap<ExchangeId, BidAsk>, side: Side) -> Option<Decimal> {
    let touches = quotes.values().map(|q| q.touch(side));
    match side {
        Side::Buy => touches.min(),
        Side::Sell => touches.max(),
    }
}

/// Fraction by which `touch` is worse than `expected`; negative when better
fn adverse_slippage(side: Side, expected: Decimal, touch: Decimal) -> Decimal {
    match side {
        Side::Buy => (touch - expected) / expected,
        Side::Sell => (expected - touch) / expected,
    }
}

fn rate_class(order: &Order) -> RateClass {
    match order.order_type {
        OrderType::Market => RateClass::Taker,
        OrderType::Limit => RateClass::Maker,
    }
}
