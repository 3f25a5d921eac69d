//! Order splitter - Parent order to child slices
//!
//! Every policy conserves quantity exactly: slice quantities sum to the parent
//! quantity in decimal arithmetic. Rounding residue lands on one slice, never
//! dropped.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::core::config::RoutingConfig;
use crate::core::{Error, ExchangeId, Order, Result, Route, RouteSlice, SymbolSpec};

/// Market snapshot for the condition-driven policy
#[derive(Debug, Clone, Serialize)]
pub struct MarketConditions {
    /// e.g. 0.025 = 2.5%
    pub volatility: Decimal,
    /// 0..1, higher is deeper
    pub liquidity_score: Decimal,
    /// Relative spread, e.g. 0.001
    pub spread: Decimal,
    /// Share of available liquidity per venue; need not sum to 1
    pub venue_liquidity: HashMap<ExchangeId, Decimal>,
}

#[derive(Debug, Clone)]
pub enum SplitPolicy {
    /// Full chunks plus one smaller remainder slice
    Fixed { chunk: Decimal },
    /// Weights in percent, summing to 100
    Percentage { weights: Vec<Decimal> },
    /// Equal slices scheduled `duration / intervals` apart
    Twap { duration: Duration, intervals: u32 },
    /// One slice per venue, sized by liquidity share
    Liquidity { shares: HashMap<ExchangeId, Decimal> },
    /// Liquidity allocation with slice count driven by conditions
    Optimal(MarketConditions),
}

impl SplitPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            SplitPolicy::Fixed { .. } => "fixed",
            SplitPolicy::Percentage { .. } => "percentage",
            SplitPolicy::Twap { .. } => "twap",
            SplitPolicy::Liquidity { .. } => "liquidity",
            SplitPolicy::Optimal(_) => "optimal",
        }
    }
}

/// Per-call inputs
pub struct SplitParams<'a> {
    /// Candidate routes, cheapest first
    pub routes: &'a [Route],
    pub spec: &'a SymbolSpec,
    /// Anchor for TWAP schedules
    pub now: DateTime<Utc>,
}

pub struct OrderSplitter {
    config: RoutingConfig,
}

impl OrderSplitter {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    pub fn split(&self, order: &Order, policy: &SplitPolicy, params: &SplitParams<'_>) -> Result<Vec<RouteSlice>> {
        let quantity = order.quantity;
        if quantity <= Decimal::ZERO {
            return Err(invalid(format!("order quantity {} must be positive", quantity)));
        }
        if params.routes.is_empty() {
            return Err(invalid("no candidate routes".to_string()));
        }
        if params.spec.round_lot(quantity) != quantity {
            return Err(invalid(format!(
                "quantity {} is not a multiple of lot size {}",
                quantity, params.spec.lot_size
            )));
        }

        let slices = match policy {
            SplitPolicy::Fixed { chunk } => self.fixed(order, *chunk, params)?,
            SplitPolicy::Percentage { weights } => self.percentage(order, weights, params)?,
            SplitPolicy::Twap { duration, intervals } => self.twap(order, *duration, *intervals, params)?,
            SplitPolicy::Liquidity { shares } => {
                let venues = venue_shares(params.routes, shares)?;
                let counts = vec![1; venues.len()];
                allocate(order, &venues, counts, self.config.max_splits, params.spec)?
            }
            SplitPolicy::Optimal(conditions) => {
                let venues = venue_shares(params.routes, &conditions.venue_liquidity)?;
                let target = self.optimal_slice_count(quantity, conditions, venues.len(), params.spec);
                let total_share: Decimal = venues.iter().map(|(_, s)| *s).sum();
                let counts = venues
                    .iter()
                    .map(|(_, share)| {
                        let c = (Decimal::from(target as u64) * *share / total_share).round();
                        decimal_to_usize(c).max(1)
                    })
                    .collect();
                allocate(order, &venues, counts, self.config.max_splits, params.spec)?
            }
        };

        debug_assert_eq!(slices.iter().map(|s| s.quantity).sum::<Decimal>(), quantity);
        Ok(slices)
    }

    fn fixed(&self, order: &Order, chunk: Decimal, params: &SplitParams<'_>) -> Result<Vec<RouteSlice>> {
        let spec = params.spec;
        if chunk <= Decimal::ZERO {
            return Err(invalid(format!("chunk {} must be positive", chunk)));
        }
        if chunk > order.quantity {
            return Err(invalid(format!("chunk {} larger than quantity {}", chunk, order.quantity)));
        }
        if spec.round_lot(chunk) != chunk {
            return Err(invalid(format!("chunk {} is not a multiple of lot size {}", chunk, spec.lot_size)));
        }
        check_min_lot(spec, chunk)?;

        let full = (order.quantity / chunk).floor();
        let remainder = order.quantity - full * chunk;
        let count = decimal_to_usize(full) + usize::from(!remainder.is_zero());
        if count > self.config.max_splits {
            return Err(invalid(format!("{} slices exceed max splits {}", count, self.config.max_splits)));
        }
        if !remainder.is_zero() {
            check_min_lot(spec, remainder)?;
        }

        let quantities = std::iter::repeat_n(chunk, decimal_to_usize(full))
            .chain((!remainder.is_zero()).then_some(remainder));
        Ok(round_robin(order, params.routes, quantities))
    }

    fn percentage(&self, order: &Order, weights: &[Decimal], params: &SplitParams<'_>) -> Result<Vec<RouteSlice>> {
        if weights.is_empty() {
            return Err(invalid("no weights".to_string()));
        }
        if weights.len() > self.config.max_splits {
            return Err(invalid(format!("{} weights exceed max splits {}", weights.len(), self.config.max_splits)));
        }
        if let Some(w) = weights.iter().find(|w| **w <= Decimal::ZERO) {
            return Err(invalid(format!("weight {} must be positive", w)));
        }
        let sum: Decimal = weights.iter().sum();
        if (sum - Decimal::ONE_HUNDRED).abs() > self.config.weight_epsilon {
            return Err(invalid(format!("weights sum to {}, expected 100", sum)));
        }

        let mut quantities: Vec<Decimal> = weights[..weights.len() - 1]
            .iter()
            .map(|w| params.spec.round_lot(order.quantity * *w / Decimal::ONE_HUNDRED))
            .collect();
        let assigned: Decimal = quantities.iter().sum();
        quantities.push(order.quantity - assigned);

        for q in &quantities {
            check_min_lot(params.spec, *q)?;
        }
        Ok(round_robin(order, params.routes, quantities))
    }

    fn twap(&self, order: &Order, duration: Duration, intervals: u32, params: &SplitParams<'_>) -> Result<Vec<RouteSlice>> {
        if intervals == 0 {
            return Err(invalid("zero intervals".to_string()));
        }
        if duration.is_zero() {
            return Err(invalid("zero duration".to_string()));
        }
        let spacing = duration / intervals;

        let each = params.spec.round_lot(order.quantity / Decimal::from(intervals));
        check_min_lot(params.spec, each)?;
        let last = order.quantity - each * Decimal::from(intervals - 1);

        let quantities = std::iter::repeat_n(each, intervals as usize - 1).chain(std::iter::once(last));
        let mut slices = round_robin(order, params.routes, quantities);
        for (i, slice) in slices.iter_mut().enumerate() {
            let offset = chrono::Duration::from_std(spacing * i as u32)
                .map_err(|_| invalid(format!("duration {:?} out of range", duration)))?;
            slice.execute_at = Some(params.now + offset);
        }
        Ok(slices)
    }

    /// Slice count for the condition-driven policy.
    ///
    /// `intensity = (1 + volatility * vw + spread * sw) / max(liquidity, floor)`,
    /// `count = ceil(venues * intensity)`, clamped to `[venues, max_splits]` and
    /// to what the min lot allows. Non-decreasing in volatility and spread,
    /// non-increasing in liquidity score.
    pub fn optimal_slice_count(
        &self,
        quantity: Decimal,
        conditions: &MarketConditions,
        venues: usize,
        spec: &SymbolSpec,
    ) -> usize {
        let cfg = &self.config;
        let liquidity = conditions.liquidity_score.max(cfg.min_liquidity_score);
        let stress = Decimal::ONE
            + conditions.volatility.max(Decimal::ZERO) * cfg.volatility_weight
            + conditions.spread.max(Decimal::ZERO) * cfg.spread_weight;
        let intensity = stress / liquidity;

        let raw = decimal_to_usize((Decimal::from(venues as u64) * intensity).ceil());
        let lot_cap = decimal_to_usize((quantity / spec.min_lot).floor()).max(1);
        raw.max(venues).min(cfg.max_splits).min(lot_cap).max(1)
    }
}

fn invalid(msg: String) -> Error {
    Error::InvalidPolicyParams(msg)
}

fn check_min_lot(spec: &SymbolSpec, quantity: Decimal) -> Result<()> {
    if quantity < spec.min_lot {
        return Err(Error::ResidualBelowMinLot {
            symbol: spec.symbol.clone(),
            quantity,
            min_lot: spec.min_lot,
        });
    }
    Ok(())
}

fn decimal_to_usize(d: Decimal) -> usize {
    use rust_decimal::prelude::ToPrimitive;
    d.to_usize().unwrap_or(0)
}

/// Assign quantities to routes in turn, priorities 1..n
fn round_robin(order: &Order, routes: &[Route], quantities: impl IntoIterator<Item = Decimal>) -> Vec<RouteSlice> {
    quantities
        .into_iter()
        .enumerate()
        .map(|(i, q)| RouteSlice::new(order, routes[i % routes.len()].clone(), q, i as u32 + 1))
        .collect()
}

/// First route per venue with a positive share, largest share first
fn venue_shares(routes: &[Route], shares: &HashMap<ExchangeId, Decimal>) -> Result<Vec<(Route, Decimal)>> {
    let mut venues: Vec<(Route, Decimal)> = Vec::new();
    for route in routes {
        if venues.iter().any(|(r, _)| r.exchange == route.exchange) {
            continue;
        }
        if let Some(share) = shares.get(&route.exchange).filter(|s| **s > Decimal::ZERO) {
            venues.push((route.clone(), *share));
        }
    }
    if venues.is_empty() {
        return Err(invalid("no liquidity share for any candidate venue".to_string()));
    }
    // stable: ties keep fee order
    venues.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(venues)
}

/// Split quantity across venues by share, `counts[i]` slices on venue i.
/// Residue from lot rounding goes to the first (highest priority) slice.
fn allocate(
    order: &Order,
    venues: &[(Route, Decimal)],
    mut counts: Vec<usize>,
    max_splits: usize,
    spec: &SymbolSpec,
) -> Result<Vec<RouteSlice>> {
    let quantity = order.quantity;
    check_min_lot(spec, quantity)?;

    let total_share: Decimal = venues.iter().map(|(_, s)| *s).sum();
    let mut amounts: Vec<Decimal> = venues
        .iter()
        .map(|(_, share)| spec.round_lot(quantity * *share / total_share))
        .collect();

    // venues too small to trade, or past the split budget, fold into the top venue
    for i in 1..amounts.len() {
        if amounts[i] < spec.min_lot || i >= max_splits {
            amounts[i] = Decimal::ZERO;
            counts[i] = 0;
        }
    }
    let assigned: Decimal = amounts.iter().sum();
    amounts[0] += quantity - assigned;

    for (count, amount) in counts.iter_mut().zip(&amounts) {
        if amount.is_zero() {
            continue;
        }
        let lot_cap = decimal_to_usize((*amount / spec.min_lot).floor()).max(1);
        *count = (*count).clamp(1, lot_cap);
    }
    while counts.iter().sum::<usize>() > max_splits {
        // shave the busiest venue first; index order breaks ties
        let Some((i, _)) = counts
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > 1)
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
        else {
            break;
        };
        counts[i] -= 1;
    }

    let mut slices = Vec::new();
    for ((route, _), (amount, count)) in venues.iter().zip(amounts.iter().zip(&counts)) {
        if amount.is_zero() || *count == 0 {
            continue;
        }
        let each = spec.round_lot(*amount / Decimal::from(*count as u64));
        let first = *amount - each * Decimal::from(*count as u64 - 1);
        for part in std::iter::once(first).chain(std::iter::repeat_n(each, count - 1)) {
            let priority = slices.len() as u32 + 1;
            slices.push(RouteSlice::new(order, route.clone(), part, priority));
        }
    }
    Ok(slices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Market, Side, Symbol};
    use rust_decimal_macros::dec;

    fn spec() -> SymbolSpec {
        SymbolSpec {
            symbol: Symbol::new("BTCUSDT"),
            base: "BTC".into(),
            quote: "USDT".into(),
            lot_size: dec!(0.001),
            min_lot: dec!(0.001),
        }
    }

    fn routes() -> Vec<Route> {
        ["binance", "okx", "bybit"]
            .into_iter()
            .map(|v| Route::new(v, "main", Market::Spot))
            .collect()
    }

    fn order(qty: Decimal) -> Order {
        Order::new_limit(Symbol::new("BTCUSDT"), Side::Buy, qty, dec!(40000))
    }

    fn split(qty: Decimal, policy: SplitPolicy) -> Result<Vec<RouteSlice>> {
        let (spec, routes) = (spec(), routes());
        let params = SplitParams {
            routes: &routes,
            spec: &spec,
            now: Utc::now(),
        };
        OrderSplitter::new(RoutingConfig::default()).split(&order(qty), &policy, &params)
    }

    fn quantities(slices: &[RouteSlice]) -> Vec<Decimal> {
        slices.iter().map(|s| s.quantity).collect()
    }

    #[test]
    fn test_fixed_even() {
        let slices = split(dec!(10), SplitPolicy::Fixed { chunk: dec!(2) }).unwrap();
        assert_eq!(quantities(&slices), vec![dec!(2); 5]);
        let priorities: Vec<u32> = slices.iter().map(|s| s.priority).collect();
        assert_eq!(priorities, vec![1, 2, 3, 4, 5]);
        assert_eq!(slices[3].route.exchange.as_str(), "binance");
    }

    #[test]
    fn test_fixed_remainder_is_own_slice() {
        let slices = split(dec!(10.5), SplitPolicy::Fixed { chunk: dec!(2) }).unwrap();
        assert_eq!(slices.len(), 6);
        assert_eq!(slices[5].quantity, dec!(0.5));
    }

    #[test]
    fn test_fixed_rejects_bad_chunk() {
        assert!(matches!(
            split(dec!(1), SplitPolicy::Fixed { chunk: dec!(2) }),
            Err(Error::InvalidPolicyParams(_))
        ));
        assert!(matches!(
            split(dec!(1), SplitPolicy::Fixed { chunk: dec!(0) }),
            Err(Error::InvalidPolicyParams(_))
        ));
        // 100 slices > max splits
        assert!(matches!(
            split(dec!(10), SplitPolicy::Fixed { chunk: dec!(0.1) }),
            Err(Error::InvalidPolicyParams(_))
        ));
    }

    #[test]
    fn test_percentage_exact() {
        let weights = vec![dec!(50), dec!(30), dec!(20)];
        let slices = split(dec!(10), SplitPolicy::Percentage { weights }).unwrap();
        assert_eq!(quantities(&slices), vec![dec!(5), dec!(3), dec!(2)]);
    }

    #[test]
    fn test_percentage_last_absorbs_residue() {
        let weights = vec![dec!(33.33), dec!(33.33), dec!(33.34)];
        let slices = split(dec!(1), SplitPolicy::Percentage { weights }).unwrap();
        assert_eq!(quantities(&slices), vec![dec!(0.333), dec!(0.333), dec!(0.334)]);
    }

    #[test]
    fn test_percentage_weights_must_sum_to_100() {
        let weights = vec![dec!(50), dec!(30)];
        assert!(matches!(
            split(dec!(10), SplitPolicy::Percentage { weights }),
            Err(Error::InvalidPolicyParams(_))
        ));
    }

    #[test]
    fn test_percentage_below_min_lot() {
        let weights = vec![dec!(99.99), dec!(0.01)];
        assert!(matches!(
            split(dec!(1), SplitPolicy::Percentage { weights }),
            Err(Error::ResidualBelowMinLot { .. })
        ));
    }

    #[test]
    fn test_twap_spacing() {
        let slices = split(
            dec!(10),
            SplitPolicy::Twap {
                duration: Duration::from_secs(30 * 60),
                intervals: 6,
            },
        )
        .unwrap();
        assert_eq!(slices.len(), 6);
        for pair in slices.windows(2) {
            let delta = pair[1].execute_at.unwrap() - pair[0].execute_at.unwrap();
            assert_eq!(delta, chrono::Duration::minutes(5));
        }
        assert_eq!(slices.iter().map(|s| s.quantity).sum::<Decimal>(), dec!(10));
        assert_eq!(slices[5].quantity, dec!(1.67));
    }

    #[test]
    fn test_twap_zero_intervals() {
        let policy = SplitPolicy::Twap {
            duration: Duration::from_secs(60),
            intervals: 0,
        };
        assert!(matches!(split(dec!(1), policy), Err(Error::InvalidPolicyParams(_))));
    }

    #[test]
    fn test_liquidity_one_slice_per_venue() {
        let shares: HashMap<ExchangeId, Decimal> = [
            (ExchangeId::new("binance"), dec!(0.5)),
            (ExchangeId::new("okx"), dec!(0.3)),
            (ExchangeId::new("bybit"), dec!(0.2)),
        ]
        .into_iter()
        .collect();
        let slices = split(dec!(10), SplitPolicy::Liquidity { shares }).unwrap();
        assert_eq!(quantities(&slices), vec![dec!(5), dec!(3), dec!(2)]);
        assert_eq!(slices[0].route.exchange.as_str(), "binance");
    }

    #[test]
    fn test_optimal_conserves_and_respects_max() {
        let conditions = MarketConditions {
            volatility: dec!(0.025),
            liquidity_score: dec!(0.7),
            spread: dec!(0.001),
            venue_liquidity: [
                (ExchangeId::new("binance"), dec!(0.45)),
                (ExchangeId::new("okx"), dec!(0.35)),
                (ExchangeId::new("bybit"), dec!(0.20)),
            ]
            .into_iter()
            .collect(),
        };
        let slices = split(dec!(10.001), SplitPolicy::Optimal(conditions)).unwrap();
        assert_eq!(slices.iter().map(|s| s.quantity).sum::<Decimal>(), dec!(10.001));
        assert!(slices.len() >= 3 && slices.len() <= 10);
        // residue on the highest-priority slice
        assert_eq!(slices[0].route.exchange.as_str(), "binance");
        assert!(slices[0].quantity >= slices[1].quantity);
    }

    #[test]
    fn test_optimal_count_grows_with_volatility() {
        let splitter = OrderSplitter::new(RoutingConfig::default());
        let mut conditions = MarketConditions {
            volatility: dec!(0.01),
            liquidity_score: dec!(0.9),
            spread: dec!(0.0005),
            venue_liquidity: HashMap::new(),
        };
        let calm = splitter.optimal_slice_count(dec!(10), &conditions, 2, &spec());
        conditions.volatility = dec!(0.08);
        let stressed = splitter.optimal_slice_count(dec!(10), &conditions, 2, &spec());
        conditions.liquidity_score = dec!(0.2);
        let thin = splitter.optimal_slice_count(dec!(10), &conditions, 2, &spec());

        assert!(calm <= stressed);
        assert!(stressed <= thin);
        assert_eq!(thin, 10);
    }
}
