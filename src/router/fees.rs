//! Fee optimizer - Per-venue schedules with volume tiers
//!
//! Tier discounts compound: every tier whose threshold the 30-day volume has
//! reached multiplies the base rate by `(1 - discount)`. More volume can only
//! lower the effective rate.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::core::config::{TierDiscount, VenueConfig};
use crate::core::{ExchangeId, RouteSlice, Side};

/// Rate charged to venues missing from config
const FALLBACK_RATE: Decimal = Decimal::from_parts(2, 0, 0, false, 3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateClass {
    Maker,
    #[default]
    Taker,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeeSchedule {
    pub venue: ExchangeId,
    pub maker_rate: Decimal,
    pub taker_rate: Decimal,
    /// Ascending by threshold
    pub tiers: Vec<TierDiscount>,
}

impl FeeSchedule {
    pub fn from_venue(venue: &VenueConfig) -> Self {
        let mut tiers = venue.tiers.clone();
        tiers.sort_by(|a, b| a.volume_threshold.cmp(&b.volume_threshold));
        Self {
            venue: venue.exchange.clone(),
            maker_rate: venue.maker_fee,
            taker_rate: venue.taker_fee,
            tiers,
        }
    }

    pub fn base_rate(&self, class: RateClass) -> Decimal {
        match class {
            RateClass::Maker => self.maker_rate,
            RateClass::Taker => self.taker_rate,
        }
    }

    pub fn effective_rate(&self, volume: Decimal, class: RateClass) -> Decimal {
        self.tiers
            .iter()
            .take_while(|t| volume >= t.volume_threshold)
            .fold(self.base_rate(class), |rate, tier| {
                let discount = match class {
                    RateClass::Maker => tier.maker_discount,
                    RateClass::Taker => tier.taker_discount,
                };
                rate * (Decimal::ONE - discount)
            })
    }

    /// First tier not yet reached
    pub fn next_tier(&self, volume: Decimal) -> Option<&TierDiscount> {
        self.tiers.iter().find(|t| volume < t.volume_threshold)
    }
}

/// 30-day traded volume per venue plus the rate class to price at
#[derive(Debug, Clone, Default, Serialize)]
pub struct VolumeInfo {
    pub monthly_volume: HashMap<ExchangeId, Decimal>,
    pub class: RateClass,
}

impl VolumeInfo {
    pub fn new(class: RateClass) -> Self {
        Self {
            monthly_volume: HashMap::new(),
            class,
        }
    }

    pub fn with_volume(mut self, venue: impl Into<ExchangeId>, volume: Decimal) -> Self {
        self.monthly_volume.insert(venue.into(), volume);
        self
    }

    pub fn volume(&self, venue: &ExchangeId) -> Decimal {
        self.monthly_volume.get(venue).copied().unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    VolumeTier,
    MakerRebate,
    VenueSwitch,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeeSuggestion {
    pub kind: SuggestionKind,
    pub description: String,
    /// Per month at the given volume
    pub estimated_savings: Decimal,
}

/// Fees aggregated per venue for a set of slices
#[derive(Debug, Clone, Serialize)]
pub struct FeeLine {
    pub venue: ExchangeId,
    pub quantity: Decimal,
    pub notional: Decimal,
    pub rate: Decimal,
    pub fee: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct VenueFee {
    pub venue: ExchangeId,
    pub base_rate: Decimal,
    pub effective_rate: Decimal,
    /// Base minus effective, at the venue's volume
    pub discount: Decimal,
}

pub struct FeeOptimizer {
    schedules: HashMap<ExchangeId, FeeSchedule>,
}

impl FeeOptimizer {
    pub fn new(schedules: impl IntoIterator<Item = FeeSchedule>) -> Self {
        Self {
            schedules: schedules.into_iter().map(|s| (s.venue.clone(), s)).collect(),
        }
    }

    pub fn from_venues(venues: &[VenueConfig]) -> Self {
        Self::new(venues.iter().map(FeeSchedule::from_venue))
    }

    pub fn schedule(&self, venue: &ExchangeId) -> Option<&FeeSchedule> {
        self.schedules.get(venue)
    }

    /// Rate for `venue` at the volume recorded in `volume`
    pub fn effective_rate(&self, venue: &ExchangeId, volume: &VolumeInfo) -> Decimal {
        self.schedules
            .get(venue)
            .map(|s| s.effective_rate(volume.volume(venue), volume.class))
            .unwrap_or(FALLBACK_RATE)
    }

    pub fn slice_fee(&self, slice: &RouteSlice, volume: &VolumeInfo) -> Decimal {
        slice.notional() * self.effective_rate(&slice.route.exchange, volume)
    }

    pub fn calculate_total_fees(&self, routes: &[RouteSlice], side: Side, volume: &VolumeInfo) -> Decimal {
        let total = routes.iter().map(|s| self.slice_fee(s, volume)).sum();
        debug!("Estimated {} fees over {} slices: {}", side, routes.len(), total);
        total
    }

    /// Rank slices cheapest first and rewrite priorities 1..n.
    ///
    /// Stable: equal-fee slices keep their relative order unless the expected
    /// price breaks the tie (lower for buys, higher for sells).
    pub fn optimize_for_fees(&self, routes: Vec<RouteSlice>, side: Side, volume: &VolumeInfo) -> Vec<RouteSlice> {
        let mut ranked: Vec<(Decimal, RouteSlice)> = routes
            .into_iter()
            .map(|s| (self.effective_rate(&s.route.exchange, volume), s))
            .collect();

        ranked.sort_by(|(rate_a, a), (rate_b, b)| {
            rate_a.cmp(rate_b).then_with(|| match (a.expected_price, b.expected_price) {
                (Some(pa), Some(pb)) => match side {
                    Side::Buy => pa.cmp(&pb),
                    Side::Sell => pb.cmp(&pa),
                },
                _ => std::cmp::Ordering::Equal,
            })
        });

        ranked
            .into_iter()
            .enumerate()
            .map(|(i, (rate, mut slice))| {
                slice.priority = i as u32 + 1;
                slice.estimated_fee = slice.notional() * rate;
                slice
            })
            .collect()
    }

    pub fn fee_breakdown(&self, routes: &[RouteSlice], volume: &VolumeInfo) -> Vec<FeeLine> {
        let mut lines: Vec<FeeLine> = Vec::new();
        for slice in routes {
            let venue = &slice.route.exchange;
            let fee = self.slice_fee(slice, volume);
            match lines.iter_mut().find(|l| &l.venue == venue) {
                Some(line) => {
                    line.quantity += slice.quantity;
                    line.notional += slice.notional();
                    line.fee += fee;
                }
                None => lines.push(FeeLine {
                    venue: venue.clone(),
                    quantity: slice.quantity,
                    notional: slice.notional(),
                    rate: self.effective_rate(venue, volume),
                    fee,
                }),
            }
        }
        lines
    }

    /// All configured venues, cheapest effective rate first
    pub fn compare_venues(&self, volume: &VolumeInfo) -> Vec<VenueFee> {
        let mut venues: Vec<VenueFee> = self
            .schedules
            .values()
            .map(|s| {
                let base_rate = s.base_rate(volume.class);
                let effective_rate = s.effective_rate(volume.volume(&s.venue), volume.class);
                VenueFee {
                    venue: s.venue.clone(),
                    base_rate,
                    effective_rate,
                    discount: base_rate - effective_rate,
                }
            })
            .collect();
        venues.sort_by(|a, b| a.effective_rate.cmp(&b.effective_rate).then_with(|| a.venue.cmp(&b.venue)));
        venues
    }

    /// Ways to cut fees on `venue` given 30-day `volume`
    pub fn suggest_optimizations(&self, venue: &ExchangeId, volume: Decimal) -> Vec<FeeSuggestion> {
        let Some(schedule) = self.schedules.get(venue) else {
            return Vec::new();
        };
        let mut suggestions = Vec::new();
        let taker_now = schedule.effective_rate(volume, RateClass::Taker);

        if let Some(tier) = schedule.next_tier(volume) {
            let taker_next = schedule.effective_rate(tier.volume_threshold, RateClass::Taker);
            suggestions.push(FeeSuggestion {
                kind: SuggestionKind::VolumeTier,
                description: format!(
                    "{} more 30-day volume on {} reaches the {} tier, taker {} -> {}",
                    (tier.volume_threshold - volume).normalize(),
                    venue,
                    tier.volume_threshold.normalize(),
                    taker_now.normalize(),
                    taker_next.normalize()
                ),
                estimated_savings: tier.volume_threshold * (taker_now - taker_next),
            });
        }

        let maker_now = schedule.effective_rate(volume, RateClass::Maker);
        if maker_now < taker_now {
            suggestions.push(FeeSuggestion {
                kind: SuggestionKind::MakerRebate,
                description: format!(
                    "post-only limit orders on {} pay maker {} instead of taker {}",
                    venue,
                    maker_now.normalize(),
                    taker_now.normalize()
                ),
                estimated_savings: volume * (taker_now - maker_now),
            });
        }

        let cheaper = self
            .schedules
            .values()
            .filter(|s| &s.venue != venue)
            .map(|s| (s, s.effective_rate(volume, RateClass::Taker)))
            .filter(|(_, rate)| *rate < taker_now)
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.venue.cmp(&b.0.venue)));
        if let Some((other, rate)) = cheaper {
            suggestions.push(FeeSuggestion {
                kind: SuggestionKind::VenueSwitch,
                description: format!(
                    "the same volume on {} would pay taker {} instead of {}",
                    other.venue,
                    rate.normalize(),
                    taker_now.normalize()
                ),
                estimated_savings: volume * (taker_now - rate),
            });
        }

        suggestions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::{Market, Order, Route, Symbol};
    use rust_decimal_macros::dec;

    fn optimizer() -> FeeOptimizer {
        FeeOptimizer::from_venues(&Config::default().venues)
    }

    fn slice(venue: &str, qty: Decimal, price: Decimal) -> RouteSlice {
        let order = Order::new_limit(Symbol::new("BTCUSDT"), Side::Buy, qty, price);
        RouteSlice::new(&order, Route::new(venue, "main", Market::Spot), qty, 1)
    }

    #[test]
    fn test_tier_discounts_compound() {
        let fees = optimizer();
        let binance = ExchangeId::new("binance");
        let at = |v: Decimal| fees.effective_rate(&binance, &VolumeInfo::default().with_volume("binance", v));

        assert_eq!(at(dec!(0)), dec!(0.001));
        assert_eq!(at(dec!(1000000)), dec!(0.0009));
        // 0.001 * 0.9 * 0.8
        assert_eq!(at(dec!(50000000)), dec!(0.00072));
        assert!(at(dec!(100000000)) < at(dec!(50000000)));
    }

    #[test]
    fn test_unknown_venue_uses_fallback() {
        let rate = optimizer().effective_rate(&ExchangeId::new("kraken"), &VolumeInfo::default());
        assert_eq!(rate, dec!(0.002));
    }

    #[test]
    fn test_optimize_ranks_cheapest_first() {
        let fees = optimizer();
        let volume = VolumeInfo::new(RateClass::Maker);
        let slices = vec![
            slice("binance", dec!(1), dec!(40000)),
            slice("bybit", dec!(2), dec!(40000)),
            slice("okx", dec!(3), dec!(40000)),
        ];
        let ranked = fees.optimize_for_fees(slices, Side::Buy, &volume);

        assert_eq!(ranked[0].route.exchange.as_str(), "okx");
        assert_eq!(ranked[0].priority, 1);
        assert_eq!(ranked[0].estimated_fee, dec!(96));
        // equal rates keep input order
        assert_eq!(ranked[1].route.exchange.as_str(), "binance");
        assert_eq!(ranked[2].route.exchange.as_str(), "bybit");
        assert_eq!(ranked.iter().map(|s| s.quantity).sum::<Decimal>(), dec!(6));
    }

    #[test]
    fn test_price_breaks_fee_ties() {
        let fees = optimizer();
        let slices = vec![
            slice("binance", dec!(1), dec!(40010)),
            slice("bybit", dec!(1), dec!(40000)),
        ];
        let buys = fees.optimize_for_fees(slices.clone(), Side::Buy, &VolumeInfo::default());
        assert_eq!(buys[0].route.exchange.as_str(), "bybit");
        let sells = fees.optimize_for_fees(slices, Side::Sell, &VolumeInfo::default());
        assert_eq!(sells[0].route.exchange.as_str(), "binance");
    }

    #[test]
    fn test_total_and_breakdown_agree() {
        let fees = optimizer();
        let slices = vec![
            slice("binance", dec!(1), dec!(40000)),
            slice("binance", dec!(1), dec!(40000)),
            slice("okx", dec!(1), dec!(40000)),
        ];
        let volume = VolumeInfo::default();
        let total = fees.calculate_total_fees(&slices, Side::Buy, &volume);
        let lines = fees.fee_breakdown(&slices, &volume);

        assert_eq!(total, dec!(120));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].quantity, dec!(2));
        assert_eq!(lines.iter().map(|l| l.fee).sum::<Decimal>(), total);
    }

    #[test]
    fn test_suggestions_at_50m() {
        let fees = optimizer();
        let suggestions = fees.suggest_optimizations(&ExchangeId::new("binance"), dec!(50000000));
        assert!(!suggestions.is_empty());
        assert!(suggestions.iter().any(|s| s.kind == SuggestionKind::VolumeTier));
        assert!(suggestions.iter().all(|s| s.estimated_savings > Decimal::ZERO));
        assert!(fees.suggest_optimizations(&ExchangeId::new("kraken"), dec!(1)).is_empty());
    }

    #[test]
    fn test_compare_venues_sorted() {
        let venues = optimizer().compare_venues(&VolumeInfo::new(RateClass::Maker));
        assert_eq!(venues.len(), 3);
        assert_eq!(venues[0].venue.as_str(), "okx");
        assert!(venues.windows(2).all(|w| w[0].effective_rate <= w[1].effective_rate));
    }
}
