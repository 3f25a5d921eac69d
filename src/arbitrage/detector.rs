//! Arbitrage detector - Cross-venue quote comparison
//!
//! Every quote update re-evaluates the venue pairs it belongs to, in both
//! directions. Opportunities leave through a bounded channel with a
//! non-blocking send; a full channel drops the opportunity and counts it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

use crate::context::EngineContext;
use crate::core::config::ArbitrageConfig;
use crate::core::{BidAsk, ExchangeId, Market, PositionSource, Route, Symbol, SymbolSpec};
use crate::router::RateClass;

#[derive(Debug, Clone, Serialize)]
pub struct ArbitrageOpportunity {
    pub id: String,
    /// Strictly increasing across the detector
    pub sequence: u64,
    pub symbol: Symbol,
    pub buy: Route,
    pub sell: Route,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub quantity: Decimal,
    pub buy_fee_rate: Decimal,
    pub sell_fee_rate: Decimal,
    /// Net of both taker fees
    pub profit_rate: Decimal,
    pub net_profit: Decimal,
    pub detected_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl ArbitrageOpportunity {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.valid_until
    }

    pub fn notional(&self) -> Decimal {
        self.quantity * self.buy_price
    }
}

struct VenueQuote {
    route: Route,
    quote: BidAsk,
    received: Instant,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectorStats {
    pub quotes: u64,
    pub detected: u64,
    pub dropped: u64,
    pub stale_skipped: u64,
}

pub struct ArbitrageDetector {
    ctx: Arc<EngineContext>,
    config: ArbitrageConfig,
    books: DashMap<Symbol, Vec<VenueQuote>>,
    sequence: AtomicU64,
    tx: flume::Sender<ArbitrageOpportunity>,
    quotes: AtomicU64,
    detected: AtomicU64,
    dropped: AtomicU64,
    stale_skipped: AtomicU64,
}

impl ArbitrageDetector {
    /// Detector plus the receiving end of its opportunity channel
    pub fn new(ctx: Arc<EngineContext>) -> (Self, flume::Receiver<ArbitrageOpportunity>) {
        let config = ctx.config.arbitrage.clone();
        let (tx, rx) = flume::bounded(config.channel_capacity.max(1));
        let detector = Self {
            ctx,
            config,
            books: DashMap::new(),
            sequence: AtomicU64::new(0),
            tx,
            quotes: AtomicU64::new(0),
            detected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            stale_skipped: AtomicU64::new(0),
        };
        (detector, rx)
    }

    /// Ingest one top-of-book update; returns how many opportunities it produced
    pub fn on_quote(&self, exchange: &ExchangeId, quote: BidAsk) -> usize {
        self.quotes.fetch_add(1, Ordering::Relaxed);
        if !quote.is_valid() || !self.config.symbols.contains(&quote.symbol) {
            return 0;
        }
        let Some(route) = self.route_for(exchange, &quote.symbol) else {
            return 0;
        };
        let Ok(spec) = self.ctx.symbol(&quote.symbol).cloned() else {
            return 0;
        };

        let symbol = quote.symbol.clone();
        let mut book = self.books.entry(symbol).or_default();
        let fresh = VenueQuote {
            route,
            quote,
            received: Instant::now(),
        };
        match book.iter_mut().find(|v| &v.route.exchange == exchange) {
            Some(slot) => *slot = fresh,
            None => book.push(fresh),
        }

        let staleness = self.config.quote_staleness();
        let Some(updated) = book.iter().find(|v| &v.route.exchange == exchange) else {
            return 0;
        };
        let mut found = Vec::new();
        for other in book.iter().filter(|v| &v.route.exchange != exchange) {
            if other.received.elapsed() > staleness {
                self.stale_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            found.extend(self.evaluate(updated, other, &spec));
            found.extend(self.evaluate(other, updated, &spec));
        }
        drop(book);

        let emitted = found.len();
        for opportunity in found {
            self.publish(opportunity);
        }
        emitted
    }

    /// Buy at `buy`'s ask, sell at `sell`'s bid
    fn evaluate(&self, buy: &VenueQuote, sell: &VenueQuote, spec: &SymbolSpec) -> Option<ArbitrageOpportunity> {
        let (buy_price, sell_price) = (buy.quote.ask, sell.quote.bid);
        if sell_price <= buy_price {
            return None;
        }

        let volume = self.ctx.volume_info(RateClass::Taker);
        let buy_fee_rate = self.ctx.fees.effective_rate(&buy.route.exchange, &volume);
        let sell_fee_rate = self.ctx.fees.effective_rate(&sell.route.exchange, &volume);
        let profit_rate = (sell_price - buy_price) / buy_price - (buy_fee_rate + sell_fee_rate);
        if profit_rate < self.config.min_profit_rate {
            return None;
        }

        let mut quantity = buy.quote.ask_qty.min(sell.quote.bid_qty);
        if quantity * buy_price > self.config.max_position_notional {
            quantity = self.config.max_position_notional / buy_price;
        }
        let quantity = spec.round_lot(quantity);
        if quantity < spec.min_lot {
            return None;
        }

        let net_profit = quantity * buy_price * profit_rate;
        if net_profit < self.config.min_profit_amount {
            return None;
        }
        if !self.has_balance(buy, sell, spec, quantity, buy_fee_rate) {
            debug!(
                "Skipping {} {}->{}: insufficient balance for {}",
                spec.symbol, buy.route.exchange, sell.route.exchange, quantity
            );
            return None;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let detected_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.opportunity_ttl()).unwrap_or_default();
        Some(ArbitrageOpportunity {
            id: format!("{}_{}_{}_{}", spec.symbol, buy.route.exchange, sell.route.exchange, sequence),
            sequence,
            symbol: spec.symbol.clone(),
            buy: buy.route.clone(),
            sell: sell.route.clone(),
            buy_price,
            sell_price,
            quantity,
            buy_fee_rate,
            sell_fee_rate,
            profit_rate,
            net_profit,
            detected_at,
            valid_until: detected_at + ttl,
        })
    }

    /// Quote currency on the buy account; base inventory on a spot sell account,
    /// or free margin covering `quantity * bid / max_leverage` on a futures one
    fn has_balance(&self, buy: &VenueQuote, sell: &VenueQuote, spec: &SymbolSpec, quantity: Decimal, fee_rate: Decimal) -> bool {
        let buyer = self.ctx.positions.account_state(&buy.route.account_key());
        let seller = self.ctx.positions.account_state(&sell.route.account_key());
        let cost = quantity * buy.quote.ask * (Decimal::ONE + fee_rate);

        let can_buy = buyer.free(&spec.quote) >= cost;
        let can_sell = match sell.route.market {
            Market::Spot => seller.free(&spec.base) >= quantity,
            // margin for the short at the leverage cap
            Market::Futures => {
                let limits = self.ctx.limits.load();
                limits.max_leverage > Decimal::ZERO
                    && seller.free(&limits.margin_asset) * limits.max_leverage >= quantity * sell.quote.bid
            }
        };
        can_buy && can_sell
    }

    fn publish(&self, opportunity: ArbitrageOpportunity) {
        self.detected.fetch_add(1, Ordering::Relaxed);
        info!(
            "💰 Arb {} buy {} @ {} sell {} @ {} qty {} net {} ({:.4}%)",
            opportunity.symbol,
            opportunity.buy.exchange,
            opportunity.buy_price,
            opportunity.sell.exchange,
            opportunity.sell_price,
            opportunity.quantity,
            opportunity.net_profit.round_dp(2),
            opportunity.profit_rate * Decimal::ONE_HUNDRED
        );
        if self.tx.try_send(opportunity).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn route_for(&self, exchange: &ExchangeId, symbol: &Symbol) -> Option<Route> {
        let venue = self
            .ctx
            .config
            .venues
            .iter()
            .find(|v| &v.exchange == exchange && (v.symbols.is_empty() || v.symbols.contains(symbol)))?;
        let account = venue.accounts.first()?;
        Some(Route::new(venue.exchange.clone(), account.clone(), venue.market))
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            quotes: self.quotes.load(Ordering::Relaxed),
            detected: self.detected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            stale_skipped: self.stale_skipped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use rust_decimal_macros::dec;

    fn book(symbol: &str, bid: Decimal, ask: Decimal) -> BidAsk {
        BidAsk {
            symbol: Symbol::new(symbol),
            bid,
            bid_qty: dec!(5),
            ask,
            ask_qty: dec!(5),
            timestamp: Utc::now(),
        }
    }

    fn detector(config: Config) -> (ArbitrageDetector, flume::Receiver<ArbitrageOpportunity>) {
        ArbitrageDetector::new(EngineContext::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_detects_net_of_fees() {
        let (detector, rx) = detector(Config::default());
        assert_eq!(detector.on_quote(&"binance".into(), book("BTCUSDT", dec!(39990), dec!(40000))), 0);
        // okx bids 0.5% over binance ask; 0.2% goes to fees
        assert_eq!(detector.on_quote(&"okx".into(), book("BTCUSDT", dec!(40200), dec!(40210))), 1);

        let opp = rx.try_recv().unwrap();
        assert_eq!(opp.buy.exchange.as_str(), "binance");
        assert_eq!(opp.sell.exchange.as_str(), "okx");
        assert_eq!(opp.profit_rate, dec!(0.003));
        // capped by max position notional 10,000
        assert_eq!(opp.quantity, dec!(0.25));
        assert_eq!(opp.net_profit, dec!(30));
        assert!(opp.valid_until > opp.detected_at);
    }

    #[tokio::test]
    async fn test_reverse_direction_found() {
        let (detector, rx) = detector(Config::default());
        detector.on_quote(&"okx".into(), book("BTCUSDT", dec!(40200), dec!(40210)));
        detector.on_quote(&"binance".into(), book("BTCUSDT", dec!(39990), dec!(40000)));
        let opp = rx.try_recv().unwrap();
        assert_eq!(opp.buy.exchange.as_str(), "binance");
    }

    #[tokio::test]
    async fn test_thin_edge_ignored() {
        let (detector, rx) = detector(Config::default());
        detector.on_quote(&"binance".into(), book("BTCUSDT", dec!(39990), dec!(40000)));
        // 0.25% gross, 0.05% net < 0.1% threshold
        detector.on_quote(&"okx".into(), book("BTCUSDT", dec!(40100), dec!(40110)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_quotes_skipped() {
        let mut config = Config::default();
        config.arbitrage.quote_staleness_ms = 10;
        let (detector, rx) = detector(config);
        detector.on_quote(&"binance".into(), book("BTCUSDT", dec!(39990), dec!(40000)));
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        detector.on_quote(&"okx".into(), book("BTCUSDT", dec!(40200), dec!(40210)));

        assert!(rx.try_recv().is_err());
        assert_eq!(detector.stats().stale_skipped, 1);
    }

    #[tokio::test]
    async fn test_full_channel_counts_drops() {
        let mut config = Config::default();
        config.arbitrage.channel_capacity = 1;
        let (detector, _rx) = detector(config);
        detector.on_quote(&"binance".into(), book("BTCUSDT", dec!(39990), dec!(40000)));
        detector.on_quote(&"okx".into(), book("BTCUSDT", dec!(40200), dec!(40210)));
        detector.on_quote(&"bybit".into(), book("BTCUSDT", dec!(40200), dec!(40210)));

        let stats = detector.stats();
        assert_eq!(stats.detected, 2);
        assert_eq!(stats.dropped, 1);
    }

    fn futures_seller(margin: i64) -> Config {
        let mut config = Config::default();
        let okx = &mut config.venues[1];
        okx.market = Market::Futures;
        okx.paper_balances = [("USDT".to_string(), Decimal::from(margin))].into_iter().collect();
        config
    }

    #[tokio::test]
    async fn test_futures_sell_needs_margin_for_leverage() {
        // 0.25 @ 40200 at 10x needs 1005 USDT of margin
        let (thin, rx) = detector(futures_seller(500));
        thin.on_quote(&"binance".into(), book("BTCUSDT", dec!(39990), dec!(40000)));
        assert_eq!(thin.on_quote(&"okx".into(), book("BTCUSDT", dec!(40200), dec!(40210))), 0);
        assert!(rx.try_recv().is_err());

        let (funded, rx) = detector(futures_seller(1005));
        funded.on_quote(&"binance".into(), book("BTCUSDT", dec!(39990), dec!(40000)));
        assert_eq!(funded.on_quote(&"okx".into(), book("BTCUSDT", dec!(40200), dec!(40210))), 1);
        assert_eq!(rx.try_recv().unwrap().sell.market, Market::Futures);
    }

    #[tokio::test]
    async fn test_sequence_increases() {
        let (detector, rx) = detector(Config::default());
        detector.on_quote(&"binance".into(), book("BTCUSDT", dec!(39990), dec!(40000)));
        detector.on_quote(&"okx".into(), book("BTCUSDT", dec!(40200), dec!(40210)));
        detector.on_quote(&"okx".into(), book("BTCUSDT", dec!(40300), dec!(40310)));
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(second.sequence > first.sequence);
    }
}
