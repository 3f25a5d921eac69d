//! Paper exchange - In-process venue with scripted behavior

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::core::config::VenueConfig;
use crate::core::{
    AccountId, BidAsk, Error, ExchangeClient, ExchangeId, OrderAck, OrderStatus, OrderType, Result, RouteSlice,
    Side, Symbol,
};

/// How the venue answers `place_order`
#[derive(Debug, Clone, PartialEq)]
pub enum PaperBehavior {
    Fill,
    /// Fill this fraction of each order
    Partial(Decimal),
    Reject(String),
    /// Never answer; exercises caller timeouts
    Hang,
}

pub struct PaperExchange {
    id: ExchangeId,
    latency: Duration,
    fee_rate: Decimal,
    quotes: DashMap<Symbol, BidAsk>,
    behavior: RwLock<PaperBehavior>,
    /// Per-symbol override, checked before `behavior`
    symbol_behavior: DashMap<Symbol, PaperBehavior>,
    next_id: AtomicU64,
    placed: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PaperExchange {
    pub fn new(id: impl Into<ExchangeId>, latency: Duration, fee_rate: Decimal) -> Self {
        Self {
            id: id.into(),
            latency,
            fee_rate,
            quotes: DashMap::new(),
            behavior: RwLock::new(PaperBehavior::Fill),
            symbol_behavior: DashMap::new(),
            next_id: AtomicU64::new(1),
            placed: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Charges the venue's taker fee
    pub fn from_venue(venue: &VenueConfig, latency: Duration) -> Self {
        Self::new(venue.exchange.clone(), latency, venue.taker_fee)
    }

    pub fn set_quote(&self, symbol: Symbol, bid: Decimal, ask: Decimal) {
        self.set_book(BidAsk {
            symbol,
            bid,
            bid_qty: Decimal::TEN,
            ask,
            ask_qty: Decimal::TEN,
            timestamp: Utc::now(),
        });
    }

    pub fn set_book(&self, quote: BidAsk) {
        self.quotes.insert(quote.symbol.clone(), quote);
    }

    pub fn set_behavior(&self, behavior: PaperBehavior) {
        *self.behavior.write() = behavior;
    }

    pub fn set_symbol_behavior(&self, symbol: Symbol, behavior: PaperBehavior) {
        self.symbol_behavior.insert(symbol, behavior);
    }

    /// Orders that reached the venue, including ones that later hung
    pub fn placed(&self) -> u64 {
        self.placed.load(Ordering::Relaxed)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    fn behavior_for(&self, symbol: &Symbol) -> PaperBehavior {
        self.symbol_behavior
            .get(symbol)
            .map(|b| b.value().clone())
            .unwrap_or_else(|| self.behavior.read().clone())
    }

    /// Execution price, or None when a limit order would rest
    fn match_price(&self, slice: &RouteSlice) -> Result<Option<Decimal>> {
        let quote = self.quotes.get(&slice.symbol).map(|q| q.value().clone());
        match (slice.order_type, quote, slice.expected_price) {
            (OrderType::Market, Some(q), _) => Ok(Some(q.touch(slice.side))),
            (OrderType::Market, None, _) => Err(Error::Exchange(format!("{}: no book for {}", self.id, slice.symbol))),
            (OrderType::Limit, Some(q), Some(limit)) => {
                let touch = q.touch(slice.side);
                let crosses = match slice.side {
                    Side::Buy => limit >= touch,
                    Side::Sell => limit <= touch,
                };
                Ok(crosses.then_some(touch))
            }
            (OrderType::Limit, None, Some(limit)) => Ok(Some(limit)),
            (OrderType::Limit, _, None) => Err(Error::Exchange(format!("{}: limit order without price", self.id))),
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    async fn place_order(&self, slice: &RouteSlice) -> Result<OrderAck> {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::Relaxed);
        self.placed.fetch_add(1, Ordering::Relaxed);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let fraction = match self.behavior_for(&slice.symbol) {
            PaperBehavior::Fill => Decimal::ONE,
            PaperBehavior::Partial(f) => f.clamp(Decimal::ZERO, Decimal::ONE),
            PaperBehavior::Reject(msg) => return Err(Error::Exchange(format!("{}: {}", self.id, msg))),
            PaperBehavior::Hang => std::future::pending().await,
        };

        let exchange_order_id = format!("{}-{}", self.id, self.next_id.fetch_add(1, Ordering::Relaxed));
        let Some(price) = self.match_price(slice)? else {
            debug!("{} resting {} {} {} @ {:?}", self.id, slice.side, slice.quantity, slice.symbol, slice.expected_price);
            return Ok(OrderAck {
                exchange_order_id,
                status: OrderStatus::New,
                filled_quantity: Decimal::ZERO,
                avg_price: None,
                fee: Decimal::ZERO,
            });
        };

        let filled = slice.quantity * fraction;
        let status = if filled >= slice.quantity {
            OrderStatus::Filled
        } else if filled.is_zero() {
            OrderStatus::Cancelled
        } else {
            // IOC semantics for the paper venue: the rest is cancelled
            OrderStatus::PartiallyFilled
        };
        debug!("{} filled {}/{} {} @ {}", self.id, filled, slice.quantity, slice.symbol, price);

        Ok(OrderAck {
            exchange_order_id,
            status,
            filled_quantity: filled,
            avg_price: (!filled.is_zero()).then_some(price),
            fee: filled * price * self.fee_rate,
        })
    }

    async fn cancel_order(&self, account: &AccountId, order_id: &str) -> Result<()> {
        debug!("{} cancel {} on {}", self.id, order_id, account);
        Ok(())
    }

    async fn get_quote(&self, symbol: &Symbol) -> Result<BidAsk> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.quotes
            .get(symbol)
            .map(|q| q.value().clone())
            .ok_or_else(|| Error::Exchange(format!("{}: no book for {}", self.id, symbol)))
    }
}
