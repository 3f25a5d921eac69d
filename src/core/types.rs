//! Core types - Strong typing for safety

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Tradeable symbol (e.g., "BTCUSDT")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Exchange identifier (e.g., "binance")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(String);

impl ExchangeId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Trading account on one exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// (exchange, account) pair; the unit of balances, positions and rate limits
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey {
    pub exchange: ExchangeId,
    pub account: AccountId,
}

impl AccountKey {
    pub fn new(exchange: impl Into<ExchangeId>, account: impl Into<AccountId>) -> Self {
        Self {
            exchange: exchange.into(),
            account: account.into(),
        }
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.account)
    }
}

/// Market type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    #[default]
    Spot,
    Futures,
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Market::Spot => write!(f, "spot"),
            Market::Futures => write!(f, "futures"),
        }
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    #[default]
    Gtc,
    Ioc,
    Fok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
    Both,
}

/// Exchange-side order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

/// Parent order as submitted to the router. Not mutated after submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub position_side: Option<PositionSide>,
    pub market: Market,
    /// Pin the order to one account; otherwise the router picks routes
    pub account: Option<AccountKey>,
    /// Strategy tag, scope for strategy-level kill switches
    pub strategy: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new_market(symbol: Symbol, side: Side, quantity: Decimal) -> Self {
        Self {
            client_order_id: format!("aleph-{}", Uuid::new_v4().simple()),
            symbol,
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: TimeInForce::Ioc,
            reduce_only: false,
            position_side: None,
            market: Market::Spot,
            account: None,
            strategy: None,
            created_at: Utc::now(),
        }
    }

    pub fn new_limit(symbol: Symbol, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            time_in_force: TimeInForce::Gtc,
            ..Self::new_market(symbol, side, quantity)
        }
    }

    pub fn with_account(mut self, account: AccountKey) -> Self {
        self.account = Some(account);
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn with_time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = tif;
        self
    }

    /// Marks the order as a futures order
    pub fn with_position_side(mut self, side: PositionSide) -> Self {
        self.position_side = Some(side);
        self.market = Market::Futures;
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn is_futures(&self) -> bool {
        self.market == Market::Futures || self.position_side.is_some()
    }

    /// Notional at the limit price, or at `reference` for priceless orders
    pub fn notional(&self, reference: Decimal) -> Decimal {
        self.price.unwrap_or(reference) * self.quantity
    }
}

/// (exchange, account, market) destination of a slice
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub exchange: ExchangeId,
    pub account: AccountId,
    pub market: Market,
}

impl Route {
    pub fn new(exchange: impl Into<ExchangeId>, account: impl Into<AccountId>, market: Market) -> Self {
        Self {
            exchange: exchange.into(),
            account: account.into(),
            market,
        }
    }

    pub fn account_key(&self) -> AccountKey {
        AccountKey {
            exchange: self.exchange.clone(),
            account: self.account.clone(),
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.exchange, self.account, self.market)
    }
}

/// Child order bound to one route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSlice {
    pub id: Uuid,
    pub parent_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub route: Route,
    pub quantity: Decimal,
    pub expected_price: Option<Decimal>,
    /// 1 is dispatched first
    pub priority: u32,
    pub execute_at: Option<DateTime<Utc>>,
    pub estimated_fee: Decimal,
}

impl RouteSlice {
    pub fn new(parent: &Order, route: Route, quantity: Decimal, priority: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: parent.client_order_id.clone(),
            symbol: parent.symbol.clone(),
            side: parent.side,
            order_type: parent.order_type,
            time_in_force: parent.time_in_force,
            reduce_only: parent.reduce_only,
            route,
            quantity,
            expected_price: parent.price,
            priority,
            execute_at: None,
            estimated_fee: Decimal::ZERO,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.expected_price.unwrap_or(Decimal::ZERO) * self.quantity
    }
}

/// Top of book
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidAsk {
    pub symbol: Symbol,
    pub bid: Decimal,
    pub bid_qty: Decimal,
    pub ask: Decimal,
    pub ask_qty: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl BidAsk {
    pub fn is_valid(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO && self.bid <= self.ask
    }

    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Price a taker pays on `side`
    pub fn touch(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }
}

/// Exchange acknowledgement of a placed order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_price: Option<Decimal>,
    pub fee: Decimal,
}

/// Confirmed execution applied to account state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub account: AccountKey,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    /// Charged in the quote asset
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Account balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn new(asset: impl Into<String>, free: Decimal) -> Self {
        Self {
            asset: asset.into(),
            free,
            locked: Decimal::ZERO,
        }
    }

    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Per-symbol trading rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: Symbol,
    pub base: String,
    pub quote: String,
    /// Quantity step
    pub lot_size: Decimal,
    /// Smallest quantity an exchange accepts
    pub min_lot: Decimal,
}

impl SymbolSpec {
    /// Round a quantity down to the lot step
    pub fn round_lot(&self, quantity: Decimal) -> Decimal {
        if self.lot_size <= Decimal::ZERO {
            return quantity;
        }
        (quantity / self.lot_size).floor() * self.lot_size
    }
}

/// Cooperative cancellation flag checked before each dispatch
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_identifiers_normalize_case() {
        assert_eq!(Symbol::new("btcusdt").as_str(), "BTCUSDT");
        assert_eq!(ExchangeId::new("Binance").as_str(), "binance");
        assert_eq!(AccountKey::new("okx", "main").to_string(), "okx:main");
    }

    #[test]
    fn test_round_lot() {
        let spec = SymbolSpec {
            symbol: Symbol::new("BTCUSDT"),
            base: "BTC".into(),
            quote: "USDT".into(),
            lot_size: dec!(0.001),
            min_lot: dec!(0.001),
        };
        assert_eq!(spec.round_lot(dec!(1.23456)), dec!(1.234));
        assert_eq!(spec.round_lot(dec!(0.0009)), dec!(0));
    }

    #[test]
    fn test_order_builders() {
        let order = Order::new_limit(Symbol::new("BTCUSDT"), Side::Buy, dec!(2), dec!(40000))
            .with_position_side(PositionSide::Long);
        assert!(order.is_futures());
        assert_eq!(order.notional(dec!(1)), dec!(80000));

        let market = Order::new_market(Symbol::new("BTCUSDT"), Side::Sell, dec!(2));
        assert_eq!(market.notional(dec!(39990)), dec!(79980));
        assert_eq!(market.time_in_force, TimeInForce::Ioc);
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
