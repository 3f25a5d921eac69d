//! Configuration - Type-safe, validated config
//!
//! Loaded from a TOML file; every field has a default so a partial file works.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::core::types::{AccountId, ExchangeId, Market, Symbol, SymbolSpec};
use crate::core::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub risk: RiskLimits,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub arbitrage: ArbitrageConfig,

    /// Per-symbol lot rules
    #[serde(default = "default_symbols")]
    pub symbols: Vec<SymbolSpec>,

    /// Venues, their accounts and fee tables
    #[serde(default = "default_venues")]
    pub venues: Vec<VenueConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Paper,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Run mode: paper or live
    #[serde(default)]
    pub mode: RunMode,

    /// Bounded mailbox depth per account
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Simulated venue latency in paper mode
    #[serde(default = "default_paper_latency_ms")]
    pub paper_latency_ms: u64,
}

/// Hard admission limits. Swapped atomically at runtime by `RiskEngine::update_limits`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Max notional of a single order
    #[serde(default = "default_max_order_value")]
    pub max_order_value: Decimal,

    /// Max absolute position per account and symbol, in base units
    #[serde(default = "default_max_position_size")]
    pub max_position_size: Decimal,

    /// Per-symbol override of `max_position_size`
    #[serde(default)]
    pub position_limits: HashMap<Symbol, Decimal>,

    /// Max account leverage for futures orders
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,

    /// Daily realized+unrealized loss floor (positive number)
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,

    /// Max gross exposure per account
    #[serde(default = "default_max_exposure")]
    pub max_exposure: Decimal,

    /// Asset that backs futures margin
    #[serde(default = "default_margin_asset")]
    pub margin_asset: String,
}

impl RiskLimits {
    pub fn position_limit(&self, symbol: &Symbol) -> Decimal {
        self.position_limits
            .get(symbol)
            .copied()
            .unwrap_or(self.max_position_size)
    }
}

/// What `WorkerPool::submit` does once the queue is at depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Caller waits for space
    #[default]
    Block,
    /// Caller gets `Error::QueueFull`
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Queue depth before overflow policy applies (0 = 2x workers)
    #[serde(default)]
    pub queue_depth: usize,

    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Per-route timeout
    #[serde(default = "default_order_timeout_ms")]
    pub order_timeout_ms: u64,

    /// Decision-level timeout
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,

    /// Resubmissions after a route timeout
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl ExecutionConfig {
    pub fn queue_depth(&self) -> usize {
        if self.queue_depth == 0 {
            self.workers * 2
        } else {
            self.queue_depth
        }
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.order_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Upper bound on slices per decision
    #[serde(default = "default_max_splits")]
    pub max_splits: usize,

    /// Orders under this notional go out as one slice
    #[serde(default = "default_min_split_notional")]
    pub min_split_notional: Decimal,

    /// Orders at or above this notional use the market-condition split
    #[serde(default = "default_large_order_notional")]
    pub large_order_notional: Decimal,

    /// Tolerance on percentage weights summing to 100
    #[serde(default = "default_weight_epsilon")]
    pub weight_epsilon: Decimal,

    /// Slice intensity gained per unit of volatility
    #[serde(default = "default_volatility_weight")]
    pub volatility_weight: Decimal,

    /// Slice intensity gained per unit of spread
    #[serde(default = "default_spread_weight")]
    pub spread_weight: Decimal,

    /// Liquidity scores are clamped to at least this
    #[serde(default = "default_min_liquidity_score")]
    pub min_liquidity_score: Decimal,

    /// Venues whose touch is worse than the expected price by more than this
    /// fraction are dropped from the plan, e.g. 0.002 = 0.2%
    #[serde(default = "default_max_slippage")]
    pub max_slippage: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Weight budget per account per window, unless the venue overrides it
    #[serde(default = "default_weight_limit")]
    pub default_weight: u32,

    /// Weight consumed by one order placement
    #[serde(default = "default_order_weight")]
    pub order_weight: u32,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageConfig {
    /// Run the detector/executor loop in the binary
    #[serde(default = "default_arb_enabled")]
    pub enabled: bool,

    #[serde(default = "default_arb_symbols")]
    pub symbols: Vec<Symbol>,

    /// Net profit rate after both taker fees
    #[serde(default = "default_min_profit_rate")]
    pub min_profit_rate: Decimal,

    /// Net profit in quote currency
    #[serde(default = "default_min_profit_amount")]
    pub min_profit_amount: Decimal,

    /// Max notional per opportunity
    #[serde(default = "default_max_position_notional")]
    pub max_position_notional: Decimal,

    /// Quotes older than this are ignored
    #[serde(default = "default_quote_staleness_ms")]
    pub quote_staleness_ms: u64,

    /// Opportunities older than this are discarded by the executor
    #[serde(default = "default_opportunity_ttl_ms")]
    pub opportunity_ttl_ms: u64,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_arb_execution_timeout_ms")]
    pub execution_timeout_ms: u64,

    #[serde(default = "default_rollback_timeout_ms")]
    pub rollback_timeout_ms: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Consecutive failures before the executor stops taking opportunities
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_max_daily_volume")]
    pub max_daily_volume: Decimal,

    #[serde(default = "default_arb_max_daily_loss")]
    pub max_daily_loss: Decimal,
}

impl ArbitrageConfig {
    pub fn quote_staleness(&self) -> Duration {
        Duration::from_millis(self.quote_staleness_ms)
    }

    pub fn opportunity_ttl(&self) -> Duration {
        Duration::from_millis(self.opportunity_ttl_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_millis(self.rollback_timeout_ms)
    }
}

/// Volume tier discount; every tier whose threshold is reached applies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierDiscount {
    /// 30-day volume in quote currency
    pub volume_threshold: Decimal,
    /// Fraction taken off the maker rate (0.1 = 10%)
    pub maker_discount: Decimal,
    pub taker_discount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub exchange: ExchangeId,

    #[serde(default)]
    pub market: Market,

    #[serde(default = "default_accounts")]
    pub accounts: Vec<AccountId>,

    /// Symbols tradeable on this venue
    #[serde(default)]
    pub symbols: Vec<Symbol>,

    pub maker_fee: Decimal,
    pub taker_fee: Decimal,

    #[serde(default)]
    pub tiers: Vec<TierDiscount>,

    /// Our 30-day volume, for tier lookup
    #[serde(default)]
    pub monthly_volume: Decimal,

    /// Overrides `rate_limit.default_weight`
    #[serde(default)]
    pub rate_limit_weight: Option<u32>,

    /// Starting balances for paper accounts
    #[serde(default)]
    pub paper_balances: HashMap<String, Decimal>,
}

fn default_mailbox_capacity() -> usize {
    1024
}
fn default_paper_latency_ms() -> u64 {
    2
}
fn default_max_order_value() -> Decimal {
    Decimal::from(50_000)
}
fn default_max_position_size() -> Decimal {
    Decimal::from(100_000)
}
fn default_max_leverage() -> Decimal {
    Decimal::from(10)
}
fn default_max_daily_loss() -> Decimal {
    Decimal::from(10_000)
}
fn default_max_exposure() -> Decimal {
    Decimal::from(500_000)
}
fn default_margin_asset() -> String {
    "USDT".to_string()
}
fn default_workers() -> usize {
    20
}
fn default_order_timeout_ms() -> u64 {
    30_000
}
fn default_execution_timeout_ms() -> u64 {
    300_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_splits() -> usize {
    10
}
fn default_min_split_notional() -> Decimal {
    Decimal::from(100)
}
fn default_large_order_notional() -> Decimal {
    Decimal::from(100_000)
}
fn default_weight_epsilon() -> Decimal {
    Decimal::new(1, 2)
}
fn default_volatility_weight() -> Decimal {
    Decimal::from(20)
}
fn default_spread_weight() -> Decimal {
    Decimal::from(10)
}
fn default_min_liquidity_score() -> Decimal {
    Decimal::new(1, 1)
}
fn default_max_slippage() -> Decimal {
    Decimal::new(2, 3)
}
fn default_window_ms() -> u64 {
    1_000
}
fn default_weight_limit() -> u32 {
    20
}
fn default_order_weight() -> u32 {
    1
}
fn default_arb_enabled() -> bool {
    true
}
fn default_arb_symbols() -> Vec<Symbol> {
    vec![Symbol::new("BTCUSDT")]
}
fn default_min_profit_rate() -> Decimal {
    Decimal::new(1, 3)
}
fn default_min_profit_amount() -> Decimal {
    Decimal::from(10)
}
fn default_max_position_notional() -> Decimal {
    Decimal::from(10_000)
}
fn default_quote_staleness_ms() -> u64 {
    1_000
}
fn default_opportunity_ttl_ms() -> u64 {
    500
}
fn default_channel_capacity() -> usize {
    100
}
fn default_arb_execution_timeout_ms() -> u64 {
    5_000
}
fn default_rollback_timeout_ms() -> u64 {
    5_000
}
fn default_max_concurrent() -> usize {
    5
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_max_daily_volume() -> Decimal {
    Decimal::from(1_000_000)
}
fn default_arb_max_daily_loss() -> Decimal {
    Decimal::from(1_000)
}
fn default_accounts() -> Vec<AccountId> {
    vec![AccountId::new("main")]
}

fn default_symbols() -> Vec<SymbolSpec> {
    vec![
        SymbolSpec {
            symbol: Symbol::new("BTCUSDT"),
            base: "BTC".to_string(),
            quote: "USDT".to_string(),
            lot_size: Decimal::new(1, 3),
            min_lot: Decimal::new(1, 3),
        },
        SymbolSpec {
            symbol: Symbol::new("ETHUSDT"),
            base: "ETH".to_string(),
            quote: "USDT".to_string(),
            lot_size: Decimal::new(1, 2),
            min_lot: Decimal::new(1, 2),
        },
    ]
}

fn default_venues() -> Vec<VenueConfig> {
    let symbols = vec![Symbol::new("BTCUSDT"), Symbol::new("ETHUSDT")];
    let balances: HashMap<String, Decimal> = [
        ("USDT".to_string(), Decimal::from(1_000_000)),
        ("BTC".to_string(), Decimal::from(10)),
        ("ETH".to_string(), Decimal::from(100)),
    ]
    .into_iter()
    .collect();
    let venue = |id: &str, maker: Decimal, taker: Decimal, tiers: Vec<TierDiscount>| VenueConfig {
        exchange: ExchangeId::new(id),
        market: Market::Spot,
        accounts: default_accounts(),
        symbols: symbols.clone(),
        maker_fee: maker,
        taker_fee: taker,
        tiers,
        monthly_volume: Decimal::ZERO,
        rate_limit_weight: None,
        paper_balances: balances.clone(),
    };
    let tier = |threshold: i64, maker: i64, taker: i64| TierDiscount {
        volume_threshold: Decimal::from(threshold),
        maker_discount: Decimal::new(maker, 2),
        taker_discount: Decimal::new(taker, 2),
    };

    vec![
        venue(
            "binance",
            Decimal::new(1, 3),
            Decimal::new(1, 3),
            vec![tier(1_000_000, 10, 10), tier(50_000_000, 20, 20), tier(100_000_000, 30, 25)],
        ),
        venue(
            "okx",
            Decimal::new(8, 4),
            Decimal::new(1, 3),
            vec![tier(5_000_000, 10, 5), tier(50_000_000, 25, 15)],
        ),
        venue(
            "bybit",
            Decimal::new(1, 3),
            Decimal::new(1, 3),
            vec![tier(10_000_000, 15, 10)],
        ),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Paper,
            mailbox_capacity: default_mailbox_capacity(),
            paper_latency_ms: default_paper_latency_ms(),
        }
    }
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_order_value: default_max_order_value(),
            max_position_size: default_max_position_size(),
            position_limits: HashMap::new(),
            max_leverage: default_max_leverage(),
            max_daily_loss: default_max_daily_loss(),
            max_exposure: default_max_exposure(),
            margin_asset: default_margin_asset(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: 0,
            overflow: OverflowPolicy::Block,
            order_timeout_ms: default_order_timeout_ms(),
            execution_timeout_ms: default_execution_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_splits: default_max_splits(),
            min_split_notional: default_min_split_notional(),
            large_order_notional: default_large_order_notional(),
            weight_epsilon: default_weight_epsilon(),
            volatility_weight: default_volatility_weight(),
            spread_weight: default_spread_weight(),
            min_liquidity_score: default_min_liquidity_score(),
            max_slippage: default_max_slippage(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            default_weight: default_weight_limit(),
            order_weight: default_order_weight(),
        }
    }
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            enabled: default_arb_enabled(),
            symbols: default_arb_symbols(),
            min_profit_rate: default_min_profit_rate(),
            min_profit_amount: default_min_profit_amount(),
            max_position_notional: default_max_position_notional(),
            quote_staleness_ms: default_quote_staleness_ms(),
            opportunity_ttl_ms: default_opportunity_ttl_ms(),
            channel_capacity: default_channel_capacity(),
            execution_timeout_ms: default_arb_execution_timeout_ms(),
            rollback_timeout_ms: default_rollback_timeout_ms(),
            max_concurrent: default_max_concurrent(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_daily_volume: default_max_daily_volume(),
            max_daily_loss: default_arb_max_daily_loss(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            risk: RiskLimits::default(),
            execution: ExecutionConfig::default(),
            routing: RoutingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            arbitrage: ArbitrageConfig::default(),
            symbols: default_symbols(),
            venues: default_venues(),
        }
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;

        let config = Self::from_toml(&content)?;
        tracing::info!("📋 Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));

        if self.execution.workers == 0 {
            return fail("execution.workers must be > 0".into());
        }
        if self.routing.max_splits == 0 {
            return fail("routing.max_splits must be > 0".into());
        }
        if self.routing.max_slippage.is_sign_negative() {
            return fail("routing.max_slippage must not be negative".into());
        }
        if self.rate_limit.window_ms == 0 {
            return fail("rate_limit.window_ms must be > 0".into());
        }
        if self.engine.mailbox_capacity == 0 {
            return fail("engine.mailbox_capacity must be > 0".into());
        }

        let limits = [
            ("max_order_value", self.risk.max_order_value),
            ("max_position_size", self.risk.max_position_size),
            ("max_leverage", self.risk.max_leverage),
            ("max_daily_loss", self.risk.max_daily_loss),
            ("max_exposure", self.risk.max_exposure),
        ];
        for (name, value) in limits {
            if value.is_sign_negative() {
                return fail(format!("risk.{} must not be negative", name));
            }
        }

        for spec in &self.symbols {
            if spec.lot_size <= Decimal::ZERO || spec.min_lot <= Decimal::ZERO {
                return fail(format!("symbol {}: lot_size and min_lot must be > 0", spec.symbol));
            }
        }

        let mut seen = HashSet::new();
        for venue in &self.venues {
            if !seen.insert(venue.exchange.clone()) {
                return fail(format!("duplicate venue {}", venue.exchange));
            }
            if venue.accounts.is_empty() {
                return fail(format!("venue {} has no accounts", venue.exchange));
            }
            for tier in &venue.tiers {
                let in_range = |d: Decimal| d >= Decimal::ZERO && d <= Decimal::ONE;
                if !in_range(tier.maker_discount) || !in_range(tier.taker_discount) {
                    return fail(format!("venue {}: tier discounts must be within [0, 1]", venue.exchange));
                }
            }
        }

        Ok(())
    }

    /// Get venue config by exchange ID
    pub fn venue(&self, id: &ExchangeId) -> Option<&VenueConfig> {
        self.venues.iter().find(|v| &v.exchange == id)
    }

    pub fn symbol(&self, symbol: &Symbol) -> Option<&SymbolSpec> {
        self.symbols.iter().find(|s| &s.symbol == symbol)
    }
}
