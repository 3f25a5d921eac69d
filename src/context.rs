//! Engine context - Shared handles every component is built from

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::core::config::{RiskLimits, RunMode};
use crate::core::{
    AccountKey, Balance, Config, Error, ExchangeClient, ExchangeId, Order, Result, Route, Symbol, SymbolSpec,
};
use crate::execution::RateLimiter;
use crate::position::{PositionAggregator, SnapshotCell};
use crate::risk::KillSwitch;
use crate::router::{FeeOptimizer, RateClass, VolumeInfo};

pub struct EngineContext {
    pub config: Config,
    pub positions: Arc<PositionAggregator>,
    pub limits: SnapshotCell<RiskLimits>,
    pub kill_switch: KillSwitch,
    pub rate_limits: RateLimiter,
    pub fees: FeeOptimizer,
    exchanges: DashMap<ExchangeId, Arc<dyn ExchangeClient>>,
    symbols: HashMap<Symbol, SymbolSpec>,
}

impl EngineContext {
    /// Validate config and register every configured account.
    /// Spawns account owner tasks, so it must run inside a tokio runtime.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;

        let positions = Arc::new(PositionAggregator::new(
            config.symbols.clone(),
            config.engine.mailbox_capacity,
        ));
        let rate_limits = RateLimiter::new(config.rate_limit.window(), config.rate_limit.default_weight);

        for venue in &config.venues {
            for account in &venue.accounts {
                let key = AccountKey {
                    exchange: venue.exchange.clone(),
                    account: account.clone(),
                };
                let balances = match config.engine.mode {
                    RunMode::Paper => venue
                        .paper_balances
                        .iter()
                        .map(|(asset, free)| Balance::new(asset.clone(), *free))
                        .collect(),
                    // live balances arrive through sync events
                    RunMode::Live => Vec::new(),
                };
                positions.register(key.clone(), venue.market, balances);
                if let Some(weight) = venue.rate_limit_weight {
                    rate_limits.set_limit(key, weight);
                }
            }
        }

        info!(
            "⚙️ Engine context ready: {} venues, {} accounts, {} symbols ({:?} mode)",
            config.venues.len(),
            positions.accounts().len(),
            config.symbols.len(),
            config.engine.mode
        );

        Ok(Arc::new(Self {
            limits: SnapshotCell::new(config.risk.clone()),
            fees: FeeOptimizer::from_venues(&config.venues),
            symbols: config.symbols.iter().map(|s| (s.symbol.clone(), s.clone())).collect(),
            exchanges: DashMap::new(),
            kill_switch: KillSwitch::new(),
            rate_limits,
            positions,
            config,
        }))
    }

    pub fn register_exchange(&self, client: Arc<dyn ExchangeClient>) {
        info!("🔌 Exchange client registered: {}", client.id());
        self.exchanges.insert(client.id().clone(), client);
    }

    pub fn exchange(&self, id: &ExchangeId) -> Result<Arc<dyn ExchangeClient>> {
        self.exchanges
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::UnknownExchange(id.clone()))
    }

    pub fn exchange_ids(&self) -> Vec<ExchangeId> {
        self.exchanges.iter().map(|e| e.key().clone()).collect()
    }

    pub fn symbol(&self, symbol: &Symbol) -> Result<&SymbolSpec> {
        self.symbols
            .get(symbol)
            .ok_or_else(|| Error::UnknownSymbol(symbol.clone()))
    }

    /// Candidate routes for an order, cheapest venue first.
    ///
    /// A pinned account narrows the set to that account.
    pub fn routes_for(&self, order: &Order) -> Vec<Route> {
        let volume = self.volume_info(RateClass::Taker);
        let mut routes: Vec<(Decimal, Route)> = self
            .config
            .venues
            .iter()
            .filter(|v| v.market == order.market)
            .filter(|v| v.symbols.is_empty() || v.symbols.contains(&order.symbol))
            .flat_map(|v| {
                let rate = self.fees.effective_rate(&v.exchange, &volume);
                v.accounts
                    .iter()
                    .map(move |a| (rate, Route::new(v.exchange.clone(), a.clone(), v.market)))
            })
            .filter(|(_, r)| match &order.account {
                Some(key) => r.exchange == key.exchange && r.account == key.account,
                None => true,
            })
            .collect();
        routes.sort_by(|a, b| a.0.cmp(&b.0));
        routes.into_iter().map(|(_, r)| r).collect()
    }

    /// Configured 30-day volume per venue
    pub fn volume_info(&self, class: RateClass) -> VolumeInfo {
        self.config
            .venues
            .iter()
            .fold(VolumeInfo::new(class), |info, v| info.with_volume(v.exchange.clone(), v.monthly_volume))
    }

    pub async fn shutdown(&self) {
        self.positions.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Market, Side};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_new_registers_paper_accounts() {
        let ctx = EngineContext::new(Config::default()).unwrap();
        let key = AccountKey::new("okx", "main");
        let state = ctx.positions.snapshot(&key).unwrap();
        assert_eq!(state.free("USDT"), dec!(1000000));
        assert_eq!(ctx.positions.accounts().len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.execution.workers = 0;
        assert!(matches!(EngineContext::new(config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_routes_for_pinned_account() {
        let ctx = EngineContext::new(Config::default()).unwrap();
        let order = Order::new_limit(Symbol::new("BTCUSDT"), Side::Buy, dec!(1), dec!(40000));
        assert_eq!(ctx.routes_for(&order).len(), 3);

        let pinned = order.with_account(AccountKey::new("bybit", "main"));
        let routes = ctx.routes_for(&pinned);
        assert_eq!(routes, vec![Route::new("bybit", "main", Market::Spot)]);
    }

    #[tokio::test]
    async fn test_unknown_lookups() {
        let ctx = EngineContext::new(Config::default()).unwrap();
        assert!(matches!(ctx.symbol(&Symbol::new("DOGEUSDT")), Err(Error::UnknownSymbol(_))));
        assert!(matches!(ctx.exchange(&ExchangeId::new("kraken")), Err(Error::UnknownExchange(_))));
    }
}
