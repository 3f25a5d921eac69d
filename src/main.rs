use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing_subscriber::{EnvFilter, fmt};

use aleph_oms::arbitrage::{ArbitrageDetector, ArbitrageExecutor};
use aleph_oms::core::config::RunMode;
use aleph_oms::core::{BidAsk, CancelToken, ExchangeClient, Order, Side, Symbol};
use aleph_oms::exchanges::{EnvCredentialStore, PaperExchange, missing_credentials};
use aleph_oms::execution::ExecutionEngine;
use aleph_oms::risk::RiskEngine;
use aleph_oms::router::RoutingEngine;
use aleph_oms::{Config, EngineContext};

fn load_config() -> anyhow::Result<Config> {
    let path = std::env::var("ALEPH_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    if std::path::Path::new(&path).exists() {
        Ok(Config::load(&path)?)
    } else {
        tracing::warn!("⚠️ {} not found, using defaults", path);
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,aleph_oms=debug"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    tracing::info!("🦀 AlephOMS starting...");

    let config = load_config()?;
    let missing = missing_credentials(&EnvCredentialStore::new(), &config.venues);
    if config.engine.mode == RunMode::Live {
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|k| k.to_string()).collect();
            anyhow::bail!("no API credentials for {}", names.join(", "));
        }
        anyhow::bail!("live mode needs venue adapters; this binary only drives paper venues");
    }
    for key in &missing {
        tracing::debug!("🔑 {} has no API credentials, paper fills only", key);
    }

    // 1. Shared context and paper venues
    let ctx = EngineContext::new(config)?;
    let latency = Duration::from_millis(ctx.config.engine.paper_latency_ms);
    let btc = Symbol::new("BTCUSDT");
    let mut venues = Vec::new();
    for (i, venue) in ctx.config.venues.iter().enumerate() {
        let exchange = Arc::new(PaperExchange::from_venue(venue, latency));
        // staggered books so the venues disagree a little
        let offset = Decimal::from(i as u64 * 25);
        exchange.set_quote(btc.clone(), Decimal::from(39_990) + offset, Decimal::from(40_000) + offset);
        ctx.register_exchange(exchange.clone());
        venues.push(exchange);
    }

    // 2. Engines
    let risk = Arc::new(RiskEngine::new(ctx.clone()));
    let execution = Arc::new(ExecutionEngine::new(ctx.clone()));
    let router = RoutingEngine::new(ctx.clone(), risk.clone(), execution.clone());

    // 3. Route a parent order across venues
    let cancel = CancelToken::new();
    let order = Order::new_limit(btc.clone(), Side::Buy, Decimal::ONE, Decimal::from(40_100));
    match router.route_order(order, &cancel).await {
        Ok(outcome) => println!("{}", serde_json::to_string_pretty(&outcome.report)?),
        Err(e) => tracing::error!("Routing failed [{}]: {}", e.code(), e),
    }

    // 4. Arbitrage loop over a short burst of quotes
    if ctx.config.arbitrage.enabled {
        let (detector, rx) = ArbitrageDetector::new(ctx.clone());
        let executor = Arc::new(ArbitrageExecutor::new(ctx.clone(), risk.clone(), execution.clone()));
        let runner = tokio::spawn(executor.clone().run(rx, cancel.clone()));

        for (i, venue) in venues.iter().enumerate() {
            let step = Decimal::from(i as u64 * 210);
            let quote = BidAsk {
                symbol: btc.clone(),
                bid: Decimal::from(39_990) + step,
                bid_qty: Decimal::ONE,
                ask: Decimal::from(40_000) + step,
                ask_qty: Decimal::ONE,
                timestamp: chrono::Utc::now(),
            };
            venue.set_book(quote.clone());
            detector.on_quote(venue.id(), quote);
        }
        tracing::info!("📡 Detector: {:?}", detector.stats());

        drop(detector);
        runner.await?;
        println!("{}", serde_json::to_string_pretty(&executor.stats())?);
    }

    // 5. Shutdown
    execution.shutdown().await;
    ctx.shutdown().await;
    tracing::info!("👋 AlephOMS stopped");
    Ok(())
}
