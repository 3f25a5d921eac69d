use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use aleph_oms::arbitrage::{ArbitrageDetector, ArbitrageExecutor, ArbitrageOpportunity, PositionState};
use aleph_oms::core::{AccountKey, BidAsk, CancelToken, Config, Error, ExchangeClient, PositionSource, Symbol};
use aleph_oms::exchanges::{PaperBehavior, PaperExchange};
use aleph_oms::execution::ExecutionEngine;
use aleph_oms::risk::RiskEngine;
use aleph_oms::EngineContext;

struct Arb {
    ctx: Arc<EngineContext>,
    detector: ArbitrageDetector,
    rx: flume::Receiver<ArbitrageOpportunity>,
    executor: Arc<ArbitrageExecutor>,
    binance: Arc<PaperExchange>,
    okx: Arc<PaperExchange>,
}

fn quote(bid: Decimal, ask: Decimal) -> BidAsk {
    BidAsk {
        symbol: Symbol::new("BTCUSDT"),
        bid,
        bid_qty: dec!(1),
        ask,
        ask_qty: dec!(1),
        timestamp: Utc::now(),
    }
}

fn arb() -> Arb {
    let mut config = Config::default();
    config.arbitrage.execution_timeout_ms = 200;
    config.arbitrage.rollback_timeout_ms = 200;
    config.arbitrage.opportunity_ttl_ms = 10_000;
    let ctx = EngineContext::new(config).unwrap();

    let venue = |id: &str| {
        let exchange = Arc::new(PaperExchange::new(id, Duration::from_millis(1), dec!(0.001)));
        ctx.register_exchange(exchange.clone());
        exchange
    };
    let (binance, okx) = (venue("binance"), venue("okx"));

    let risk = Arc::new(RiskEngine::new(ctx.clone()));
    let execution = Arc::new(ExecutionEngine::new(ctx.clone()));
    let (detector, rx) = ArbitrageDetector::new(ctx.clone());
    Arb {
        executor: Arc::new(ArbitrageExecutor::new(ctx.clone(), risk, execution)),
        ctx,
        detector,
        rx,
        binance,
        okx,
    }
}

/// binance offers 40000, okx bids 40200: buy binance, sell okx
fn publish_spread(arb: &Arb) {
    for (venue, q) in [
        (&arb.binance, quote(dec!(39990), dec!(40000))),
        (&arb.okx, quote(dec!(40200), dec!(40210))),
    ] {
        venue.set_book(q.clone());
        arb.detector.on_quote(venue.id(), q);
    }
}

async fn net_btc(ctx: &EngineContext) -> Decimal {
    let mut net = dec!(0);
    for venue in ["binance", "okx"] {
        let key = AccountKey::new(venue, "main");
        ctx.positions.flush(&key).await.unwrap();
        net += ctx.positions.account_state(&key).position(&Symbol::new("BTCUSDT"));
    }
    net
}

#[tokio::test]
async fn test_hung_sell_leg_is_unwound() {
    let arb = arb();
    publish_spread(&arb);
    let opportunity = arb.rx.try_recv().unwrap();
    arb.okx.set_behavior(PaperBehavior::Hang);

    let position = arb.executor.execute(opportunity, &CancelToken::new()).await.unwrap();

    assert_ne!(position.state, PositionState::BothFilled);
    assert_eq!(position.state, PositionState::RolledBack);
    assert_eq!(position.sell.report.as_ref().unwrap().error_code, Some("TIMEOUT"));
    assert_eq!(position.buy.filled(), dec!(0.25));
    assert_eq!(position.imbalance(), dec!(0));
    assert_eq!(net_btc(&arb.ctx).await, dec!(0));
    assert_eq!(arb.executor.stats().rolled_back, 1);
}

#[tokio::test]
async fn test_failed_rollback_surfaces_open_position() {
    let arb = arb();
    publish_spread(&arb);
    let opportunity = arb.rx.try_recv().unwrap();
    arb.okx.set_behavior(PaperBehavior::Hang);

    let executor = arb.executor.clone();
    let run = tokio::spawn(async move { executor.execute(opportunity, &CancelToken::new()).await });
    // buy leg is done well before the sell leg times out
    tokio::time::sleep(Duration::from_millis(60)).await;
    arb.binance.set_behavior(PaperBehavior::Reject("withdrawals only".into()));

    let err = run.await.unwrap().unwrap_err();
    assert_eq!(err.code(), "ROLLBACK_FAILED");
    match err {
        Error::RollbackFailed { position, reason } => {
            assert_eq!(position.state, PositionState::Failed);
            assert_eq!(position.imbalance(), dec!(0.25));
            assert!(reason.contains("withdrawals only"));
        }
        other => panic!("unexpected {other}"),
    }
    assert_eq!(net_btc(&arb.ctx).await, dec!(0.25));
    assert_eq!(arb.executor.stats().rollback_failures, 1);
}

#[tokio::test]
async fn test_detector_feeds_executor_loop() {
    let arb = arb();
    let Arb { ctx, detector, rx, executor, binance, okx } = arb;
    let cancel = CancelToken::new();
    let runner = tokio::spawn(executor.clone().run(rx, cancel.clone()));

    for (venue, q) in [(&binance, quote(dec!(39990), dec!(40000))), (&okx, quote(dec!(40200), dec!(40210)))] {
        venue.set_book(q.clone());
        detector.on_quote(venue.id(), q);
    }
    assert_eq!(detector.stats().detected, 1);
    drop(detector);
    runner.await.unwrap();

    let stats = executor.stats();
    assert_eq!(stats.both_filled, 1);
    assert!(stats.daily_pnl > dec!(0));
    assert_eq!(net_btc(&ctx).await, dec!(0));
}
