use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rust_decimal_macros::dec;

use aleph_oms::core::{AccountKey, Config, Order, Side, Symbol};
use aleph_oms::risk::{KillScope, RiskEngine};
use aleph_oms::EngineContext;

const CHECKS: usize = 10_000;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_limit_swaps_never_leak_a_pass() {
    let ctx = EngineContext::new(Config::default()).unwrap();
    let risk = Arc::new(RiskEngine::new(ctx.clone()));
    let key = AccountKey::new("binance", "main");
    let done = Arc::new(AtomicBool::new(false));

    // flip between two limits that both reject a 20,000 order and admit a 4,000 one
    let updater = {
        let risk = risk.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut swaps = 0u64;
            while !done.load(Ordering::Acquire) {
                let value = if swaps % 2 == 0 { dec!(10000) } else { dec!(19999) };
                risk.update_limits(|l| l.max_order_value = value);
                swaps += 1;
                tokio::task::yield_now().await;
            }
            swaps
        })
    };

    let mut tasks = Vec::with_capacity(CHECKS);
    for i in 0..CHECKS {
        let risk = risk.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let big = Order::new_limit(Symbol::new("BTCUSDT"), Side::Buy, dec!(0.5), dec!(40000));
            let small = Order::new_limit(Symbol::new("BTCUSDT"), Side::Sell, dec!(0.1), dec!(40000));
            let order = if i % 4 == 0 { small } else { big };
            (i % 4 == 0, risk.check(&order, &key))
        }));
    }

    for task in tasks {
        let (small, result) = task.await.unwrap();
        let consulted = result.limits.max_order_value;
        assert!(consulted == dec!(50000) || consulted == dec!(10000) || consulted == dec!(19999));
        if small {
            assert!(result.passed, "small order rejected: {}", result);
        } else if consulted != dec!(50000) {
            assert!(!result.passed);
            assert_eq!(result.code(), "MAX_ORDER_VALUE");
            assert!(result.reason().unwrap().contains("exceeds max order value"));
        }
    }

    done.store(true, Ordering::Release);
    let swaps = updater.await.unwrap();
    assert!(swaps > 0);

    let metrics = risk.metrics();
    assert_eq!(metrics.checks, CHECKS as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kill_switch_visible_to_every_later_check() {
    let ctx = EngineContext::new(Config::default()).unwrap();
    let risk = Arc::new(RiskEngine::new(ctx.clone()));
    let key = AccountKey::new("okx", "main");

    risk.engage_kill_switch(KillScope::Global, "venue incident");
    let handles: Vec<_> = (0..1_000)
        .map(|_| {
            let risk = risk.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let order = Order::new_limit(Symbol::new("BTCUSDT"), Side::Buy, dec!(0.01), dec!(40000));
                risk.check(&order, &key)
            })
        })
        .collect();

    for handle in handles {
        let result = handle.await.unwrap();
        assert!(!result.passed);
        assert!(result.is_kill_switch());
    }
}
