//! Kill switch - Operator-controlled admission stop

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::core::AccountKey;

/// What an engaged switch blocks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum KillScope {
    Global,
    Account(AccountKey),
    Strategy(String),
}

impl std::fmt::Display for KillScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillScope::Global => write!(f, "global"),
            KillScope::Account(key) => write!(f, "account {}", key),
            KillScope::Strategy(name) => write!(f, "strategy {}", name),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KillRecord {
    pub reason: String,
    pub engaged_at: DateTime<Utc>,
}

/// Scoped records live in one map per scope kind so the hot path looks up
/// with borrowed keys
#[derive(Default)]
pub struct KillSwitch {
    global: AtomicBool,
    global_record: Mutex<Option<KillRecord>>,
    /// Engaged scoped switches; lets the hot path skip map lookups when zero
    scoped: AtomicUsize,
    accounts: DashMap<AccountKey, KillRecord>,
    strategies: DashMap<String, KillRecord>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self, scope: KillScope, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("🛑 Kill switch engaged for {}: {}", scope, reason);
        let record = KillRecord {
            reason,
            engaged_at: Utc::now(),
        };
        let fresh = match scope {
            KillScope::Global => {
                *self.global_record.lock() = Some(record);
                self.global.store(true, Ordering::Release);
                return;
            }
            KillScope::Account(key) => self.accounts.insert(key, record).is_none(),
            KillScope::Strategy(name) => self.strategies.insert(name, record).is_none(),
        };
        if fresh {
            self.scoped.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Operator action; returns whether the scope was engaged
    pub fn clear(&self, scope: &KillScope) -> bool {
        let removed = match scope {
            KillScope::Global => {
                let was = self.global_record.lock().take().is_some();
                self.global.store(false, Ordering::Release);
                was
            }
            KillScope::Account(key) => self.accounts.remove(key).is_some(),
            KillScope::Strategy(name) => self.strategies.remove(name.as_str()).is_some(),
        };
        if !removed {
            return false;
        }
        if *scope != KillScope::Global {
            self.scoped.fetch_sub(1, Ordering::AcqRel);
        }
        info!("Kill switch cleared for {}", scope);
        true
    }

    /// First engaged scope covering this account/strategy. Only a hit builds a scope.
    #[inline]
    pub fn engaged_for(&self, account: &AccountKey, strategy: Option<&str>) -> Option<KillScope> {
        if self.global.load(Ordering::Acquire) {
            return Some(KillScope::Global);
        }
        if self.scoped.load(Ordering::Acquire) == 0 {
            return None;
        }
        if self.accounts.contains_key(account) {
            return Some(KillScope::Account(account.clone()));
        }
        let strategy = strategy?;
        self.strategies
            .contains_key(strategy)
            .then(|| KillScope::Strategy(strategy.to_string()))
    }

    pub fn record(&self, scope: &KillScope) -> Option<KillRecord> {
        match scope {
            KillScope::Global => self.global_record.lock().clone(),
            KillScope::Account(key) => self.accounts.get(key).map(|r| r.clone()),
            KillScope::Strategy(name) => self.strategies.get(name.as_str()).map(|r| r.clone()),
        }
    }

    pub fn engaged(&self) -> Vec<(KillScope, KillRecord)> {
        let global = self.global_record.lock().clone().map(|r| (KillScope::Global, r));
        let accounts = self
            .accounts
            .iter()
            .map(|e| (KillScope::Account(e.key().clone()), e.value().clone()));
        let strategies = self
            .strategies
            .iter()
            .map(|e| (KillScope::Strategy(e.key().clone()), e.value().clone()));
        global.into_iter().chain(accounts).chain(strategies).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_switch_only_hits_scope() {
        let ks = KillSwitch::new();
        let main = AccountKey::new("binance", "main");
        let other = AccountKey::new("okx", "main");

        ks.engage(KillScope::Account(main.clone()), "manual");
        assert_eq!(ks.engaged_for(&main, None), Some(KillScope::Account(main.clone())));
        assert_eq!(ks.engaged_for(&other, None), None);

        assert!(ks.clear(&KillScope::Account(main.clone())));
        assert_eq!(ks.engaged_for(&main, None), None);
        assert!(!ks.clear(&KillScope::Account(main)));
    }

    #[test]
    fn test_global_and_strategy() {
        let ks = KillSwitch::new();
        let key = AccountKey::new("bybit", "main");

        ks.engage(KillScope::Strategy("arb".into()), "drawdown");
        assert_eq!(ks.engaged_for(&key, Some("arb")), Some(KillScope::Strategy("arb".into())));
        assert_eq!(ks.engaged_for(&key, Some("twap")), None);

        ks.engage(KillScope::Global, "exchange outage");
        assert_eq!(ks.engaged_for(&key, Some("twap")), Some(KillScope::Global));
        ks.clear(&KillScope::Global);
        assert_eq!(ks.engaged_for(&key, None), None);
    }

    #[test]
    fn test_re_engage_does_not_double_count() {
        let ks = KillSwitch::new();
        let key = AccountKey::new("binance", "main");
        ks.engage(KillScope::Account(key.clone()), "one");
        ks.engage(KillScope::Account(key.clone()), "two");
        assert_eq!(ks.record(&KillScope::Account(key.clone())).unwrap().reason, "two");
        ks.clear(&KillScope::Account(key.clone()));
        assert_eq!(ks.engaged_for(&key, None), None);
        assert!(ks.engaged().is_empty());
    }

    #[test]
    fn test_engaged_lists_every_scope() {
        let ks = KillSwitch::new();
        let key = AccountKey::new("okx", "hedge");
        ks.engage(KillScope::Global, "halt");
        ks.engage(KillScope::Account(key.clone()), "margin call");
        ks.engage(KillScope::Strategy("arbitrage".into()), "breaker");

        let mut scopes: Vec<String> = ks.engaged().iter().map(|(s, _)| s.to_string()).collect();
        scopes.sort();
        assert_eq!(scopes, vec!["account okx:hedge", "global", "strategy arbitrage"]);
        assert_eq!(ks.record(&KillScope::Global).unwrap().reason, "halt");

        assert!(ks.clear(&KillScope::Global));
        assert!(!ks.clear(&KillScope::Global));
        // borrowed strategy name from a caller's buffer
        let name = String::from("arbitrage");
        let other = AccountKey::new("binance", "main");
        assert_eq!(ks.engaged_for(&other, Some(name.as_str())), Some(KillScope::Strategy(name.clone())));
        assert!(ks.clear(&KillScope::Account(key.clone())));
        assert!(ks.clear(&KillScope::Strategy(name)));
        assert_eq!(ks.engaged_for(&key, Some("arbitrage")), None);
    }
}
