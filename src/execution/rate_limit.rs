//! Per-account request weight budgets over fixed windows.
//!
//! Each budget is a single `AtomicU64` packing `(window index, used weight)`.
//! Acquire is one CAS loop; rollover happens inside the same CAS, so no lock
//! is ever held across a reset.

use crossbeam::utils::CachePadded;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::core::{AccountKey, Error, Result};

struct Budget {
    state: CachePadded<AtomicU64>,
    limit: u32,
}

#[inline(always)]
fn pack(window: u32, used: u32) -> u64 {
    ((window as u64) << 32) | used as u64
}

#[inline(always)]
fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, state as u32)
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitUsage {
    pub used: u32,
    pub remaining: u32,
    pub limit: u32,
    pub resets_in: Duration,
}

pub struct RateLimiter {
    budgets: DashMap<AccountKey, Arc<Budget>>,
    window: Duration,
    epoch: Instant,
    default_limit: u32,
}

impl RateLimiter {
    pub fn new(window: Duration, default_limit: u32) -> Self {
        Self {
            budgets: DashMap::new(),
            window: window.max(Duration::from_millis(1)),
            epoch: Instant::now(),
            default_limit,
        }
    }

    /// Set an account's budget; resets its usage
    pub fn set_limit(&self, account: AccountKey, limit: u32) {
        self.budgets.insert(
            account,
            Arc::new(Budget {
                state: CachePadded::new(AtomicU64::new(pack(self.window_index(), 0))),
                limit,
            }),
        );
    }

    /// Take `weight` from the account's current window or fail fast
    pub fn try_acquire(&self, account: &AccountKey, weight: u32) -> Result<()> {
        let budget = self.budget(account);
        let now = self.window_index();
        let mut current = budget.state.load(Ordering::Acquire);

        loop {
            let (window, used) = unpack(current);
            // another caller may already have rolled into a later window
            let window_now = now.max(window);
            let used = if window == window_now { used } else { 0 };

            let wanted = used.saturating_add(weight);
            if wanted > budget.limit {
                return Err(Error::RateLimited {
                    account: account.clone(),
                    requested: weight,
                    used,
                    limit: budget.limit,
                });
            }

            match budget.state.compare_exchange_weak(
                current,
                pack(window_now, wanted),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn usage(&self, account: &AccountKey) -> RateLimitUsage {
        let budget = self.budget(account);
        let now = self.window_index();
        let (window, used) = unpack(budget.state.load(Ordering::Acquire));
        let used = if window >= now { used } else { 0 };

        let window_ns = self.window.as_nanos();
        let into_window = self.epoch.elapsed().as_nanos() % window_ns;
        RateLimitUsage {
            used,
            remaining: budget.limit.saturating_sub(used),
            limit: budget.limit,
            resets_in: Duration::from_nanos((window_ns - into_window) as u64),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn budget(&self, account: &AccountKey) -> Arc<Budget> {
        if let Some(b) = self.budgets.get(account) {
            return b.clone();
        }
        self.budgets
            .entry(account.clone())
            .or_insert_with(|| {
                Arc::new(Budget {
                    state: CachePadded::new(AtomicU64::new(pack(self.window_index(), 0))),
                    limit: self.default_limit,
                })
            })
            .clone()
    }

    #[inline(always)]
    fn window_index(&self) -> u32 {
        (self.epoch.elapsed().as_millis() / self.window.as_millis().max(1)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_budget_exhausts_then_fails_fast() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);
        let key = AccountKey::new("binance", "main");

        for _ in 0..3 {
            limiter.try_acquire(&key, 1).unwrap();
        }
        let err = limiter.try_acquire(&key, 1).unwrap_err();
        assert!(matches!(err, Error::RateLimited { used: 3, limit: 3, .. }));
        assert_eq!(limiter.usage(&key).remaining, 0);
    }

    #[test]
    fn test_window_rollover_resets() {
        let limiter = RateLimiter::new(Duration::from_millis(200), 1);
        let key = AccountKey::new("okx", "main");

        limiter.try_acquire(&key, 1).unwrap();
        assert!(limiter.try_acquire(&key, 1).is_err());
        std::thread::sleep(Duration::from_millis(450));
        limiter.try_acquire(&key, 1).unwrap();
    }

    #[test]
    fn test_accounts_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        limiter.set_limit(AccountKey::new("bybit", "vip"), 5);

        limiter.try_acquire(&AccountKey::new("bybit", "main"), 1).unwrap();
        assert!(limiter.try_acquire(&AccountKey::new("bybit", "main"), 1).is_err());
        for _ in 0..5 {
            limiter.try_acquire(&AccountKey::new("bybit", "vip"), 1).unwrap();
        }
    }

    #[test]
    fn test_concurrent_acquire_never_overshoots() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60), 500));
        let granted = Arc::new(AtomicU32::new(0));
        let key = AccountKey::new("binance", "main");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let (limiter, granted, key) = (limiter.clone(), granted.clone(), key.clone());
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if limiter.try_acquire(&key, 1).is_ok() {
                            granted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(granted.load(Ordering::Relaxed), 500);
        assert_eq!(limiter.usage(&key).used, 500);
    }
}
