use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use super::{AccountEvent, AccountState, SnapshotCell, mailbox};
use crate::core::{AccountKey, Balance, Error, Fill, Market, PositionSource, Result, Symbol, SymbolSpec};

struct AccountHandle {
    cell: Arc<SnapshotCell<AccountState>>,
    tx: flume::Sender<AccountEvent>,
}

/// Owner of all account state
pub struct PositionAggregator {
    accounts: DashMap<AccountKey, AccountHandle>,
    symbols: Arc<HashMap<Symbol, SymbolSpec>>,
    capacity: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PositionAggregator {
    pub fn new(symbols: impl IntoIterator<Item = SymbolSpec>, mailbox_capacity: usize) -> Self {
        Self {
            accounts: DashMap::new(),
            symbols: Arc::new(symbols.into_iter().map(|s| (s.symbol.clone(), s)).collect()),
            capacity: mailbox_capacity.max(1),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start tracking an account. Spawns its owner task; requires a tokio runtime.
    pub fn register(&self, key: AccountKey, market: Market, balances: Vec<Balance>) {
        let Entry::Vacant(slot) = self.accounts.entry(key.clone()) else {
            return;
        };
        let state = AccountState::empty(key.clone(), market).with_balances(balances);
        let cell = Arc::new(SnapshotCell::new(state.clone()));
        let (tx, rx) = flume::bounded(self.capacity);

        let task = tokio::spawn(mailbox::run(state, cell.clone(), rx, self.symbols.clone()));
        self.tasks.lock().push(task);
        slot.insert(AccountHandle { cell, tx });
        info!("Registered account {} ({})", key, market);
    }

    pub fn snapshot(&self, key: &AccountKey) -> Option<Arc<AccountState>> {
        self.accounts.get(key).map(|h| h.cell.load())
    }

    pub fn accounts(&self) -> Vec<AccountKey> {
        self.accounts.iter().map(|e| e.key().clone()).collect()
    }

    pub fn symbol(&self, symbol: &Symbol) -> Option<&SymbolSpec> {
        self.symbols.get(symbol)
    }

    /// Deliver an event, waiting for mailbox space
    pub async fn send(&self, key: &AccountKey, event: AccountEvent) -> Result<()> {
        let tx = self
            .accounts
            .get(key)
            .map(|h| h.tx.clone())
            .ok_or_else(|| Error::InvalidState(format!("account {} not registered", key)))?;
        tx.send_async(event)
            .await
            .map_err(|_| Error::ChannelClosed("account mailbox"))
    }

    pub async fn sync_balances(&self, key: &AccountKey, balances: Vec<Balance>) -> Result<()> {
        self.send(key, AccountEvent::BalanceSync(balances)).await
    }

    pub async fn update_mark(&self, key: &AccountKey, symbol: Symbol, price: Decimal) -> Result<()> {
        self.send(key, AccountEvent::MarkPrice { symbol, price }).await
    }

    /// Zero realized daily PnL on every account
    pub async fn reset_daily(&self) -> Result<()> {
        for key in self.accounts() {
            self.send(&key, AccountEvent::DailyReset).await?;
        }
        Ok(())
    }

    /// Wait until everything queued for `key` so far is published
    pub async fn flush(&self, key: &AccountKey) -> Result<u64> {
        let (reply, done) = oneshot::channel();
        self.send(key, AccountEvent::Barrier(reply)).await?;
        done.await.map_err(|_| Error::ChannelClosed("account mailbox"))
    }

    /// Close every mailbox and wait for owners to drain
    pub async fn shutdown(&self) {
        self.accounts.clear();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("Position aggregator stopped");
    }
}

#[async_trait]
impl PositionSource for PositionAggregator {
    fn account_state(&self, account: &AccountKey) -> Arc<AccountState> {
        self.snapshot(account)
            .unwrap_or_else(|| Arc::new(AccountState::empty(account.clone(), Market::Spot)))
    }

    async fn apply_fill(&self, fill: Fill) -> Result<()> {
        let key = fill.account.clone();
        self.send(&key, AccountEvent::Fill(fill)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Side;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn aggregator() -> PositionAggregator {
        PositionAggregator::new(
            [SymbolSpec {
                symbol: Symbol::new("BTCUSDT"),
                base: "BTC".into(),
                quote: "USDT".into(),
                lot_size: dec!(0.001),
                min_lot: dec!(0.001),
            }],
            16,
        )
    }

    #[tokio::test]
    async fn test_fill_published_after_flush() {
        let agg = aggregator();
        let key = AccountKey::new("binance", "main");
        agg.register(key.clone(), Market::Spot, vec![Balance::new("USDT", dec!(100000))]);

        let before = agg.account_state(&key);
        agg.apply_fill(Fill {
            account: key.clone(),
            symbol: Symbol::new("BTCUSDT"),
            side: Side::Buy,
            quantity: dec!(1),
            price: dec!(40000),
            fee: dec!(40),
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
        let version = agg.flush(&key).await.unwrap();

        let after = agg.account_state(&key);
        assert_eq!(version, after.version);
        assert_eq!(after.position(&Symbol::new("BTCUSDT")), dec!(1));
        assert_eq!(after.free("USDT"), dec!(59960));
        // snapshots taken earlier are untouched
        assert_eq!(before.position(&Symbol::new("BTCUSDT")), dec!(0));

        agg.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_account_is_empty() {
        let agg = aggregator();
        let key = AccountKey::new("okx", "ghost");
        assert_eq!(agg.account_state(&key).free("USDT"), dec!(0));
        assert!(agg.flush(&key).await.is_err());
    }

    #[tokio::test]
    async fn test_balance_sync_replaces_balances() {
        let agg = aggregator();
        let key = AccountKey::new("bybit", "main");
        agg.register(key.clone(), Market::Spot, vec![Balance::new("USDT", dec!(10))]);
        agg.sync_balances(&key, vec![Balance::new("BTC", dec!(3))]).await.unwrap();
        agg.flush(&key).await.unwrap();

        let state = agg.account_state(&key);
        assert_eq!(state.free("USDT"), dec!(0));
        assert_eq!(state.free("BTC"), dec!(3));
        agg.shutdown().await;
    }
}
