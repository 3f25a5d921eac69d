use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{AccountState, SnapshotCell};
use crate::core::{Balance, Fill, Symbol, SymbolSpec};

/// Events that may mutate an account. Delivered only through its mailbox.
#[derive(Debug)]
pub enum AccountEvent {
    /// Confirmed execution
    Fill(Fill),
    /// Authoritative balances from the exchange; replaces local balances
    BalanceSync(Vec<Balance>),
    MarkPrice { symbol: Symbol, price: Decimal },
    /// Start of trading day
    DailyReset,
    /// Replies with the published version once everything before it is applied
    Barrier(oneshot::Sender<u64>),
}

/// Events applied per publish, bounding how stale a busy account's snapshot gets
const MAX_BATCH: usize = 64;

/// Owner loop for one account. Exits when every sender is dropped.
pub(super) async fn run(
    mut state: AccountState,
    cell: Arc<SnapshotCell<AccountState>>,
    rx: flume::Receiver<AccountEvent>,
    symbols: Arc<HashMap<Symbol, SymbolSpec>>,
) {
    let key = state.key.clone();
    debug!("Mailbox for {} started", key);

    while let Ok(first) = rx.recv_async().await {
        let mut barriers = Vec::new();
        let mut next = Some(first);
        let mut applied = 0;

        while let Some(event) = next.take() {
            match event {
                AccountEvent::Fill(fill) => {
                    let spec = symbols.get(&fill.symbol);
                    if spec.is_none() {
                        warn!("Fill for unconfigured symbol {} on {}; balances untouched", fill.symbol, key);
                    }
                    state.apply_fill(&fill, spec);
                }
                AccountEvent::BalanceSync(balances) => state.sync_balances(balances),
                AccountEvent::MarkPrice { symbol, price } => state.mark(&symbol, price),
                AccountEvent::DailyReset => state.reset_daily(),
                AccountEvent::Barrier(reply) => barriers.push(reply),
            }
            applied += 1;
            if applied < MAX_BATCH {
                next = rx.try_recv().ok();
            }
        }

        state.recompute();
        state.version = cell.version() + 1;
        let version = cell.store(state.clone());
        for reply in barriers {
            let _ = reply.send(version);
        }
    }

    debug!("Mailbox for {} drained", key);
}
