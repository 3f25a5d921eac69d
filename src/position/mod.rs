//! Position aggregation - Authoritative per-account balances and positions
//!
//! Each registered account has one owner task draining a bounded mailbox.
//! Only that task mutates the account; everyone else reads published snapshots.

mod aggregator;
mod mailbox;
pub mod snapshot;

pub use aggregator::PositionAggregator;
pub use mailbox::AccountEvent;
pub use snapshot::SnapshotCell;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

use crate::core::{AccountKey, Balance, Fill, Market, Symbol, SymbolSpec};

/// Open position on one symbol
#[derive(Debug, Clone, Default, Serialize)]
pub struct PositionState {
    /// Signed: positive long, negative short
    pub quantity: Decimal,
    pub avg_entry: Decimal,
    pub mark_price: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
}

impl PositionState {
    /// Fold a signed fill into the position, returning realized PnL
    fn apply(&mut self, side_qty: Decimal, price: Decimal) -> Decimal {
        let current = self.quantity;
        let mut realized = Decimal::ZERO;

        if current.is_zero() || current.is_sign_positive() == side_qty.is_sign_positive() {
            let total = current.abs() + side_qty.abs();
            self.avg_entry = (current.abs() * self.avg_entry + side_qty.abs() * price) / total;
        } else {
            let closed = current.abs().min(side_qty.abs());
            let direction = if current.is_sign_positive() { Decimal::ONE } else { Decimal::NEGATIVE_ONE };
            realized = closed * (price - self.avg_entry) * direction;
            if side_qty.abs() > current.abs() {
                // flipped through zero; the remainder opens at the fill price
                self.avg_entry = price;
            }
        }

        self.quantity = current + side_qty;
        if self.quantity.is_zero() {
            self.avg_entry = Decimal::ZERO;
        }
        self.realized_pnl += realized;
        self.mark_price = price;
        self.revalue();
        realized
    }

    fn revalue(&mut self) {
        self.unrealized_pnl = if self.quantity.is_zero() {
            Decimal::ZERO
        } else {
            self.quantity * (self.mark_price - self.avg_entry)
        };
    }

    pub fn notional(&self) -> Decimal {
        self.quantity.abs() * self.mark_price
    }
}

/// Snapshot of one (exchange, account)
#[derive(Debug, Clone, Serialize)]
pub struct AccountState {
    pub key: AccountKey,
    pub market: Market,
    pub balances: HashMap<String, Balance>,
    pub positions: HashMap<Symbol, PositionState>,
    /// Realized PnL net of fees since the last daily reset
    pub realized_pnl_today: Decimal,
    /// Cached on publish so admission checks stay O(1)
    pub gross_exposure: Decimal,
    pub unrealized_pnl: Decimal,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl AccountState {
    pub fn empty(key: AccountKey, market: Market) -> Self {
        Self {
            key,
            market,
            balances: HashMap::new(),
            positions: HashMap::new(),
            realized_pnl_today: Decimal::ZERO,
            gross_exposure: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn with_balances(mut self, balances: impl IntoIterator<Item = Balance>) -> Self {
        for b in balances {
            self.balances.insert(b.asset.clone(), b);
        }
        self.recompute();
        self
    }

    pub fn free(&self, asset: &str) -> Decimal {
        self.balances.get(asset).map(|b| b.free).unwrap_or(Decimal::ZERO)
    }

    /// Signed position quantity, zero when flat
    pub fn position(&self, symbol: &Symbol) -> Decimal {
        self.positions.get(symbol).map(|p| p.quantity).unwrap_or(Decimal::ZERO)
    }

    pub fn mark_price(&self, symbol: &Symbol) -> Option<Decimal> {
        self.positions
            .get(symbol)
            .map(|p| p.mark_price)
            .filter(|p| !p.is_zero())
    }

    /// Realized today plus open unrealized
    pub fn daily_pnl(&self) -> Decimal {
        self.realized_pnl_today + self.unrealized_pnl
    }

    pub(crate) fn apply_fill(&mut self, fill: &Fill, spec: Option<&SymbolSpec>) {
        let signed = fill.side.sign() * fill.quantity;
        let realized = self
            .positions
            .entry(fill.symbol.clone())
            .or_default()
            .apply(signed, fill.price);
        self.realized_pnl_today += realized - fill.fee;

        if let Some(spec) = spec {
            let notional = fill.quantity * fill.price;
            match self.market {
                Market::Spot => {
                    self.adjust(&spec.base, signed);
                    self.adjust(&spec.quote, -(fill.side.sign() * notional) - fill.fee);
                }
                Market::Futures => {
                    self.adjust(&spec.quote, realized - fill.fee);
                }
            }
        }
        self.updated_at = fill.timestamp;
    }

    pub(crate) fn mark(&mut self, symbol: &Symbol, price: Decimal) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.mark_price = price;
            position.revalue();
        }
    }

    pub(crate) fn sync_balances(&mut self, balances: Vec<Balance>) {
        self.balances = balances.into_iter().map(|b| (b.asset.clone(), b)).collect();
        self.updated_at = Utc::now();
    }

    pub(crate) fn reset_daily(&mut self) {
        self.realized_pnl_today = Decimal::ZERO;
    }

    pub(crate) fn recompute(&mut self) {
        self.gross_exposure = self.positions.values().map(|p| p.notional()).sum();
        self.unrealized_pnl = self.positions.values().map(|p| p.unrealized_pnl).sum();
    }

    fn adjust(&mut self, asset: &str, delta: Decimal) {
        self.balances
            .entry(asset.to_string())
            .or_insert_with(|| Balance::new(asset, Decimal::ZERO))
            .free += delta;
    }
}
