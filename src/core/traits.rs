//! Core traits - Capability seams to the outside world

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::{Result, types::*};
use crate::position::AccountState;

/// Exchange trait - order entry and quotes for one venue
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Exchange this client talks to
    fn id(&self) -> &ExchangeId;

    /// Place a child order on the slice's account
    async fn place_order(&self, slice: &RouteSlice) -> Result<OrderAck>;

    /// Cancel an order
    async fn cancel_order(&self, account: &AccountId, order_id: &str) -> Result<()>;

    /// Fetch current top of book
    async fn get_quote(&self, symbol: &Symbol) -> Result<BidAsk>;
}

/// API credentials for one account
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Supplies per-account credentials. Nothing in the core persists them.
pub trait CredentialStore: Send + Sync {
    fn credentials(&self, account: &AccountKey) -> Option<Credentials>;
}

/// Authoritative account state: consistent reads, confirmed mutations
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Latest published snapshot
    fn account_state(&self, account: &AccountKey) -> Arc<AccountState>;

    /// Queue a confirmed fill for the account's owner task
    async fn apply_fill(&self, fill: Fill) -> Result<()>;
}
