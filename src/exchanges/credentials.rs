//! Environment-backed credentials
//!
//! Keys are read as `ALEPH_<EXCHANGE>_<ACCOUNT>_API_KEY` and `..._API_SECRET`,
//! uppercased, with non-alphanumerics mapped to `_`. Populate them from `.env`
//! with `dotenv` at startup.

use std::collections::HashMap;

use crate::core::config::VenueConfig;
use crate::core::{AccountKey, CredentialStore, Credentials};

pub struct EnvCredentialStore {
    prefix: String,
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl EnvCredentialStore {
    pub fn new() -> Self {
        Self::with_lookup("ALEPH", |name| std::env::var(name).ok())
    }

    /// Resolve names through `lookup` instead of the process environment
    pub fn with_lookup(
        prefix: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            lookup: Box::new(lookup),
        }
    }

    pub fn from_map(prefix: impl Into<String>, vars: HashMap<String, String>) -> Self {
        Self::with_lookup(prefix, move |name| vars.get(name).cloned())
    }

    pub fn var_name(&self, account: &AccountKey, field: &str) -> String {
        let part = |s: &str| {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect::<String>()
        };
        format!(
            "{}_{}_{}_{}",
            self.prefix,
            part(account.exchange.as_str()),
            part(account.account.as_str()),
            field
        )
    }
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for EnvCredentialStore {
    fn credentials(&self, account: &AccountKey) -> Option<Credentials> {
        let api_key = (self.lookup)(&self.var_name(account, "API_KEY")).filter(|k| !k.trim().is_empty())?;
        let api_secret = (self.lookup)(&self.var_name(account, "API_SECRET")).filter(|s| !s.trim().is_empty())?;
        Some(Credentials {
            api_key: api_key.trim().to_string(),
            api_secret: api_secret.trim().to_string(),
        })
    }
}

/// Configured accounts `store` has no credentials for, in config order
pub fn missing_credentials(store: &dyn CredentialStore, venues: &[VenueConfig]) -> Vec<AccountKey> {
    venues
        .iter()
        .flat_map(|venue| {
            venue
                .accounts
                .iter()
                .map(move |account| AccountKey::new(venue.exchange.clone(), account.clone()))
        })
        .filter(|key| store.credentials(key).is_none())
        .collect()
}
