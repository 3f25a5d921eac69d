//! Exchange implementations - Pluggable exchange adapters

pub mod credentials;
pub mod paper;

pub use credentials::{EnvCredentialStore, missing_credentials};
pub use paper::{PaperBehavior, PaperExchange};
