//! Data model of the gateway.

mod agent;
mod context;
mod history;
mod rule;
mod transfer;

pub use agent::{
    ClientConfig, Credential, CredentialOwner, LocalAccount, LocalAgent, RemoteAccount,
    RemoteAgent,
};
pub use context::{PathsConfig, TransferContext};
pub use history::HistoryEntry;
pub use rule::Rule;
pub use transfer::{
    DEFAULT_RETRY_DELAY, DEFAULT_RETRY_FACTOR, Transfer, TransferColumn, TransferStatus,
    TransferStep,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current date in unix seconds
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
