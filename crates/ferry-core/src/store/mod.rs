//! Persistence contract.
//!
//! Pipelines only need single-record reads and column-subset updates; the
//! scheduler additionally claims due transfers inside a [`TransferStore::transaction`].

mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::model::{
    ClientConfig, Credential, CredentialOwner, HistoryEntry, LocalAccount, LocalAgent,
    RemoteAccount, RemoteAgent, Rule, Transfer, TransferColumn,
};

/// Row selection and update inside a transaction
pub trait Session {
    /// Select (and lock until commit) the live transfers matching `filter`,
    /// ordered by id, at most `limit` of them.
    fn select_for_update(
        &mut self,
        filter: &dyn Fn(&Transfer) -> bool,
        limit: Option<usize>,
    ) -> Result<Vec<Transfer>>;

    /// Update the given columns of a selected transfer
    fn update(&mut self, transfer: &Transfer, columns: &[TransferColumn]) -> Result<()>;
}

/// Storage of transfers, history and configuration records
pub trait TransferStore: Send + Sync {
    /// Fetch a live transfer
    fn get_transfer(&self, id: i64) -> Result<Transfer>;

    /// Insert a live transfer, assigning its id when it is `0`
    fn insert_transfer(&self, transfer: &mut Transfer) -> Result<()>;

    /// Update the given columns of a live transfer
    fn update_transfer(&self, transfer: &Transfer, columns: &[TransferColumn]) -> Result<()>;

    /// Every live transfer, ordered by id
    fn list_transfers(&self) -> Result<Vec<Transfer>>;

    /// Atomically delete the live transfer `entry.id` and insert `entry`
    /// into the history.
    fn archive_transfer(&self, entry: &HistoryEntry) -> Result<()>;

    /// Fetch a history entry
    fn get_history(&self, id: i64) -> Result<HistoryEntry>;

    /// Every history entry, ordered by id
    fn list_history(&self) -> Result<Vec<HistoryEntry>>;

    /// Run `f` atomically. Nothing `f` did is kept if it returns an error.
    ///
    /// `f` must only use the given [`Session`]: calling back into the store
    /// from inside the closure may deadlock.
    fn transaction(&self, f: &mut dyn FnMut(&mut dyn Session) -> Result<()>) -> Result<()>;

    /// Fetch a rule
    fn get_rule(&self, id: i64) -> Result<Rule>;

    /// Fetch a protocol client
    fn get_client(&self, id: i64) -> Result<ClientConfig>;

    /// Every protocol client
    fn list_clients(&self) -> Result<Vec<ClientConfig>>;

    /// Fetch a local server
    fn get_local_agent(&self, id: i64) -> Result<LocalAgent>;

    /// Fetch a partner account on a local server
    fn get_local_account(&self, id: i64) -> Result<LocalAccount>;

    /// Fetch a partner server
    fn get_remote_agent(&self, id: i64) -> Result<RemoteAgent>;

    /// Fetch our account on a partner server
    fn get_remote_account(&self, id: i64) -> Result<RemoteAccount>;

    /// Credentials of a record
    fn get_credentials(&self, owner: CredentialOwner) -> Result<Vec<Credential>>;
}
