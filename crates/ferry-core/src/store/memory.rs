//! In-memory store with optional JSON file persistence.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Session, TransferStore};
use crate::error::{Result, StoreError};
use crate::model::{
    ClientConfig, Credential, CredentialOwner, HistoryEntry, LocalAccount, LocalAgent,
    RemoteAccount, RemoteAgent, Rule, Transfer, TransferColumn,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    next_transfer_id: i64,
    transfers: BTreeMap<i64, Transfer>,
    history: BTreeMap<i64, HistoryEntry>,
}

/// On-disk layout of the database file
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Snapshot {
    transfers: Vec<Transfer>,
    history: Vec<HistoryEntry>,
    rules: Vec<Rule>,
    clients: Vec<ClientConfig>,
    local_agents: Vec<LocalAgent>,
    local_accounts: Vec<LocalAccount>,
    remote_agents: Vec<RemoteAgent>,
    remote_accounts: Vec<RemoteAccount>,
    credentials: Vec<Credential>,
}

trait Record: Clone {
    const KIND: &'static str;
    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
}

macro_rules! impl_record {
    ($($ty:ty => $kind:literal),* $(,)?) => {
        $(
            impl Record for $ty {
                const KIND: &'static str = $kind;
                fn id(&self) -> i64 {
                    self.id
                }
                fn set_id(&mut self, id: i64) {
                    self.id = id;
                }
            }
        )*
    };
}

impl_record! {
    Rule => "rule",
    ClientConfig => "client",
    LocalAgent => "local agent",
    LocalAccount => "local account",
    RemoteAgent => "remote agent",
    RemoteAccount => "remote account",
    Credential => "credential",
}

/// Transfer store kept in memory.
///
/// Live transfers and history sit behind a single lock so archiving and
/// transactions are atomic. Configuration records are read-mostly and live
/// in concurrent maps. When opened with a path, every write is flushed to a
/// JSON file (written to a temporary file, then renamed over the old one).
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    rules: DashMap<i64, Rule>,
    clients: DashMap<i64, ClientConfig>,
    local_agents: DashMap<i64, LocalAgent>,
    local_accounts: DashMap<i64, LocalAccount>,
    remote_agents: DashMap<i64, RemoteAgent>,
    remote_accounts: DashMap<i64, RemoteAccount>,
    credentials: DashMap<i64, Credential>,
    next_config_id: AtomicI64,
    path: Option<PathBuf>,
    closed: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty, purely in-memory store
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                next_transfer_id: 1,
                ..Tables::default()
            }),
            rules: DashMap::new(),
            clients: DashMap::new(),
            local_agents: DashMap::new(),
            local_accounts: DashMap::new(),
            remote_agents: DashMap::new(),
            remote_accounts: DashMap::new(),
            credentials: DashMap::new(),
            next_config_id: AtomicI64::new(1),
            path: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Open the database file at `path`, creating it if it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self::new();

        if path.exists() {
            let json = fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&json)?;
            store.load_snapshot(snapshot);
            tracing::debug!(path = %path.display(), "Loaded database file");
        } else if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        store.path = Some(path);
        store.flush(&store.lock())?;

        Ok(store)
    }

    /// Path of the database file, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Make every further operation fail as if the database was lost
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Undo [`MemoryStore::close`]
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Insert a rule, assigning its id when it is `0`
    pub fn insert_rule(&self, rule: Rule) -> Result<i64> {
        self.insert_record(&self.rules, rule)
    }

    /// Insert a protocol client, assigning its id when it is `0`
    pub fn insert_client(&self, client: ClientConfig) -> Result<i64> {
        self.insert_record(&self.clients, client)
    }

    /// Insert a local server, assigning its id when it is `0`
    pub fn insert_local_agent(&self, agent: LocalAgent) -> Result<i64> {
        self.insert_record(&self.local_agents, agent)
    }

    /// Insert a partner account, assigning its id when it is `0`
    pub fn insert_local_account(&self, account: LocalAccount) -> Result<i64> {
        if !self.local_agents.contains_key(&account.local_agent_id) {
            return Err(StoreError::not_found("local agent", account.local_agent_id));
        }
        self.insert_record(&self.local_accounts, account)
    }

    /// Insert a partner server, assigning its id when it is `0`
    pub fn insert_remote_agent(&self, agent: RemoteAgent) -> Result<i64> {
        self.insert_record(&self.remote_agents, agent)
    }

    /// Insert a remote account, assigning its id when it is `0`
    pub fn insert_remote_account(&self, account: RemoteAccount) -> Result<i64> {
        if !self.remote_agents.contains_key(&account.remote_agent_id) {
            return Err(StoreError::not_found(
                "remote agent",
                account.remote_agent_id,
            ));
        }
        self.insert_record(&self.remote_accounts, account)
    }

    /// Insert a credential, assigning its id when it is `0`
    pub fn insert_credential(&self, credential: Credential) -> Result<i64> {
        self.insert_record(&self.credentials, credential)
    }

    fn insert_record<T: Record>(&self, map: &DashMap<i64, T>, mut record: T) -> Result<i64> {
        self.check_open()?;

        if record.id() == 0 {
            record.set_id(self.next_config_id.fetch_add(1, Ordering::SeqCst));
        } else {
            self.next_config_id
                .fetch_max(record.id() + 1, Ordering::SeqCst);
        }

        let id = record.id();
        match map.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::Duplicate { kind: T::KIND, id });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }

        self.flush(&self.lock())?;
        Ok(id)
    }

    fn get_record<T: Record>(&self, map: &DashMap<i64, T>, id: i64) -> Result<T> {
        self.check_open()?;
        map.get(&id)
            .map(|r| r.value().clone())
            .ok_or(StoreError::not_found(T::KIND, id))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("database connection lost"));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_snapshot(&mut self, snapshot: Snapshot) {
        let tables = self.tables.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut max_config_id = 0;

        for transfer in snapshot.transfers {
            tables.transfers.insert(transfer.id, transfer);
        }
        for entry in snapshot.history {
            tables.history.insert(entry.id, entry);
        }
        tables.next_transfer_id = tables
            .transfers
            .keys()
            .chain(tables.history.keys())
            .max()
            .map_or(1, |id| id + 1);

        fn fill<T: Record>(map: &DashMap<i64, T>, records: Vec<T>, max: &mut i64) {
            for record in records {
                *max = (*max).max(record.id());
                map.insert(record.id(), record);
            }
        }

        fill(&self.rules, snapshot.rules, &mut max_config_id);
        fill(&self.clients, snapshot.clients, &mut max_config_id);
        fill(&self.local_agents, snapshot.local_agents, &mut max_config_id);
        fill(&self.local_accounts, snapshot.local_accounts, &mut max_config_id);
        fill(&self.remote_agents, snapshot.remote_agents, &mut max_config_id);
        fill(&self.remote_accounts, snapshot.remote_accounts, &mut max_config_id);
        fill(&self.credentials, snapshot.credentials, &mut max_config_id);

        self.next_config_id = AtomicI64::new(max_config_id + 1);
    }

    /// Write the database file. The caller holds the tables lock, which
    /// serializes writers.
    fn flush(&self, tables: &Tables) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        fn collect<T: Record>(map: &DashMap<i64, T>) -> Vec<T> {
            let mut records: Vec<T> = map.iter().map(|r| r.value().clone()).collect();
            records.sort_by_key(|r| r.id());
            records
        }

        let snapshot = Snapshot {
            transfers: tables.transfers.values().cloned().collect(),
            history: tables.history.values().cloned().collect(),
            rules: collect(&self.rules),
            clients: collect(&self.clients),
            local_agents: collect(&self.local_agents),
            local_accounts: collect(&self.local_accounts),
            remote_agents: collect(&self.remote_agents),
            remote_accounts: collect(&self.remote_accounts),
            credentials: collect(&self.credentials),
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;

        Ok(())
    }
}

struct MemorySession<'a> {
    tables: &'a mut Tables,
}

impl Session for MemorySession<'_> {
    fn select_for_update(
        &mut self,
        filter: &dyn Fn(&Transfer) -> bool,
        limit: Option<usize>,
    ) -> Result<Vec<Transfer>> {
        Ok(self
            .tables
            .transfers
            .values()
            .filter(|t| filter(t))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn update(&mut self, transfer: &Transfer, columns: &[TransferColumn]) -> Result<()> {
        let stored = self
            .tables
            .transfers
            .get_mut(&transfer.id)
            .ok_or(StoreError::not_found("transfer", transfer.id))?;
        stored.copy_columns(transfer, columns);
        Ok(())
    }
}

impl TransferStore for MemoryStore {
    fn get_transfer(&self, id: i64) -> Result<Transfer> {
        self.check_open()?;
        self.lock()
            .transfers
            .get(&id)
            .cloned()
            .ok_or(StoreError::not_found("transfer", id))
    }

    fn insert_transfer(&self, transfer: &mut Transfer) -> Result<()> {
        self.check_open()?;
        transfer.validate()?;
        if !self.rules.contains_key(&transfer.rule_id) {
            return Err(StoreError::not_found("rule", transfer.rule_id));
        }

        let mut tables = self.lock();
        if transfer.id == 0 {
            transfer.id = tables.next_transfer_id;
        }
        if tables.transfers.contains_key(&transfer.id) || tables.history.contains_key(&transfer.id)
        {
            return Err(StoreError::Duplicate {
                kind: "transfer",
                id: transfer.id,
            });
        }
        tables.next_transfer_id = tables.next_transfer_id.max(transfer.id + 1);
        tables.transfers.insert(transfer.id, transfer.clone());

        self.flush(&tables)
    }

    fn update_transfer(&self, transfer: &Transfer, columns: &[TransferColumn]) -> Result<()> {
        self.check_open()?;
        let mut tables = self.lock();
        let stored = tables
            .transfers
            .get_mut(&transfer.id)
            .ok_or(StoreError::not_found("transfer", transfer.id))?;
        stored.copy_columns(transfer, columns);

        self.flush(&tables)
    }

    fn list_transfers(&self) -> Result<Vec<Transfer>> {
        self.check_open()?;
        Ok(self.lock().transfers.values().cloned().collect())
    }

    fn archive_transfer(&self, entry: &HistoryEntry) -> Result<()> {
        self.check_open()?;
        let mut tables = self.lock();
        if tables.history.contains_key(&entry.id) {
            return Err(StoreError::Duplicate {
                kind: "history entry",
                id: entry.id,
            });
        }
        if tables.transfers.remove(&entry.id).is_none() {
            return Err(StoreError::not_found("transfer", entry.id));
        }
        tables.history.insert(entry.id, entry.clone());

        self.flush(&tables)
    }

    fn get_history(&self, id: i64) -> Result<HistoryEntry> {
        self.check_open()?;
        self.lock()
            .history
            .get(&id)
            .cloned()
            .ok_or(StoreError::not_found("history entry", id))
    }

    fn list_history(&self) -> Result<Vec<HistoryEntry>> {
        self.check_open()?;
        Ok(self.lock().history.values().cloned().collect())
    }

    fn transaction(&self, f: &mut dyn FnMut(&mut dyn Session) -> Result<()>) -> Result<()> {
        self.check_open()?;
        let mut tables = self.lock();
        let backup = tables.clone();

        let outcome = {
            let mut session = MemorySession {
                tables: &mut tables,
            };
            f(&mut session)
        };

        match outcome {
            Ok(()) => self.flush(&tables),
            Err(e) => {
                *tables = backup;
                Err(e)
            }
        }
    }

    fn get_rule(&self, id: i64) -> Result<Rule> {
        self.get_record(&self.rules, id)
    }

    fn get_client(&self, id: i64) -> Result<ClientConfig> {
        self.get_record(&self.clients, id)
    }

    fn list_clients(&self) -> Result<Vec<ClientConfig>> {
        self.check_open()?;
        let mut clients: Vec<_> = self.clients.iter().map(|c| c.value().clone()).collect();
        clients.sort_by_key(|c| c.id);
        Ok(clients)
    }

    fn get_local_agent(&self, id: i64) -> Result<LocalAgent> {
        self.get_record(&self.local_agents, id)
    }

    fn get_local_account(&self, id: i64) -> Result<LocalAccount> {
        self.get_record(&self.local_accounts, id)
    }

    fn get_remote_agent(&self, id: i64) -> Result<RemoteAgent> {
        self.get_record(&self.remote_agents, id)
    }

    fn get_remote_account(&self, id: i64) -> Result<RemoteAccount> {
        self.get_record(&self.remote_accounts, id)
    }

    fn get_credentials(&self, owner: CredentialOwner) -> Result<Vec<Credential>> {
        self.check_open()?;
        let mut creds: Vec<_> = self
            .credentials
            .iter()
            .filter(|c| c.owner == owner)
            .map(|c| c.value().clone())
            .collect();
        creds.sort_by_key(|c| c.id);
        Ok(creds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TransferStatus, TransferStep};
    use crate::transfer_error::TransferError;
    use tempfile::TempDir;

    fn seeded() -> (MemoryStore, Transfer) {
        let store = MemoryStore::new();
        let rule = store
            .insert_rule(Rule {
                name: "push".to_string(),
                is_send: true,
                ..Rule::default()
            })
            .unwrap();
        let agent = store
            .insert_remote_agent(RemoteAgent {
                name: "partner".to_string(),
                protocol: "local".to_string(),
                address: "/tmp".to_string(),
                ..RemoteAgent::default()
            })
            .unwrap();
        let account = store
            .insert_remote_account(RemoteAccount {
                remote_agent_id: agent,
                login: "toto".to_string(),
                ..RemoteAccount::default()
            })
            .unwrap();
        let client = store
            .insert_client(ClientConfig {
                name: "local-client".to_string(),
                protocol: "local".to_string(),
                ..ClientConfig::default()
            })
            .unwrap();

        let transfer = Transfer {
            rule_id: rule,
            client_id: Some(client),
            remote_account_id: Some(account),
            src_filename: "file.txt".to_string(),
            dest_filename: "file.txt".to_string(),
            ..Transfer::default()
        };

        (store, transfer)
    }

    fn history_of(transfer: &Transfer) -> HistoryEntry {
        HistoryEntry {
            id: transfer.id,
            remote_transfer_id: transfer.remote_transfer_id.clone(),
            is_server: false,
            is_send: true,
            rule: "push".to_string(),
            client: String::new(),
            account: String::new(),
            agent: String::new(),
            protocol: "local".to_string(),
            src_filename: transfer.src_filename.clone(),
            dest_filename: transfer.dest_filename.clone(),
            local_path: transfer.local_path.clone(),
            remote_path: transfer.remote_path.clone(),
            filesize: transfer.filesize,
            progress: transfer.progress,
            status: TransferStatus::Done,
            step: TransferStep::None,
            error: TransferError::default(),
            task_number: 0,
            start: 0,
            stop: 1,
        }
    }

    #[test]
    fn test_insert_assigns_ids() {
        let (store, mut transfer) = seeded();
        let mut second = transfer.clone();

        store.insert_transfer(&mut transfer).unwrap();
        store.insert_transfer(&mut second).unwrap();

        assert_ne!(transfer.id, 0);
        assert_eq!(second.id, transfer.id + 1);
        assert_eq!(store.get_transfer(transfer.id).unwrap(), transfer);
    }

    #[test]
    fn test_insert_rejects_unknown_rule() {
        let (store, mut transfer) = seeded();
        transfer.rule_id = 999;
        assert!(matches!(
            store.insert_transfer(&mut transfer),
            Err(StoreError::NotFound { kind: "rule", .. })
        ));
    }

    #[test]
    fn test_update_subset() {
        let (store, mut transfer) = seeded();
        store.insert_transfer(&mut transfer).unwrap();

        let mut live = transfer.clone();
        live.progress = 42;
        live.status = TransferStatus::Running;
        store
            .update_transfer(&live, &[TransferColumn::Progress])
            .unwrap();

        let stored = store.get_transfer(transfer.id).unwrap();
        assert_eq!(stored.progress, 42);
        assert_eq!(stored.status, TransferStatus::Planned);
    }

    #[test]
    fn test_archive_moves_to_history() {
        let (store, mut transfer) = seeded();
        store.insert_transfer(&mut transfer).unwrap();

        store.archive_transfer(&history_of(&transfer)).unwrap();

        assert!(store.get_transfer(transfer.id).is_err());
        assert_eq!(
            store.get_history(transfer.id).unwrap().status,
            TransferStatus::Done
        );
        assert!(store.archive_transfer(&history_of(&transfer)).is_err());
    }

    #[test]
    fn test_transaction_rollback() {
        let (store, mut transfer) = seeded();
        store.insert_transfer(&mut transfer).unwrap();

        let result = store.transaction(&mut |session: &mut dyn Session| {
            let mut rows = session.select_for_update(&|_| true, None)?;
            rows[0].status = TransferStatus::Running;
            session.update(&rows[0], &[TransferColumn::Status])?;
            Err(StoreError::invalid("abort"))
        });

        assert!(result.is_err());
        assert_eq!(
            store.get_transfer(transfer.id).unwrap().status,
            TransferStatus::Planned
        );
    }

    #[test]
    fn test_transaction_select_limit() {
        let (store, transfer) = seeded();
        for _ in 0..5 {
            store.insert_transfer(&mut transfer.clone()).unwrap();
        }

        let mut claimed = Vec::new();
        store
            .transaction(&mut |session: &mut dyn Session| {
                claimed = session.select_for_update(
                    &|t| t.status == TransferStatus::Planned,
                    Some(3),
                )?;
                for row in &mut claimed {
                    row.status = TransferStatus::Running;
                    session.update(row, &[TransferColumn::Status])?;
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(claimed.len(), 3);
        let running = store
            .list_transfers()
            .unwrap()
            .into_iter()
            .filter(|t| t.status == TransferStatus::Running)
            .count();
        assert_eq!(running, 3);
    }

    #[test]
    fn test_closed_store_fails() {
        let (store, mut transfer) = seeded();
        store.insert_transfer(&mut transfer).unwrap();

        store.close();
        let err = store.get_transfer(transfer.id).unwrap_err();
        assert!(err.is_connection_loss());

        store.reopen();
        assert!(store.get_transfer(transfer.id).is_ok());
    }

    #[test]
    fn test_file_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("ferry.json");

        let id = {
            let store = MemoryStore::open(&path).unwrap();
            let rule = store
                .insert_rule(Rule {
                    name: "pull".to_string(),
                    ..Rule::default()
                })
                .unwrap();
            let agent = store.insert_local_agent(LocalAgent::default()).unwrap();
            let account = store
                .insert_local_account(LocalAccount {
                    local_agent_id: agent,
                    login: "partner".to_string(),
                    ..LocalAccount::default()
                })
                .unwrap();

            let mut transfer = Transfer {
                rule_id: rule,
                local_account_id: Some(account),
                dest_filename: "in.bin".to_string(),
                progress: 7,
                ..Transfer::default()
            };
            store.insert_transfer(&mut transfer).unwrap();
            transfer.id
        };

        let store = MemoryStore::open(&path).unwrap();
        let transfer = store.get_transfer(id).unwrap();
        assert_eq!(transfer.progress, 7);
        assert_eq!(store.get_rule(transfer.rule_id).unwrap().name, "pull");

        let new_rule = store.insert_rule(Rule::default()).unwrap();
        assert!(new_rule > transfer.rule_id);
    }

    #[test]
    fn test_credentials_by_owner() {
        let store = MemoryStore::new();
        for (owner, value) in [
            (CredentialOwner::RemoteAccount(1), "a"),
            (CredentialOwner::RemoteAccount(2), "b"),
            (CredentialOwner::RemoteAccount(1), "c"),
        ] {
            store
                .insert_credential(Credential {
                    id: 0,
                    owner,
                    kind: "password".to_string(),
                    value: value.to_string(),
                })
                .unwrap();
        }

        let creds = store
            .get_credentials(CredentialOwner::RemoteAccount(1))
            .unwrap();
        assert_eq!(creds.len(), 2);
        assert_eq!(creds[0].value, "a");
        assert_eq!(creds[1].value, "c");
    }
}
