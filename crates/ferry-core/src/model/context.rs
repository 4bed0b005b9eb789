//! Per-transfer context.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::agent::{
    ClientConfig, Credential, CredentialOwner, LocalAccount, LocalAgent, RemoteAccount,
    RemoteAgent,
};
use super::history::HistoryEntry;
use super::rule::Rule;
use super::transfer::Transfer;
use crate::error::Result;
use crate::store::TransferStore;

/// Gateway-wide default directories
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of every relative directory
    pub gateway_home: PathBuf,
    /// Default directory of received files
    pub default_in_dir: String,
    /// Default directory of sent files
    pub default_out_dir: String,
    /// Default directory of files being received
    pub default_tmp_dir: String,
}

/// Everything a pipeline needs to know about its transfer.
///
/// Assembled once when the pipeline is created. Only the [`Transfer`] record
/// changes afterwards, and only through its owning pipeline.
#[derive(Debug)]
pub struct TransferContext {
    transfer: Mutex<Transfer>,
    /// Rule
    pub rule: Rule,
    /// Protocol client (client-side transfers)
    pub client: Option<ClientConfig>,
    /// Partner server (client-side transfers)
    pub remote_agent: Option<RemoteAgent>,
    /// Our account on the partner server (client-side transfers)
    pub remote_account: Option<RemoteAccount>,
    /// Credentials of the partner server
    pub remote_agent_credentials: Vec<Credential>,
    /// Credentials of our account on the partner server
    pub remote_account_credentials: Vec<Credential>,
    /// Local server (server-side transfers)
    pub local_agent: Option<LocalAgent>,
    /// Partner account (server-side transfers)
    pub local_account: Option<LocalAccount>,
    /// Credentials of the local server
    pub local_agent_credentials: Vec<Credential>,
    /// Credentials of the partner account
    pub local_account_credentials: Vec<Credential>,
    /// Default directories
    pub paths: PathsConfig,
}

impl TransferContext {
    /// Create a bare context, without agents or accounts
    #[must_use]
    pub fn new(transfer: Transfer, rule: Rule, paths: PathsConfig) -> Self {
        Self {
            transfer: Mutex::new(transfer),
            rule,
            client: None,
            remote_agent: None,
            remote_account: None,
            remote_agent_credentials: Vec::new(),
            remote_account_credentials: Vec::new(),
            local_agent: None,
            local_account: None,
            local_agent_credentials: Vec::new(),
            local_account_credentials: Vec::new(),
            paths,
        }
    }

    /// Resolve the context of `transfer` from the store
    pub fn load(store: &dyn TransferStore, transfer: Transfer, paths: PathsConfig) -> Result<Self> {
        transfer.validate()?;

        let rule = store.get_rule(transfer.rule_id)?;
        let mut ctx = Self::new(transfer.clone(), rule, paths);

        if let Some(account_id) = transfer.local_account_id {
            let account = store.get_local_account(account_id)?;
            let agent = store.get_local_agent(account.local_agent_id)?;
            ctx.local_agent_credentials =
                store.get_credentials(CredentialOwner::LocalAgent(agent.id))?;
            ctx.local_account_credentials =
                store.get_credentials(CredentialOwner::LocalAccount(account.id))?;
            ctx.local_agent = Some(agent);
            ctx.local_account = Some(account);
        }

        if let Some(account_id) = transfer.remote_account_id {
            let account = store.get_remote_account(account_id)?;
            let agent = store.get_remote_agent(account.remote_agent_id)?;
            ctx.remote_agent_credentials =
                store.get_credentials(CredentialOwner::RemoteAgent(agent.id))?;
            ctx.remote_account_credentials =
                store.get_credentials(CredentialOwner::RemoteAccount(account.id))?;
            ctx.remote_agent = Some(agent);
            ctx.remote_account = Some(account);
        }

        if let Some(client_id) = transfer.client_id {
            ctx.client = Some(store.get_client(client_id)?);
        }

        Ok(ctx)
    }

    /// True if the file is sent to the partner
    #[must_use]
    pub fn is_send(&self) -> bool {
        self.rule.is_send
    }

    /// True if the partner initiated the transfer
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.transfer().is_server()
    }

    /// Identifier of the transfer
    #[must_use]
    pub fn transfer_id(&self) -> i64 {
        self.transfer().id
    }

    /// Lock the transfer record. The guard must not be held across I/O.
    pub fn transfer(&self) -> MutexGuard<'_, Transfer> {
        self.transfer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the transfer record
    #[must_use]
    pub fn snapshot(&self) -> Transfer {
        self.transfer().clone()
    }

    /// Protocol of the transfer
    #[must_use]
    pub fn protocol(&self) -> &str {
        if let Some(agent) = &self.local_agent {
            &agent.protocol
        } else if let Some(agent) = &self.remote_agent {
            &agent.protocol
        } else {
            ""
        }
    }

    /// Archive record of the transfer in its current state
    #[must_use]
    pub fn history_entry(&self, stop: u64) -> HistoryEntry {
        let trans = self.snapshot();
        let (account, agent) = if trans.is_server() {
            (
                self.local_account.as_ref().map(|a| a.login.clone()),
                self.local_agent.as_ref().map(|a| a.name.clone()),
            )
        } else {
            (
                self.remote_account.as_ref().map(|a| a.login.clone()),
                self.remote_agent.as_ref().map(|a| a.name.clone()),
            )
        };

        HistoryEntry {
            id: trans.id,
            remote_transfer_id: trans.remote_transfer_id,
            is_server: trans.local_account_id.is_some(),
            is_send: self.rule.is_send,
            rule: self.rule.name.clone(),
            client: self.client.as_ref().map(|c| c.name.clone()).unwrap_or_default(),
            account: account.unwrap_or_default(),
            agent: agent.unwrap_or_default(),
            protocol: self.protocol().to_string(),
            src_filename: trans.src_filename,
            dest_filename: trans.dest_filename,
            local_path: trans.local_path,
            remote_path: trans.remote_path,
            filesize: trans.filesize,
            progress: trans.progress,
            status: trans.status,
            step: trans.step,
            error: trans.error,
            task_number: trans.task_number,
            start: trans.start,
            stop,
        }
    }
}
