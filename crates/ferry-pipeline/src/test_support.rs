//! Shared fixtures of the unit tests.

use ferry_core::model::{ClientConfig, LocalAccount, LocalAgent, RemoteAccount, RemoteAgent};
use ferry_core::{
    MemoryStore, PathsConfig, Rule, Transfer, TransferContext, TransferStatus, TransferStore,
};
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::pipeline::Pipeline;
use crate::runner::{FnTask, StopSignal, Task, TaskChainFactory, TaskChains};
use crate::services::Services;

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub services: Services,
    pub rule_id: i64,
    pub client_id: i64,
    pub remote_account_id: i64,
    pub local_account_id: i64,
    files: AtomicU32,
}

impl Fixture {
    pub fn new(is_send: bool) -> Self {
        Self::with_chains(is_send, TaskChains::default())
    }

    pub fn with_chains(is_send: bool, chains: TaskChains) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());

        let rule_id = store
            .insert_rule(Rule {
                name: if is_send { "push" } else { "pull" }.to_string(),
                is_send,
                ..Rule::default()
            })
            .unwrap();
        let client_id = store
            .insert_client(ClientConfig {
                name: "loopback".to_string(),
                protocol: "local".to_string(),
                ..ClientConfig::default()
            })
            .unwrap();
        let remote_agent_id = store
            .insert_remote_agent(RemoteAgent {
                name: "partner".to_string(),
                protocol: "local".to_string(),
                address: dir.path().join("partner").display().to_string(),
                ..RemoteAgent::default()
            })
            .unwrap();
        let remote_account_id = store
            .insert_remote_account(RemoteAccount {
                remote_agent_id,
                login: "toto".to_string(),
                ..RemoteAccount::default()
            })
            .unwrap();
        let local_agent_id = store
            .insert_local_agent(LocalAgent {
                name: "server".to_string(),
                protocol: "local".to_string(),
                root_dir: "server".to_string(),
                ..LocalAgent::default()
            })
            .unwrap();
        let local_account_id = store
            .insert_local_account(LocalAccount {
                local_agent_id,
                login: "titi".to_string(),
                ..LocalAccount::default()
            })
            .unwrap();

        let paths = PathsConfig {
            gateway_home: dir.path().to_path_buf(),
            default_in_dir: "in".to_string(),
            default_out_dir: "out".to_string(),
            default_tmp_dir: "tmp".to_string(),
        };
        let shared: Arc<dyn TransferStore> = store.clone();
        let services = Services::new(shared)
            .with_paths(paths)
            .with_runners(TaskChainFactory::new().with_rule(rule_id, chains));

        Self {
            dir,
            store,
            services,
            rule_id,
            client_id,
            remote_account_id,
            local_account_id,
            files: AtomicU32::new(0),
        }
    }

    fn next_name(&self) -> String {
        format!("file-{}.txt", self.files.fetch_add(1, Ordering::SeqCst))
    }

    /// Insert a planned client transfer. For push rules, the file is created
    /// in the default out directory.
    pub fn planned_client(&self, content: &[u8]) -> i64 {
        let name = self.next_name();
        let rule = self.store.get_rule(self.rule_id).unwrap();
        if rule.is_send {
            let out = self.dir.path().join("out");
            fs::create_dir_all(&out).unwrap();
            fs::write(out.join(&name), content).unwrap();
        }

        let mut trans = Transfer {
            rule_id: self.rule_id,
            client_id: Some(self.client_id),
            remote_account_id: Some(self.remote_account_id),
            src_filename: name,
            status: TransferStatus::Planned,
            ..Transfer::default()
        };
        self.store.insert_transfer(&mut trans).unwrap();
        trans.id
    }

    /// Server transfer, not yet inserted
    pub fn server_transfer(&self, name: &str) -> Transfer {
        Transfer {
            rule_id: self.rule_id,
            local_account_id: Some(self.local_account_id),
            src_filename: name.to_string(),
            ..Transfer::default()
        }
    }

    pub fn client_pipeline(&self, content: &[u8]) -> Arc<Pipeline> {
        let id = self.planned_client(content);
        Pipeline::new_client(&self.services, self.store.get_transfer(id).unwrap()).unwrap()
    }
}

pub(crate) fn counting_task(name: &str, counter: &Arc<AtomicU32>) -> Arc<dyn Task> {
    let counter = Arc::clone(counter);
    Arc::new(FnTask::new(
        name,
        move |_: &TransferContext, _: &StopSignal| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    ))
}
