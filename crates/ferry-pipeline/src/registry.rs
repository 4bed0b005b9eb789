//! Registry of the running pipelines.
//!
//! The registry is the single place where the gateway looks up a running
//! transfer, whether to address it individually (pause, cancel) or in bulk
//! when a client or server is shut down.
//!
//! Server-side and client-side transfers are counted separately, each against
//! its own ceiling (0 means unlimited).

use ferry_core::TransferErrorCode;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;

#[derive(Default)]
struct Inner {
    pipelines: HashMap<i64, Arc<Pipeline>>,
    servers: u64,
    clients: u64,
    max_servers: u64,
    max_clients: u64,
}

impl Inner {
    fn available(count: u64, limit: u64) -> Option<u64> {
        (limit != 0).then(|| limit.saturating_sub(count))
    }
}

/// Registry of the running pipelines
#[derive(Default)]
pub struct PipelineRegistry {
    inner: RwLock<Inner>,
}

impl PipelineRegistry {
    /// Create an empty registry without limits
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry with the given ceilings
    #[must_use]
    pub fn with_limits(max_servers: u64, max_clients: u64) -> Self {
        let registry = Self::new();
        registry.set_limits(max_servers, max_clients);
        registry
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pipeline.
    ///
    /// # Errors
    ///
    /// Fails if a pipeline is already registered for the same transfer, or
    /// if the ceiling of the pipeline's origin is reached.
    pub fn add(&self, pipeline: &Arc<Pipeline>) -> Result<()> {
        let id = pipeline.transfer_id();
        let is_server = pipeline.is_server();
        let mut inner = self.write();

        if inner.pipelines.contains_key(&id) {
            return Err(PipelineError::internal(format!(
                "transfer {id} is already running"
            )));
        }

        let (count, limit) = if is_server {
            (inner.servers, inner.max_servers)
        } else {
            (inner.clients, inner.max_clients)
        };
        if limit != 0 && count >= limit {
            return Err(PipelineError::new(
                TransferErrorCode::ExceededLimit,
                "transfer limit reached",
            ));
        }

        if is_server {
            inner.servers += 1;
        } else {
            inner.clients += 1;
        }
        inner.pipelines.insert(id, Arc::clone(pipeline));

        Ok(())
    }

    /// Unregister a pipeline. Unknown ids are ignored.
    pub fn remove(&self, id: i64) {
        let mut inner = self.write();
        if let Some(pipeline) = inner.pipelines.remove(&id) {
            if pipeline.is_server() {
                inner.servers = inner.servers.saturating_sub(1);
            } else {
                inner.clients = inner.clients.saturating_sub(1);
            }
        }
    }

    /// Set the server and client ceilings (0 means unlimited)
    pub fn set_limits(&self, max_servers: u64, max_clients: u64) {
        let mut inner = self.write();
        inner.max_servers = max_servers;
        inner.max_clients = max_clients;
    }

    /// True if a pipeline is registered for the transfer
    #[must_use]
    pub fn exists(&self, id: i64) -> bool {
        self.read().pipelines.contains_key(&id)
    }

    /// Pipeline of the transfer, if running
    #[must_use]
    pub fn get(&self, id: i64) -> Option<Arc<Pipeline>> {
        self.read().pipelines.get(&id).cloned()
    }

    /// Number of running pipelines
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().pipelines.len()
    }

    /// True if nothing is running
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().pipelines.is_empty()
    }

    /// Ids of the running transfers, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.read().pipelines.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remaining client-side capacity, `None` when unlimited
    #[must_use]
    pub fn available_client(&self) -> Option<u64> {
        let inner = self.read();
        Inner::available(inner.clients, inner.max_clients)
    }

    /// Remaining server-side capacity, `None` when unlimited
    #[must_use]
    pub fn available_server(&self) -> Option<u64> {
        let inner = self.read();
        Inner::available(inner.servers, inner.max_servers)
    }

    fn running(&self, id: i64) -> Result<Arc<Pipeline>> {
        self.get(id)
            .ok_or_else(|| PipelineError::internal(format!("transfer {id} is not running")))
    }

    /// Pause a running transfer, giving its partner `deadline` to
    /// acknowledge
    ///
    /// # Errors
    ///
    /// Fails if the transfer is not running, or if its interruption handler
    /// failed.
    pub fn pause(&self, id: i64, deadline: Duration) -> Result<()> {
        self.running(id)?.pause(deadline)
    }

    /// Interrupt a running transfer
    ///
    /// # Errors
    ///
    /// Fails if the transfer is not running, or if its interruption handler
    /// failed.
    pub fn interrupt(&self, id: i64, deadline: Duration) -> Result<()> {
        self.running(id)?.interrupt(deadline)
    }

    /// Cancel a running transfer
    ///
    /// # Errors
    ///
    /// Fails if the transfer is not running, if its interruption handler
    /// failed, or if it could not be archived.
    pub fn cancel(&self, id: i64, deadline: Duration) -> Result<()> {
        self.running(id)?.cancel(deadline)
    }

    fn matching(&self, filter: impl Fn(&Pipeline) -> bool) -> Vec<Arc<Pipeline>> {
        self.read()
            .pipelines
            .values()
            .filter(|p| filter(p))
            .cloned()
            .collect()
    }

    /// Cancel every running transfer
    ///
    /// # Errors
    ///
    /// Returns the first error met; every transfer is still addressed.
    pub fn cancel_all(&self, deadline: Duration) -> Result<()> {
        dispatch(self.matching(|_| true), |p| p.cancel(deadline))
    }

    /// Interrupt every transfer run by a protocol client
    ///
    /// # Errors
    ///
    /// Returns the first error met; every transfer is still addressed.
    pub fn stop_all_from_client(&self, client_id: i64, deadline: Duration) -> Result<()> {
        let pipelines = self.matching(|p| {
            !p.is_server() && p.context().transfer().client_id == Some(client_id)
        });
        dispatch(pipelines, |p| p.interrupt(deadline))
    }

    /// Interrupt every transfer served by a local server
    ///
    /// # Errors
    ///
    /// Returns the first error met; every transfer is still addressed.
    pub fn stop_all_from_server(&self, local_agent_id: i64, deadline: Duration) -> Result<()> {
        let pipelines = self.matching(|p| {
            p.context()
                .local_agent
                .as_ref()
                .is_some_and(|agent| agent.id == local_agent_id)
        });
        dispatch(pipelines, |p| p.interrupt(deadline))
    }

    /// Forget every pipeline and limit
    pub fn reset(&self) {
        *self.write() = Inner::default();
    }
}

/// Run `op` on every pipeline concurrently, keeping the first error. A
/// pipeline whose thread cannot be started is handled on the calling thread.
fn dispatch<F>(pipelines: Vec<Arc<Pipeline>>, op: F) -> Result<()>
where
    F: Fn(&Pipeline) -> Result<()> + Sync,
{
    if pipelines.is_empty() {
        return Ok(());
    }

    let op = &op;
    let results: Vec<Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = pipelines
            .iter()
            .map(|pipeline| {
                thread::Builder::new()
                    .name(format!("ferry-stop-{}", pipeline.transfer_id()))
                    .spawn_scoped(scope, move || op(pipeline))
            })
            .collect();

        handles
            .into_iter()
            .zip(&pipelines)
            .map(|(handle, pipeline)| match handle {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(PipelineError::internal("control operation panicked"))),
                Err(err) => {
                    tracing::warn!(
                        transfer_id = pipeline.transfer_id(),
                        "Failed to start a control thread: {}",
                        err
                    );
                    op(pipeline)
                }
            })
            .collect()
    });

    let mut first = None;
    for (pipeline, result) in pipelines.iter().zip(results) {
        if let Err(err) = result {
            tracing::warn!(
                transfer_id = pipeline.transfer_id(),
                "Failed to stop transfer: {}",
                err
            );
            first.get_or_insert(err);
        }
    }

    first.map_or(Ok(()), Err)
}
