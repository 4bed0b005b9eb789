//! Shared services of the pipelines.

use ferry_core::{PathsConfig, TransferLimits, TransferStore};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::Protocols;
use crate::registry::PipelineRegistry;
use crate::runner::{NoopRunner, RunnerFactory};
use crate::trace::Trace;

/// Default interval between two progress updates in the store
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Default deadline given to the partner when a transfer is paused,
/// interrupted or canceled
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a pipeline needs besides its transfer.
///
/// One instance lives for the whole process (tests create their own); clones
/// share the same store, registry and limits.
#[derive(Clone)]
pub struct Services {
    /// Persistence
    pub store: Arc<dyn TransferStore>,
    /// Running pipelines
    pub registry: Arc<PipelineRegistry>,
    /// Inbound/outbound slots
    pub limits: Arc<TransferLimits>,
    /// Default directories
    pub paths: PathsConfig,
    /// Task runners of new pipelines
    pub runners: Arc<dyn RunnerFactory>,
    /// Protocol clients of client transfers
    pub protocols: Protocols,
    /// Hooks given to new pipelines
    pub trace: Trace,
    /// Minimum interval between two progress updates
    pub update_interval: Duration,
}

impl Services {
    /// Create services around a store, without limits nor tasks
    #[must_use]
    pub fn new(store: Arc<dyn TransferStore>) -> Self {
        Self {
            store,
            registry: Arc::new(PipelineRegistry::new()),
            limits: Arc::new(TransferLimits::new(0, 0)),
            paths: PathsConfig::default(),
            runners: Arc::new(NoopRunner),
            protocols: Protocols::new(),
            trace: Trace::default(),
            update_interval: DEFAULT_UPDATE_INTERVAL,
        }
    }

    /// Set the default directories
    #[must_use]
    pub fn with_paths(mut self, paths: PathsConfig) -> Self {
        self.paths = paths;
        self
    }

    /// Set the slot limits
    #[must_use]
    pub fn with_limits(mut self, limits: TransferLimits) -> Self {
        self.limits = Arc::new(limits);
        self
    }

    /// Set the registry
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<PipelineRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Set the runner factory
    #[must_use]
    pub fn with_runners(mut self, runners: impl RunnerFactory + 'static) -> Self {
        self.runners = Arc::new(runners);
        self
    }

    /// Set the protocol clients
    #[must_use]
    pub fn with_protocols(mut self, protocols: Protocols) -> Self {
        self.protocols = protocols;
        self
    }

    /// Set the trace hooks
    #[must_use]
    pub fn with_trace(mut self, trace: Trace) -> Self {
        self.trace = trace;
        self
    }

    /// Set the progress update interval
    #[must_use]
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("paths", &self.paths)
            .field("running", &self.registry.len())
            .field("protocols", &self.protocols)
            .field("trace", &self.trace)
            .field("update_interval", &self.update_interval)
            .finish_non_exhaustive()
    }
}
