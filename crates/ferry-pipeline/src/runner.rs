//! Task execution.
//!
//! The pipeline runs pre-, post- and error-tasks through the [`Runner`]
//! contract. [`TaskChainRunner`] is the implementation shipped with the
//! gateway: each rule has ordered chains of [`Task`]s, run one after the other
//! with their rank. A chain interrupted by a crash resumes at the task rank
//! persisted in the transfer.

use ferry_core::{TransferColumn, TransferContext, TransferError, TransferErrorCode, TransferStore};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::error::{BoxedError, PipelineError};

/// Failure of a task or of a whole chain
#[derive(Debug, Error)]
#[error("{details}")]
pub struct TaskError {
    /// Specific error code. `None` means `external-operation`.
    pub code: Option<TransferErrorCode>,
    /// Remote-safe message
    pub details: String,
    /// Local cause
    #[source]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl TaskError {
    /// Create a task error without a specific code
    #[must_use]
    pub fn new(details: impl Into<String>) -> Self {
        Self {
            code: None,
            details: details.into(),
            cause: None,
        }
    }

    /// Create a task error with a specific code
    #[must_use]
    pub fn with_code(code: TransferErrorCode, details: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            details: details.into(),
            cause: None,
        }
    }

    /// Create a warning: the chain logs it and goes on
    #[must_use]
    pub fn warning(details: impl Into<String>) -> Self {
        Self::with_code(TransferErrorCode::Warning, details)
    }

    /// Attach a local cause
    #[must_use]
    pub fn caused_by(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// True for warnings
    #[must_use]
    pub fn is_warning(&self) -> bool {
        self.code == Some(TransferErrorCode::Warning)
    }

    /// Pipeline error of a failed chain. Missing (or `ok`) codes become
    /// `external-operation`.
    #[must_use]
    pub fn into_pipeline_error(self) -> PipelineError {
        let code = match self.code {
            Some(code) if !code.is_ok() => code,
            _ => TransferErrorCode::ExternalOperation,
        };
        match self.cause {
            Some(cause) => PipelineError::with_cause(code, self.details, BoxedError(cause)),
            None => PipelineError::new(code, self.details),
        }
    }
}

/// Task execution contract of the pipeline.
///
/// The rank hook must be called before each task with the task's rank.
/// [`Runner::stop`] may be called from another thread while a chain runs; the
/// chain should then return promptly.
pub trait Runner: Send + Sync {
    /// Run the pre-tasks
    fn pre_tasks(&self, on_task: &dyn Fn(u32)) -> Result<(), TaskError>;

    /// Run the post-tasks
    fn post_tasks(&self, on_task: &dyn Fn(u32)) -> Result<(), TaskError>;

    /// Run the error-tasks
    fn error_tasks(&self, on_task: &dyn Fn(u32)) -> Result<(), TaskError>;

    /// Ask the running chain to stop
    fn stop(&self);
}

/// Creates the runner of each new pipeline
pub trait RunnerFactory: Send + Sync {
    /// Runner for the transfer of `ctx`
    fn runner(&self, ctx: &Arc<TransferContext>, store: &Arc<dyn TransferStore>)
    -> Box<dyn Runner>;
}

impl<F> RunnerFactory for F
where
    F: Fn(&Arc<TransferContext>, &Arc<dyn TransferStore>) -> Box<dyn Runner> + Send + Sync,
{
    fn runner(
        &self,
        ctx: &Arc<TransferContext>,
        store: &Arc<dyn TransferStore>,
    ) -> Box<dyn Runner> {
        self(ctx, store)
    }
}

/// Runner without any task
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRunner;

impl Runner for NoopRunner {
    fn pre_tasks(&self, _on_task: &dyn Fn(u32)) -> Result<(), TaskError> {
        Ok(())
    }

    fn post_tasks(&self, _on_task: &dyn Fn(u32)) -> Result<(), TaskError> {
        Ok(())
    }

    fn error_tasks(&self, _on_task: &dyn Fn(u32)) -> Result<(), TaskError> {
        Ok(())
    }

    fn stop(&self) {}
}

impl RunnerFactory for NoopRunner {
    fn runner(
        &self,
        _ctx: &Arc<TransferContext>,
        _store: &Arc<dyn TransferStore>,
    ) -> Box<dyn Runner> {
        Box::new(NoopRunner)
    }
}

/// Stop flag shared between a runner and its tasks
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    /// Create an unset signal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal and wake every waiter
    pub fn stop(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    /// True once [`StopSignal::stop`] was called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `timeout` or until the signal is set. Returns true if the
    /// signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }
}

/// One action of a task chain
pub trait Task: Send + Sync {
    /// Name, used in logs
    fn name(&self) -> &str;

    /// Run the task. Long tasks should poll `stop` and return early once it
    /// is set.
    fn run(&self, ctx: &TransferContext, stop: &StopSignal) -> Result<(), TaskError>;
}

/// Task built from a closure
pub struct FnTask<F> {
    name: String,
    f: F,
}

impl<F> FnTask<F>
where
    F: Fn(&TransferContext, &StopSignal) -> Result<(), TaskError> + Send + Sync,
{
    /// Wrap a closure
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Task for FnTask<F>
where
    F: Fn(&TransferContext, &StopSignal) -> Result<(), TaskError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &TransferContext, stop: &StopSignal) -> Result<(), TaskError> {
        (self.f)(ctx, stop)
    }
}

/// Task chains of a rule
#[derive(Clone, Default)]
pub struct TaskChains {
    /// Run before the data transfer
    pub pre: Vec<Arc<dyn Task>>,
    /// Run after the data transfer
    pub post: Vec<Arc<dyn Task>>,
    /// Run when the transfer fails
    pub error: Vec<Arc<dyn Task>>,
}

impl fmt::Debug for TaskChains {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |chain: &[Arc<dyn Task>]| -> Vec<String> {
            chain.iter().map(|t| t.name().to_string()).collect()
        };
        f.debug_struct("TaskChains")
            .field("pre", &names(&self.pre))
            .field("post", &names(&self.post))
            .field("error", &names(&self.error))
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Chain {
    Pre,
    Post,
    Error,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Chain::Pre => "pre-tasks",
            Chain::Post => "post-tasks",
            Chain::Error => "error-tasks",
        })
    }
}

/// Runner executing the task chains of the transfer's rule
pub struct TaskChainRunner {
    ctx: Arc<TransferContext>,
    store: Arc<dyn TransferStore>,
    chains: Arc<TaskChains>,
    stop: StopSignal,
}

impl TaskChainRunner {
    /// Create a runner for one transfer
    #[must_use]
    pub fn new(
        ctx: Arc<TransferContext>,
        store: Arc<dyn TransferStore>,
        chains: Arc<TaskChains>,
    ) -> Self {
        Self {
            ctx,
            store,
            chains,
            stop: StopSignal::new(),
        }
    }

    fn run_chain(&self, chain: Chain, on_task: &dyn Fn(u32)) -> Result<(), TaskError> {
        let tasks = match chain {
            Chain::Pre => &self.chains.pre,
            Chain::Post => &self.chains.post,
            Chain::Error => &self.chains.error,
        };
        let first = self.ctx.transfer().task_number as usize;
        let id = self.ctx.transfer_id();
        // error-tasks run after the other chains were stopped
        let stop = match chain {
            Chain::Error => StopSignal::new(),
            Chain::Pre | Chain::Post => self.stop.clone(),
        };

        for (rank, task) in tasks.iter().enumerate().skip(first) {
            if stop.is_stopped() {
                return Err(TaskError::with_code(
                    TransferErrorCode::Stopped,
                    format!("{chain} stopped"),
                ));
            }

            let rank = u32::try_from(rank).unwrap_or(u32::MAX);
            let snapshot = {
                let mut trans = self.ctx.transfer();
                trans.task_number = rank;
                trans.clone()
            };
            // the stored task number belongs to the step that failed
            if !matches!(chain, Chain::Error) {
                self.store
                    .update_transfer(&snapshot, &[TransferColumn::TaskNumber])
                    .map_err(|e| {
                        TaskError::with_code(TransferErrorCode::Internal, "database error")
                            .caused_by(e)
                    })?;
            }

            on_task(rank);
            tracing::debug!(transfer_id = id, %chain, rank, task = task.name(), "Running task");

            match task.run(&self.ctx, &stop) {
                Ok(()) => {}
                Err(err) if err.is_warning() => {
                    tracing::warn!(
                        transfer_id = id,
                        %chain,
                        rank,
                        task = task.name(),
                        "Task ended with a warning: {}",
                        err
                    );
                    let snapshot = {
                        let mut trans = self.ctx.transfer();
                        trans.error = TransferError::new(TransferErrorCode::Warning, err.details);
                        trans.clone()
                    };
                    if let Err(e) = self.store.update_transfer(&snapshot, &[TransferColumn::Error]) {
                        tracing::warn!(transfer_id = id, "Failed to record task warning: {}", e);
                    }
                }
                Err(mut err) => {
                    tracing::error!(
                        transfer_id = id,
                        %chain,
                        rank,
                        task = task.name(),
                        "Task failed: {}",
                        err
                    );
                    err.details = format!("task {} @ {rank} failed: {}", task.name(), err.details);
                    return Err(err);
                }
            }
        }

        Ok(())
    }
}

impl Runner for TaskChainRunner {
    fn pre_tasks(&self, on_task: &dyn Fn(u32)) -> Result<(), TaskError> {
        self.run_chain(Chain::Pre, on_task)
    }

    fn post_tasks(&self, on_task: &dyn Fn(u32)) -> Result<(), TaskError> {
        self.run_chain(Chain::Post, on_task)
    }

    fn error_tasks(&self, on_task: &dyn Fn(u32)) -> Result<(), TaskError> {
        self.run_chain(Chain::Error, on_task)
    }

    fn stop(&self) {
        self.stop.stop();
    }
}

/// Factory handing out a [`TaskChainRunner`] with the chains of each rule.
/// Rules without chains run no task.
#[derive(Debug, Default, Clone)]
pub struct TaskChainFactory {
    rules: HashMap<i64, Arc<TaskChains>>,
}

impl TaskChainFactory {
    /// Create a factory without any chain
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chains of a rule
    #[must_use]
    pub fn with_rule(mut self, rule_id: i64, chains: TaskChains) -> Self {
        self.rules.insert(rule_id, Arc::new(chains));
        self
    }
}

impl RunnerFactory for TaskChainFactory {
    fn runner(
        &self,
        ctx: &Arc<TransferContext>,
        store: &Arc<dyn TransferStore>,
    ) -> Box<dyn Runner> {
        let chains = self
            .rules
            .get(&ctx.rule.id)
            .cloned()
            .unwrap_or_default();
        Box::new(TaskChainRunner::new(
            Arc::clone(ctx),
            Arc::clone(store),
            chains,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{MemoryStore, PathsConfig, Rule, Transfer};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Instant;

    fn setup() -> (Arc<TransferContext>, Arc<dyn TransferStore>) {
        let store = MemoryStore::new();
        let rule_id = store
            .insert_rule(Rule {
                name: "rule".to_string(),
                is_send: true,
                ..Rule::default()
            })
            .unwrap();
        let mut trans = Transfer {
            rule_id,
            local_account_id: Some(1),
            src_filename: "f".to_string(),
            ..Transfer::default()
        };
        store.insert_transfer(&mut trans).unwrap();
        let rule = store.get_rule(rule_id).unwrap();
        let ctx = Arc::new(TransferContext::new(trans, rule, PathsConfig::default()));
        (ctx, Arc::new(store))
    }

    fn counting(name: &str, counter: &Arc<AtomicU32>) -> Arc<dyn Task> {
        let counter = Arc::clone(counter);
        Arc::new(FnTask::new(name, move |_: &TransferContext, _: &StopSignal| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    fn failing(code: Option<TransferErrorCode>) -> Arc<dyn Task> {
        Arc::new(FnTask::new("fail", move |_: &TransferContext, _: &StopSignal| {
            Err(TaskError {
                code,
                details: "boom".to_string(),
                cause: None,
            })
        }))
    }

    #[test]
    fn test_chain_runs_in_order_with_ranks() {
        let (ctx, store) = setup();
        let counter = Arc::new(AtomicU32::new(0));
        let chains = TaskChains {
            pre: vec![counting("a", &counter), counting("b", &counter)],
            ..TaskChains::default()
        };
        let runner = TaskChainRunner::new(Arc::clone(&ctx), store, Arc::new(chains));

        let ranks = Mutex::new(Vec::new());
        runner
            .pre_tasks(&|rank| ranks.lock().unwrap().push(rank))
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(*ranks.lock().unwrap(), vec![0, 1]);
        assert_eq!(ctx.transfer().task_number, 1);
    }

    #[test]
    fn test_chain_resumes_at_task_number() {
        let (ctx, store) = setup();
        let counter = Arc::new(AtomicU32::new(0));
        let chains = TaskChains {
            post: vec![
                counting("a", &counter),
                counting("b", &counter),
                counting("c", &counter),
            ],
            ..TaskChains::default()
        };
        ctx.transfer().task_number = 2;
        let runner = TaskChainRunner::new(Arc::clone(&ctx), store, Arc::new(chains));

        runner.post_tasks(&|_| {}).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_stops_chain() {
        let (ctx, store) = setup();
        let counter = Arc::new(AtomicU32::new(0));
        let chains = TaskChains {
            pre: vec![failing(None), counting("after", &counter)],
            ..TaskChains::default()
        };
        let runner = TaskChainRunner::new(ctx, store, Arc::new(chains));

        let err = runner.pre_tasks(&|_| {}).unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(err.details.contains("boom"));
        assert_eq!(
            err.into_pipeline_error().code(),
            TransferErrorCode::ExternalOperation
        );
    }

    #[test]
    fn test_specific_code_kept() {
        let err = TaskError::with_code(TransferErrorCode::BadSize, "quota");
        assert_eq!(err.into_pipeline_error().code(), TransferErrorCode::BadSize);
    }

    #[test]
    fn test_warning_does_not_stop_chain() {
        let (ctx, store) = setup();
        let counter = Arc::new(AtomicU32::new(0));
        let chains = TaskChains {
            pre: vec![
                failing(Some(TransferErrorCode::Warning)),
                counting("after", &counter),
            ],
            ..TaskChains::default()
        };
        let runner = TaskChainRunner::new(Arc::clone(&ctx), store, Arc::new(chains));

        runner.pre_tasks(&|_| {}).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.transfer().error.code, TransferErrorCode::Warning);
    }

    #[test]
    fn test_stop_signal_is_shared() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_stopped());
        assert!(!clone.wait_timeout(Duration::from_millis(1)));

        signal.stop();

        assert!(clone.is_stopped());
        assert!(clone.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn test_error_chain_leaves_stored_task_number() {
        let (ctx, store) = setup();
        let counter = Arc::new(AtomicU32::new(0));
        let chains = TaskChains {
            error: vec![counting("a", &counter), counting("b", &counter)],
            ..TaskChains::default()
        };
        {
            let mut trans = ctx.transfer();
            trans.task_number = 4;
            store
                .update_transfer(&trans, &[TransferColumn::TaskNumber])
                .unwrap();
            trans.task_number = 0;
        }
        let runner = TaskChainRunner::new(Arc::clone(&ctx), Arc::clone(&store), Arc::new(chains));

        runner.error_tasks(&|_| {}).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(store.get_transfer(ctx.transfer_id()).unwrap().task_number, 4);
    }

    #[test]
    fn test_stop_interrupts_long_task() {
        let (ctx, store) = setup();
        let waiting: Arc<dyn Task> = Arc::new(FnTask::new(
            "wait",
            |_: &TransferContext, stop: &StopSignal| {
                if stop.wait_timeout(Duration::from_secs(30)) {
                    Err(TaskError::with_code(TransferErrorCode::Stopped, "stopped"))
                } else {
                    Ok(())
                }
            },
        ));
        let chains = TaskChains {
            pre: vec![waiting],
            ..TaskChains::default()
        };
        let runner = Arc::new(TaskChainRunner::new(ctx, store, Arc::new(chains)));

        let stopper = {
            let runner = Arc::clone(&runner);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                runner.stop();
            })
        };

        let start = Instant::now();
        let err = runner.pre_tasks(&|_| {}).unwrap_err();
        stopper.join().unwrap();

        assert_eq!(err.code, Some(TransferErrorCode::Stopped));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_error_chain_ignores_stop() {
        let (ctx, store) = setup();
        let counter = Arc::new(AtomicU32::new(0));
        let chains = TaskChains {
            pre: vec![counting("pre", &counter)],
            error: vec![counting("err", &counter)],
            ..TaskChains::default()
        };
        let runner = TaskChainRunner::new(ctx, store, Arc::new(chains));
        runner.stop();

        assert!(runner.pre_tasks(&|_| {}).is_err());
        runner.error_tasks(&|_| {}).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_factory_uses_rule_chains() {
        let (ctx, store) = setup();
        let counter = Arc::new(AtomicU32::new(0));
        let factory = TaskChainFactory::new().with_rule(
            ctx.rule.id,
            TaskChains {
                error: vec![counting("err", &counter)],
                ..TaskChains::default()
            },
        );

        let runner = factory.runner(&ctx, &store);
        runner.error_tasks(&|_| {}).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let other = TaskChainFactory::new().runner(&ctx, &store);
        other.error_tasks(&|_| {}).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
