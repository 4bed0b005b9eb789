//! Transfer pipeline.
//!
//! A [`Pipeline`] drives one transfer through its lifecycle. It owns no
//! thread: the protocol adapter calls the lifecycle methods in order, and the
//! control plane (pause, interrupt, cancel, remote errors) may be called from
//! any other thread at any time.
//!
//! # Lifecycle
//!
//! ```text
//! init ──> pre-tasks ──> pre-tasks done ──> reading/writing ──> data end
//!                                                                  │
//! all done <── end transfer <── post-tasks done <── post-tasks <── data ended
//!
//! any live state ──> error ──> in error
//! ```
//!
//! Every lifecycle method starts with a state transition: calling one out of
//! order returns an internal error and leaves the pipeline untouched.
//!
//! # Error path
//!
//! Local failures, remote errors, pauses, interruptions and cancellations all
//! end the transfer, and only the first of them takes effect. Error-tasks run
//! for failures only.

use ferry_core::{
    Machine, Transfer, TransferColumn, TransferContext, TransferError, TransferErrorCode,
    TransferLimits, TransferStatus, TransferStep, TransferStore, model::unix_now,
};
use std::fs;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::file_stream::FileStream;
use crate::gate::ErrorGate;
use crate::paths;
use crate::registry::PipelineRegistry;
use crate::runner::{Runner, TaskError};
use crate::services::Services;
use crate::states::{PIPELINE_GRAPH, PipelineState, StreamState};
use crate::trace::{Hook, RankHook, Trace};

/// Handler notifying the partner of a pause, interruption or cancellation
pub type InterruptionHandler = Arc<dyn Fn() -> Result<()> + Send + Sync>;

#[derive(Clone, Default)]
struct Handlers {
    pause: Option<InterruptionHandler>,
    interrupt: Option<InterruptionHandler>,
    cancel: Option<InterruptionHandler>,
}

/// Transfer slot, given back when dropped
struct Slot {
    limits: Arc<TransferLimits>,
    is_send: bool,
}

impl Slot {
    fn acquire(limits: &Arc<TransferLimits>, is_send: bool) -> Option<Self> {
        limits.for_direction(is_send).add().then(|| Self {
            limits: Arc::clone(limits),
            is_send,
        })
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.limits.for_direction(self.is_send).sub();
    }
}

/// Orchestrator of one transfer
pub struct Pipeline {
    ctx: Arc<TransferContext>,
    store: Arc<dyn TransferStore>,
    registry: Arc<PipelineRegistry>,
    runner: Box<dyn Runner>,
    trace: Trace,
    machine: Machine<PipelineState>,
    gate: ErrorGate,
    stored_err: Mutex<Option<PipelineError>>,
    stream: Mutex<Option<Arc<FileStream>>>,
    slot: Mutex<Option<Slot>>,
    handlers: RwLock<Handlers>,
    update_interval: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Pipeline {
    /// Create the pipeline of a transfer started by the gateway.
    ///
    /// # Errors
    ///
    /// Fails with `exceeded-limit` when no outgoing slot is left, and with
    /// `internal` if the transfer is a server-side one or cannot be
    /// registered.
    pub fn new_client(services: &Services, transfer: Transfer) -> Result<Arc<Self>> {
        if transfer.is_server() {
            return Err(PipelineError::internal("not a client transfer"));
        }
        Self::new(services, transfer)
    }

    /// Create the pipeline of a transfer started by a partner.
    ///
    /// # Errors
    ///
    /// Same as [`Pipeline::new_client`].
    pub fn new_server(services: &Services, transfer: Transfer) -> Result<Arc<Self>> {
        if !transfer.is_server() {
            return Err(PipelineError::internal("not a server transfer"));
        }
        Self::new(services, transfer)
    }

    fn new(services: &Services, transfer: Transfer) -> Result<Arc<Self>> {
        let id = transfer.id;
        let loaded =
            TransferContext::load(&*services.store, transfer.clone(), services.paths.clone());
        let ctx = match loaded {
            Ok(ctx) => ctx,
            Err(err) => {
                tracing::error!(transfer_id = id, "Failed to load the transfer context: {}", err);
                let err = PipelineError::from(err);
                if id != 0 {
                    record_setup_failure(&*services.store, transfer, &err);
                }
                return Err(err);
            }
        };
        if ctx.transfer().step == TransferStep::ErrorTasks {
            let err = PipelineError::internal(
                "the transfer was interrupted during its error-tasks, its checkpoint is lost",
            );
            tracing::error!(transfer_id = id, "Cannot resume the transfer: {}", err.details());
            if id != 0 {
                record_setup_failure(&*services.store, transfer, &err);
            }
            return Err(err);
        }
        let is_send = ctx.is_send();

        {
            let mut trans = ctx.transfer();
            paths::set_file_paths(&ctx, &mut trans);
            if is_send {
                trans.filesize = fs::metadata(&trans.local_path).ok().map(|m| m.len());
            }
        }

        let Some(slot) = Slot::acquire(&services.limits, is_send) else {
            tracing::warn!(transfer_id = id, is_send, "No transfer slot available");
            return Err(PipelineError::new(
                TransferErrorCode::ExceededLimit,
                "transfer limit reached",
            ));
        };

        {
            let mut trans = ctx.transfer();
            if trans.status == TransferStatus::Available {
                trans.start = unix_now();
            }
            trans.status = TransferStatus::Running;
            if trans.step < TransferStep::Setup {
                trans.step = TransferStep::Setup;
            }
            trans.error = TransferError::default();
        }

        let ctx = Arc::new(ctx);
        let runner = services.runners.runner(&ctx, &services.store);
        let pipeline = Arc::new(Self {
            ctx,
            store: Arc::clone(&services.store),
            registry: Arc::clone(&services.registry),
            runner,
            trace: services.trace.clone(),
            machine: Machine::new(&PIPELINE_GRAPH),
            gate: ErrorGate::default(),
            stored_err: Mutex::new(None),
            stream: Mutex::new(None),
            slot: Mutex::new(Some(slot)),
            handlers: RwLock::new(Handlers::default()),
            update_interval: services.update_interval,
        });

        let inserted = id == 0;
        if inserted {
            let mut trans = pipeline.ctx.snapshot();
            pipeline.store.insert_transfer(&mut trans)?;
            pipeline.ctx.transfer().id = trans.id;
        }

        if let Err(err) = pipeline.registry.add(&pipeline) {
            tracing::error!(
                transfer_id = pipeline.transfer_id(),
                "Failed to register the pipeline: {}",
                err
            );
            if inserted {
                record_setup_failure(&*pipeline.store, pipeline.ctx.snapshot(), &err);
            }
            return Err(err);
        }

        if let Err(err) = pipeline.persist(TransferColumn::ALL.as_slice()) {
            tracing::error!(
                transfer_id = pipeline.transfer_id(),
                "Failed to update the transfer: {}",
                err
            );
            pipeline.registry.remove(pipeline.transfer_id());
            return Err(err);
        }

        let trans = pipeline.ctx.snapshot();
        tracing::debug!(
            transfer_id = trans.id,
            is_send,
            is_server = trans.is_server(),
            path = %trans.local_path.display(),
            "Pipeline initialized"
        );

        Ok(pipeline)
    }

    /// Context of the transfer
    #[must_use]
    pub fn context(&self) -> &Arc<TransferContext> {
        &self.ctx
    }

    /// Identifier of the transfer
    #[must_use]
    pub fn transfer_id(&self) -> i64 {
        self.ctx.transfer_id()
    }

    /// True if the partner started the transfer
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.ctx.is_server()
    }

    /// True if the file is sent to the partner
    #[must_use]
    pub fn is_send(&self) -> bool {
        self.ctx.is_send()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.machine.current()
    }

    /// True once the pipeline reached a terminal state
    #[must_use]
    pub fn has_ended(&self) -> bool {
        self.machine.has_ended()
    }

    /// Error that ended the transfer, if any
    #[must_use]
    pub fn stored_error(&self) -> Option<PipelineError> {
        lock(&self.stored_err).clone()
    }

    /// File stream of the data phase, once started
    #[must_use]
    pub fn stream(&self) -> Option<Arc<FileStream>> {
        lock(&self.stream).clone()
    }

    /// Set the handlers notifying the partner when the transfer is paused,
    /// interrupted or canceled locally
    pub fn set_interruption_handlers(
        &self,
        pause: Option<InterruptionHandler>,
        interrupt: Option<InterruptionHandler>,
        cancel: Option<InterruptionHandler>,
    ) {
        *self.handlers.write().unwrap_or_else(PoisonError::into_inner) = Handlers {
            pause,
            interrupt,
            cancel,
        };
    }

    fn handlers(&self) -> Handlers {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn store(&self) -> &Arc<dyn TransferStore> {
        &self.store
    }

    pub(crate) fn trace(&self) -> &Trace {
        &self.trace
    }

    pub(crate) fn update_interval(&self) -> Duration {
        self.update_interval
    }

    fn persist(&self, columns: &[TransferColumn]) -> Result<()> {
        let snapshot = self.ctx.snapshot();
        self.store
            .update_transfer(&snapshot, columns)
            .map_err(PipelineError::from)
    }

    fn set_step(&self, step: TransferStep) -> Result<()> {
        {
            let mut trans = self.ctx.transfer();
            if trans.step != step {
                trans.step = step;
                trans.task_number = 0;
            }
        }
        self.persist(&[TransferColumn::Step, TransferColumn::TaskNumber])
    }

    /// Transition starting a lifecycle method. Once the transfer has ended,
    /// the error that ended it is returned.
    fn enter(&self, state: PipelineState) -> Result<()> {
        self.machine
            .transition(state)
            .map_err(|err| self.stored_error().unwrap_or_else(|| err.into()))
    }

    /// Transition in the middle of a lifecycle method. A failure means the
    /// control plane ended the transfer meanwhile.
    fn advance(&self, state: PipelineState) -> Result<()> {
        self.machine
            .transition(state)
            .map_err(|err| self.handle_error(err.into()))
    }

    fn run_tasks<F>(
        &self,
        entry: PipelineState,
        done: PipelineState,
        step: TransferStep,
        hook: &Option<RankHook>,
        run: F,
    ) -> Result<()>
    where
        F: FnOnce(&dyn Runner, &dyn Fn(u32)) -> std::result::Result<(), TaskError>,
    {
        self.enter(entry)?;
        let id = self.transfer_id();

        if self.ctx.transfer().step > step {
            tracing::debug!(transfer_id = id, "Skipping {}, already done", entry);
            return self.advance(done);
        }

        self.set_step(step).map_err(|err| self.handle_error(err))?;
        tracing::debug!(transfer_id = id, "Running {}", entry);

        let on_task = |rank: u32| Trace::rank(hook, rank);
        if let Err(err) = run(&*self.runner, &on_task) {
            return Err(self.handle_error(err.into_pipeline_error()));
        }

        self.advance(done)
    }

    /// Run the pre-tasks. Skipped when a previous attempt already ran them.
    ///
    /// # Errors
    ///
    /// Returns the task error (`external-operation` unless the task gave a
    /// code) once the transfer is marked as failed.
    pub fn pre_tasks(&self) -> Result<()> {
        self.run_tasks(
            PipelineState::PreTasks,
            PipelineState::PreTasksDone,
            TransferStep::PreTasks,
            &self.trace.on_pre_task,
            |runner, on_task| runner.pre_tasks(on_task),
        )
    }

    /// Open the local file and start the data phase.
    ///
    /// A transfer resumed past its data phase gets a stream that neither
    /// reads nor writes anything.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened, classified as `file-not-found`,
    /// `forbidden` or `unknown`.
    pub fn start_data(self: &Arc<Self>) -> Result<Arc<FileStream>> {
        let (state, direction) = if self.is_send() {
            (PipelineState::Reading, StreamState::Reading)
        } else {
            (PipelineState::Writing, StreamState::Writing)
        };
        self.enter(state)?;
        let id = self.transfer_id();

        let step = self.ctx.transfer().step;
        let stream = if step > TransferStep::Data {
            tracing::debug!(transfer_id = id, "Data already transferred");
            FileStream::finished(self, direction)
        } else {
            if step < TransferStep::Data {
                {
                    let mut trans = self.ctx.transfer();
                    trans.step = TransferStep::Data;
                    trans.task_number = 0;
                    if !self.ctx.is_send() {
                        trans.local_path = paths::part_path(&trans.local_path);
                    }
                }
                self.persist(&[
                    TransferColumn::Step,
                    TransferColumn::TaskNumber,
                    TransferColumn::Paths,
                ])
                .map_err(|err| self.handle_error(err))?;
            }

            FileStream::open(self, direction).map_err(|err| self.handle_error(err))?
        };

        *lock(&self.stream) = Some(Arc::clone(&stream));
        tracing::debug!(transfer_id = id, progress = stream.progress(), "Data phase started");
        Trace::fire(&self.trace.on_data_start);

        Ok(stream)
    }

    /// Close the file and move it to its final destination
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be closed or moved (`finalization`).
    pub fn end_data(&self) -> Result<()> {
        self.enter(PipelineState::DataEnd)?;

        let Some(stream) = self.stream() else {
            return Err(self.handle_error(PipelineError::internal("no file stream")));
        };
        stream.close()?;
        stream.move_file()?;

        tracing::debug!(transfer_id = self.transfer_id(), "Data phase ended");
        self.advance(PipelineState::DataEnded)
    }

    /// Run the post-tasks. Skipped when a previous attempt already ran them.
    ///
    /// # Errors
    ///
    /// Same as [`Pipeline::pre_tasks`].
    pub fn post_tasks(&self) -> Result<()> {
        self.run_tasks(
            PipelineState::PostTasks,
            PipelineState::PostTasksDone,
            TransferStep::PostTasks,
            &self.trace.on_post_task,
            |runner, on_task| runner.post_tasks(on_task),
        )
    }

    /// Mark the transfer as done and move it to the history.
    ///
    /// A failure here is recorded but never retried automatically: the
    /// partner may already consider the transfer done.
    ///
    /// # Errors
    ///
    /// Fails with `finalization` if the transfer cannot be archived.
    pub fn end_transfer(&self) -> Result<()> {
        self.enter(PipelineState::EndTransfer)?;
        if !self.gate.try_fire() {
            return Err(self
                .stored_error()
                .unwrap_or_else(|| PipelineError::internal("transfer already ended")));
        }

        let id = self.transfer_id();
        self.runner.stop();
        {
            let mut trans = self.ctx.transfer();
            trans.status = TransferStatus::Done;
            trans.step = TransferStep::None;
            trans.task_number = 0;
        }

        match self.archive() {
            Ok(()) => {
                tracing::info!(transfer_id = id, "Transfer ended without errors");
                self.done(PipelineState::AllDone);
                Ok(())
            }
            Err(cause) => {
                let local = !cause.notifies_remote();
                let mut err = PipelineError::with_cause(
                    TransferErrorCode::Finalization,
                    "failed to archive the transfer",
                    cause,
                );
                if local {
                    err = err.local_only();
                }
                tracing::error!(transfer_id = id, "Transfer finalization failed: {}", err);

                self.store_error(err.clone());
                self.enter_error_state();
                {
                    let mut trans = self.ctx.transfer();
                    trans.step = TransferStep::Finalization;
                    trans.error = err.to_transfer_error();
                    trans.remaining_tries = 0;
                }
                self.persist_quietly(&[
                    TransferColumn::Step,
                    TransferColumn::Error,
                    TransferColumn::Retry,
                ]);
                self.run_error_tasks();
                self.finish_with(TransferStatus::Error);

                Err(err)
            }
        }
    }

    /// Change the file name of the transfer and recompute its paths. Must be
    /// called before the data phase.
    ///
    /// # Errors
    ///
    /// Fails with `internal` once the data phase has started, leaving the
    /// transfer untouched, and if the new paths cannot be persisted.
    pub fn rebuild_file_paths(&self, new_name: &str) -> Result<()> {
        let state = self.machine.current();
        if !matches!(
            state,
            PipelineState::Init | PipelineState::PreTasks | PipelineState::PreTasksDone
        ) {
            return Err(PipelineError::internal(format!(
                "cannot rename the file of a transfer in the {state} state"
            )));
        }

        {
            let mut trans = self.ctx.transfer();
            match (trans.is_server(), self.ctx.is_send()) {
                (false, _) => {
                    trans.src_filename = new_name.to_string();
                    trans.dest_filename = new_name.to_string();
                }
                (true, true) => trans.src_filename = new_name.to_string(),
                (true, false) => trans.dest_filename = new_name.to_string(),
            }
            trans.local_path.clear();
            trans.remote_path.clear();
            paths::set_file_paths(&self.ctx, &mut trans);
        }

        self.persist(&[TransferColumn::Filenames, TransferColumn::Paths])
            .map_err(|err| self.handle_error(err))
    }

    /// Fail the transfer because of an error coming from outside the
    /// pipeline: reported by the partner, or raised by the scheduler.
    ///
    /// Runs the error-tasks. Does nothing if the transfer is already ending.
    pub fn set_error(&self, code: TransferErrorCode, details: impl Into<String>) {
        if !self.gate.try_fire() {
            return;
        }

        let code = if code.is_ok() {
            TransferErrorCode::Unknown
        } else {
            code
        };
        // never sent back to the partner
        let err = PipelineError::new(code, details).local_only();
        tracing::error!(
            transfer_id = self.transfer_id(),
            code = %err.code(),
            "Transfer failed: {}",
            err.details()
        );
        self.fail(err);
    }

    /// Fail the transfer because of a local error, then return the error the
    /// caller should report. When the transfer was already ending, that is
    /// the error which ended it.
    pub(crate) fn handle_error(&self, err: PipelineError) -> PipelineError {
        if !self.gate.try_fire() {
            return self.stored_error().unwrap_or(err);
        }

        match err.cause() {
            Some(cause) => tracing::error!(
                transfer_id = self.transfer_id(),
                code = %err.code(),
                "Transfer failed: {} ({})",
                err.details(),
                cause
            ),
            None => tracing::error!(
                transfer_id = self.transfer_id(),
                code = %err.code(),
                "Transfer failed: {}",
                err.details()
            ),
        }
        self.fail(err.clone());
        err
    }

    /// Error path of failures. The gate must be held.
    fn fail(&self, err: PipelineError) {
        self.ctx.transfer().error = err.to_transfer_error();
        self.store_error(err);
        self.enter_error_state();
        self.stop_work();

        self.persist_quietly(&[TransferColumn::Error]);
        self.run_error_tasks();
        self.finish_with(TransferStatus::Error);
    }

    /// Pause the transfer. It can be resumed later. The partner is given
    /// `deadline` to acknowledge the pause.
    ///
    /// # Errors
    ///
    /// Fails if the partner could not be notified in time. The transfer is
    /// paused anyway.
    pub fn pause(&self, deadline: Duration) -> Result<()> {
        let handler = self.handlers().pause;
        self.halt(
            PipelineError::new(TransferErrorCode::Stopped, "transfer paused by user"),
            TransferStatus::Paused,
            handler,
            &self.trace.on_pause,
            deadline,
        )
    }

    /// Interrupt the transfer because the service shuts down. It can be
    /// resumed later.
    ///
    /// # Errors
    ///
    /// Same as [`Pipeline::pause`].
    pub fn interrupt(&self, deadline: Duration) -> Result<()> {
        let handler = self.handlers().interrupt;
        self.halt(
            PipelineError::new(
                TransferErrorCode::ShuttingDown,
                "transfer interrupted by service shutdown",
            ),
            TransferStatus::Interrupted,
            handler,
            &self.trace.on_interruption,
            deadline,
        )
    }

    fn halt(
        &self,
        err: PipelineError,
        status: TransferStatus,
        handler: Option<InterruptionHandler>,
        hook: &Option<Hook>,
        deadline: Duration,
    ) -> Result<()> {
        if !self.gate.try_fire() {
            tracing::debug!(
                transfer_id = self.transfer_id(),
                "Transfer already ending, not {}",
                status
            );
            return Ok(());
        }

        tracing::info!(transfer_id = self.transfer_id(), %status, "{}", err.details());
        Trace::fire(hook);
        self.store_error(err);
        self.enter_error_state();

        let result = self.call_handler(handler, deadline);
        self.stop_work();
        self.finish_with(status);

        result
    }

    /// Cancel the transfer and move it to the history. It cannot be resumed.
    ///
    /// # Errors
    ///
    /// Fails if the partner could not be notified within `deadline` or if the
    /// transfer could not be archived. The transfer is canceled anyway.
    pub fn cancel(&self, deadline: Duration) -> Result<()> {
        if !self.gate.try_fire() {
            tracing::debug!(
                transfer_id = self.transfer_id(),
                "Transfer already ending, not canceled"
            );
            return Ok(());
        }

        let id = self.transfer_id();
        let err = PipelineError::new(TransferErrorCode::Canceled, "transfer canceled by user");
        tracing::info!(transfer_id = id, "{}", err.details());
        self.store_error(err);
        self.enter_error_state();
        Trace::fire(&self.trace.on_cancel);

        let handler = self.handlers().cancel;
        let mut result = self.call_handler(handler, deadline);
        self.stop_work();

        self.ctx.transfer().status = TransferStatus::Cancelled;
        if let Err(err) = self.archive() {
            tracing::error!(transfer_id = id, "Failed to archive the canceled transfer: {}", err);
            self.persist_quietly(&[TransferColumn::Status]);
            result = result.and(Err(err));
        }

        self.done(PipelineState::InError);
        result
    }

    fn call_handler(&self, handler: Option<InterruptionHandler>, deadline: Duration) -> Result<()> {
        let Some(handler) = handler else {
            return Ok(());
        };

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("ferry-notify-{}", self.transfer_id()))
            .spawn(move || {
                let _ = tx.send(handler());
            })
            .map_err(|err| {
                PipelineError::with_cause(
                    TransferErrorCode::Internal,
                    "failed to notify the partner",
                    err,
                )
            })?;

        let result = match rx.recv_timeout(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::internal(
                "timed out while notifying the partner",
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(PipelineError::internal("partner notification aborted"))
            }
        };
        if let Err(err) = &result {
            tracing::warn!(
                transfer_id = self.transfer_id(),
                "Failed to notify the partner: {}",
                err
            );
        }

        result
    }

    fn store_error(&self, err: PipelineError) {
        *lock(&self.stored_err) = Some(err);
    }

    fn enter_error_state(&self) {
        if let Err(err) = self.machine.transition(PipelineState::Error) {
            tracing::warn!(
                transfer_id = self.transfer_id(),
                "Failed to enter the error state: {}",
                err
            );
        }
    }

    /// Stop whatever the pipeline was doing before entering the error state
    fn stop_work(&self) {
        match self.machine.last() {
            PipelineState::PreTasks | PipelineState::PostTasks => self.runner.stop(),
            PipelineState::Reading | PipelineState::Writing | PipelineState::DataEnd => {
                if let Some(stream) = self.stream() {
                    stream.stop();
                }
            }
            _ => {}
        }
    }

    fn persist_quietly(&self, columns: &[TransferColumn]) {
        if let Err(err) = self.persist(columns) {
            tracing::error!(
                transfer_id = self.transfer_id(),
                "Failed to update the transfer: {}",
                err
            );
        }
    }

    /// Run the error-tasks with the step set to `error-tasks`, then restore
    /// the step so that a retry resumes where the transfer failed.
    ///
    /// The `error-tasks` step is never persisted: the stored checkpoint stays
    /// the step that failed, so a crash during the error-tasks cannot make a
    /// retry skip the phases that never completed.
    fn run_error_tasks(&self) {
        let (step, task_number) = {
            let mut trans = self.ctx.transfer();
            let saved = (trans.step, trans.task_number);
            trans.step = TransferStep::ErrorTasks;
            trans.task_number = 0;
            saved
        };

        let on_task = |rank: u32| Trace::rank(&self.trace.on_error_task, rank);
        if let Err(err) = self.runner.error_tasks(&on_task) {
            tracing::error!(
                transfer_id = self.transfer_id(),
                "Error-tasks failed: {}",
                err
            );
        }

        let mut trans = self.ctx.transfer();
        trans.step = step;
        trans.task_number = task_number;
    }

    /// Set the final status of an unfinished transfer and plan its retry
    fn finish_with(&self, status: TransferStatus) {
        let retry = {
            let mut trans = self.ctx.transfer();
            trans.status = status;
            trans.schedule_retry(unix_now()).then_some(trans.next_retry)
        };
        if let Some(Some(at)) = retry {
            tracing::debug!(transfer_id = self.transfer_id(), at, "Retry scheduled");
        }

        self.persist_quietly(&[
            TransferColumn::Status,
            TransferColumn::Progress,
            TransferColumn::Retry,
        ]);
        self.done(PipelineState::InError);
    }

    fn archive(&self) -> Result<()> {
        let entry = self.ctx.history_entry(unix_now());
        self.store
            .archive_transfer(&entry)
            .map_err(PipelineError::from)
    }

    /// Reach a terminal state and give back the registry entry and the slot
    fn done(&self, state: PipelineState) {
        if let Err(err) = self.machine.transition(state) {
            tracing::warn!(
                transfer_id = self.transfer_id(),
                "Failed to reach the {} state: {}",
                state,
                err
            );
        }

        self.registry.remove(self.transfer_id());
        drop(lock(&self.slot).take());
        Trace::fire(&self.trace.on_transfer_end);
    }
}

/// Record a pipeline that could not be created
fn record_setup_failure(store: &dyn TransferStore, mut transfer: Transfer, err: &PipelineError) {
    transfer.status = TransferStatus::Error;
    transfer.error = err.to_transfer_error();
    if let Err(db_err) = store.update_transfer(
        &transfer,
        &[TransferColumn::Status, TransferColumn::Error],
    ) {
        tracing::error!(
            transfer_id = transfer.id,
            "Failed to record the transfer error: {}",
            db_err
        );
    }
}
