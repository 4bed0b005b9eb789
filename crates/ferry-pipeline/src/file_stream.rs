//! Local file of a transfer's data phase.
//!
//! A [`FileStream`] is handed to the protocol adapter by
//! [`Pipeline::start_data`]. Every read and write goes through it so that the
//! progress of the transfer is tracked and regularly saved, and so that an
//! I/O failure ends the transfer exactly once.
//!
//! Progress is saved at most once per update interval while data flows, and
//! always when the stream is synced or closed. A resumed transfer restarts at
//! the last saved progress.

use ferry_core::{Machine, TransferColumn, TransferContext, TransferErrorCode, TransferStore};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::error::{PipelineError, Result, file_err_to_transfer_err};
use crate::gate::ErrorGate;
use crate::paths;
use crate::pipeline::Pipeline;
use crate::states::{STREAM_GRAPH, StreamState};
use crate::trace::{ProgressHook, Trace};

/// BLAKE3 hash of a file
///
/// # Errors
///
/// Fails if the file cannot be read.
pub fn file_hash(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(*hasher.finalize().as_bytes())
}

/// File of a transfer, open for its data phase
pub struct FileStream {
    pipeline: Weak<Pipeline>,
    ctx: Arc<TransferContext>,
    store: Arc<dyn TransferStore>,
    trace: Trace,
    machine: Machine<StreamState>,
    direction: StreamState,
    gate: ErrorGate,
    file: Mutex<Option<File>>,
    progress: AtomicU64,
    last_update: Mutex<Instant>,
    update_interval: Duration,
    finished: bool,
}

impl FileStream {
    fn build(pipeline: &Arc<Pipeline>, direction: StreamState, file: Option<File>) -> Self {
        let ctx = Arc::clone(pipeline.context());
        let progress = ctx.transfer().progress;
        Self {
            pipeline: Arc::downgrade(pipeline),
            store: Arc::clone(pipeline.store()),
            trace: pipeline.trace().clone(),
            machine: Machine::new(&STREAM_GRAPH),
            direction,
            gate: ErrorGate::default(),
            finished: file.is_none(),
            file: Mutex::new(file),
            progress: AtomicU64::new(progress),
            last_update: Mutex::new(Instant::now()),
            update_interval: pipeline.update_interval(),
            ctx,
        }
    }

    /// Open the transfer's file at its current progress.
    ///
    /// Send transfers open an existing file and learn its size; receive
    /// transfers create the file (and its directory) if needed.
    pub(crate) fn open(pipeline: &Arc<Pipeline>, direction: StreamState) -> Result<Arc<Self>> {
        let (path, offset) = {
            let trans = pipeline.context().transfer();
            (trans.local_path.clone(), trans.progress)
        };

        let mut file = if direction == StreamState::Reading {
            let file = File::open(&path).map_err(file_err_to_transfer_err)?;
            let size = file.metadata().map_err(file_err_to_transfer_err)?.len();
            pipeline.context().transfer().filesize = Some(size);
            file
        } else {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(file_err_to_transfer_err)?;
            }
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(file_err_to_transfer_err)?
        };

        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(file_err_to_transfer_err)?;
        }

        let stream = Self::build(pipeline, direction, Some(file));
        stream.machine.transition(direction)?;
        tracing::debug!(
            transfer_id = stream.ctx.transfer_id(),
            path = %path.display(),
            offset,
            "File opened"
        );

        Ok(Arc::new(stream))
    }

    /// Stream of a transfer whose data phase is already over: reads return
    /// nothing and writes are discarded.
    pub(crate) fn finished(pipeline: &Arc<Pipeline>, direction: StreamState) -> Arc<Self> {
        let stream = Self::build(pipeline, direction, None);
        if let Err(err) = stream.machine.transition(direction) {
            tracing::warn!("Failed to start a finished stream: {}", err);
        }
        Arc::new(stream)
    }

    /// Bytes transferred so far, including those of previous attempts
    #[must_use]
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.machine.current()
    }

    /// True if the data phase was already over when the stream was created
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Context of the transfer
    #[must_use]
    pub fn context(&self) -> &Arc<TransferContext> {
        &self.ctx
    }

    fn file(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        match self.file().as_mut() {
            Some(file) => f(file),
            None => Err(io::Error::other("file is closed")),
        }
    }

    fn pipeline_error(&self) -> Option<PipelineError> {
        self.pipeline.upgrade()?.stored_error()
    }

    fn state_error(&self, op: &str) -> PipelineError {
        self.pipeline_error().unwrap_or_else(|| {
            PipelineError::internal(format!(
                "cannot {op} a file stream in the {} state",
                self.machine.current()
            ))
        })
    }

    fn expect_state(&self, expected: StreamState, op: &str) -> Result<()> {
        if self.machine.current() == expected {
            Ok(())
        } else {
            Err(self.state_error(op))
        }
    }

    /// Error path of the stream: close the file and fail the pipeline, once
    fn fail(&self, err: PipelineError) -> PipelineError {
        if !self.gate.try_fire() {
            return self.pipeline_error().unwrap_or(err);
        }

        drop(self.file().take());
        if let Err(state_err) = self.machine.transition(StreamState::Error) {
            tracing::debug!("File stream already ended: {}", state_err);
        }

        match self.pipeline.upgrade() {
            Some(pipeline) => pipeline.handle_error(err),
            None => err,
        }
    }

    fn io_error(&self, err: io::Error, details: &'static str) -> io::Error {
        if err.kind() == io::ErrorKind::Interrupted {
            return err;
        }
        self.fail(PipelineError::with_cause(
            TransferErrorCode::Internal,
            details,
            err,
        ))
        .into()
    }

    fn save_progress(&self) -> Result<()> {
        let snapshot = self.ctx.snapshot();
        self.store
            .update_transfer(&snapshot, &[TransferColumn::Progress, TransferColumn::Filesize])
            .map_err(PipelineError::from)
    }

    fn tick(&self) -> Result<()> {
        {
            let mut last = self
                .last_update
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if last.elapsed() < self.update_interval {
                return Ok(());
            }
            *last = Instant::now();
        }
        self.save_progress().map_err(|err| self.fail(err))
    }

    fn add_progress(&self, n: usize, hook: &Option<ProgressHook>) -> Result<()> {
        let n = n as u64;
        let progress = self.progress.fetch_add(n, Ordering::SeqCst) + n;
        {
            let mut trans = self.ctx.transfer();
            trans.progress = trans.progress.max(progress);
        }
        Trace::progress(hook, progress);
        self.tick()
    }

    /// Read from the current position.
    ///
    /// # Errors
    ///
    /// Fails with an internal error, without touching the file, if the
    /// stream is not reading. Any I/O error besides an interruption ends the
    /// transfer.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.expect_state(StreamState::Reading, "read")?;
        if self.finished {
            return Ok(0);
        }

        let n = self
            .with_file(|file| file.read(buf))
            .map_err(|err| self.io_error(err, "failed to read the file"))?;
        self.add_progress(n, &self.trace.on_read)?;
        Ok(n)
    }

    /// Read at `offset` without moving the current position.
    ///
    /// # Errors
    ///
    /// Same as [`FileStream::read`].
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.expect_state(StreamState::Reading, "read")?;
        if self.finished {
            return Ok(0);
        }

        let n = self
            .with_file(|file| {
                let pos = file.stream_position()?;
                file.seek(SeekFrom::Start(offset))?;
                let n = file.read(buf);
                file.seek(SeekFrom::Start(pos))?;
                n
            })
            .map_err(|err| self.io_error(err, "failed to read the file"))?;
        self.add_progress(n, &self.trace.on_read)?;
        Ok(n)
    }

    /// Write at the current position.
    ///
    /// # Errors
    ///
    /// Fails with an internal error, without touching the file, if the
    /// stream is not writing. Any I/O error besides an interruption ends the
    /// transfer.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.expect_state(StreamState::Writing, "write")?;
        if self.finished {
            return Ok(buf.len());
        }

        let n = self
            .with_file(|file| file.write(buf))
            .map_err(|err| self.io_error(err, "failed to write the file"))?;
        self.add_progress(n, &self.trace.on_write)?;
        Ok(n)
    }

    /// Write at `offset` without moving the current position.
    ///
    /// # Errors
    ///
    /// Same as [`FileStream::write`].
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.expect_state(StreamState::Writing, "write")?;
        if self.finished {
            return Ok(buf.len());
        }

        let n = self
            .with_file(|file| {
                let pos = file.stream_position()?;
                file.seek(SeekFrom::Start(offset))?;
                let n = file.write(buf);
                file.seek(SeekFrom::Start(pos))?;
                n
            })
            .map_err(|err| self.io_error(err, "failed to write the file"))?;
        self.add_progress(n, &self.trace.on_write)?;
        Ok(n)
    }

    /// Move the current position. The progress becomes the new position.
    ///
    /// # Errors
    ///
    /// Same as [`FileStream::read`].
    pub fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        self.expect_state(self.direction, "seek")?;
        if self.finished {
            return Ok(self.progress());
        }

        let offset = self
            .with_file(|file| file.seek(pos))
            .map_err(|err| self.io_error(err, "failed to seek in the file"))?;
        self.progress.store(offset, Ordering::SeqCst);
        self.ctx.transfer().progress = offset;
        self.tick()?;
        Ok(offset)
    }

    /// Flush the file to disk and save the progress right away
    ///
    /// # Errors
    ///
    /// Any failure ends the transfer.
    pub fn sync(&self) -> Result<()> {
        self.expect_state(self.direction, "sync")?;
        if self.finished {
            return Ok(());
        }

        self.with_file(|file| file.sync_all()).map_err(|err| {
            self.fail(PipelineError::with_cause(
                TransferErrorCode::Internal,
                "failed to sync the file",
                err,
            ))
        })?;
        *self
            .last_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.save_progress().map_err(|err| self.fail(err))
    }

    /// Compare the BLAKE3 hash of the whole file with `expected`. The
    /// current position is kept.
    ///
    /// # Errors
    ///
    /// A mismatch ends the transfer with an `integrity` error.
    pub fn check_hash(&self, expected: &[u8; 32]) -> Result<()> {
        self.expect_state(self.direction, "check the hash of")?;
        if self.finished {
            return Ok(());
        }
        self.machine
            .transition(StreamState::HashCheck)
            .map_err(|err| self.fail(err.into()))?;

        let hash = self
            .with_file(|file| {
                let pos = file.stream_position()?;
                file.seek(SeekFrom::Start(0))?;
                let mut hasher = blake3::Hasher::new();
                io::copy(file, &mut hasher)?;
                file.seek(SeekFrom::Start(pos))?;
                Ok(hasher.finalize())
            })
            .map_err(|err| {
                self.fail(PipelineError::with_cause(
                    TransferErrorCode::Internal,
                    "failed to compute the file hash",
                    err,
                ))
            })?;

        if hash != *expected {
            return Err(self.fail(PipelineError::new(
                TransferErrorCode::Integrity,
                "file hash does not match",
            )));
        }

        self.machine
            .transition(self.direction)
            .map_err(|err| self.fail(err.into()))?;
        tracing::debug!(transfer_id = self.ctx.transfer_id(), "File hash verified");
        Ok(())
    }

    /// Close the file and save the final progress. An unknown file size
    /// becomes the size of the file.
    pub(crate) fn close(&self) -> Result<()> {
        self.machine
            .transition(StreamState::Close)
            .map_err(|err| self.fail(err.into()))?;
        if self.finished {
            return Ok(());
        }

        let file = self.file().take();
        let Some(file) = file else {
            return Err(self.fail(PipelineError::internal("file is already closed")));
        };
        let size = final_size(&file, self.direction == StreamState::Writing).map_err(|err| {
            self.fail(PipelineError::with_cause(
                TransferErrorCode::Internal,
                "failed to close the file",
                err,
            ))
        })?;
        drop(file);

        {
            let mut trans = self.ctx.transfer();
            trans.progress = self.progress();
            if trans.filesize.is_none() {
                trans.filesize = Some(size);
            }
        }
        self.save_progress().map_err(|err| self.fail(err))?;

        tracing::debug!(
            transfer_id = self.ctx.transfer_id(),
            progress = self.progress(),
            "File closed"
        );
        Trace::fire(&self.trace.on_close);
        Ok(())
    }

    /// Move a received file to its final destination
    pub(crate) fn move_file(&self) -> Result<()> {
        self.machine
            .transition(StreamState::Move)
            .map_err(|err| self.fail(err.into()))?;

        if !self.finished && self.direction == StreamState::Writing {
            let trans = self.ctx.snapshot();
            let dest = paths::final_path(&self.ctx, &trans);

            if trans.local_path != dest {
                move_file(&trans.local_path, &dest).map_err(|err| {
                    self.fail(PipelineError::with_cause(
                        TransferErrorCode::Finalization,
                        "failed to move the received file",
                        err,
                    ))
                })?;

                self.ctx.transfer().local_path = dest.clone();
                let snapshot = self.ctx.snapshot();
                self.store
                    .update_transfer(&snapshot, &[TransferColumn::Paths])
                    .map_err(|err| self.fail(err.into()))?;

                tracing::debug!(
                    transfer_id = trans.id,
                    from = %trans.local_path.display(),
                    to = %dest.display(),
                    "File moved"
                );
            }
            Trace::fire(&self.trace.on_move);
        }

        self.machine
            .transition(StreamState::Done)
            .map_err(|err| self.fail(err.into()))
    }

    /// Stop the stream on behalf of the control plane. The pending and
    /// following operations fail; the stream's own error path is disabled.
    pub(crate) fn stop(&self) {
        self.gate.try_fire();
        drop(self.file().take());
        if let Err(err) = self.machine.transition(StreamState::Error) {
            tracing::debug!("File stream already ended: {}", err);
        }
    }
}

fn final_size(file: &File, sync: bool) -> io::Result<u64> {
    if sync {
        file.sync_all()?;
    }
    Ok(file.metadata()?.len())
}

/// Rename, or copy then remove when the destination is on another device
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(dir) = to.parent() {
        fs::create_dir_all(dir)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

impl Read for &FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FileStream::read(*self, buf)
    }
}

impl Write for &FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileStream::write(*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for &FileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        FileStream::seek(*self, pos)
    }
}
