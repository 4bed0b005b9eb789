//! Pipeline errors.
//!
//! A [`PipelineError`] carries a [`TransferErrorCode`], a message that is safe
//! to send to the partner, and optionally the local cause, which is only ever
//! logged.

use ferry_core::{StateError, StoreError, TransferError, TransferErrorCode};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Error of a transfer pipeline
#[derive(Debug, Clone, Error)]
#[error("{code}: {details}")]
pub struct PipelineError {
    code: TransferErrorCode,
    details: String,
    #[source]
    cause: Option<Arc<dyn StdError + Send + Sync>>,
    notify_remote: bool,
}

impl PipelineError {
    /// Create an error from a plain message.
    ///
    /// # Panics
    ///
    /// Panics if `code` is [`TransferErrorCode::Ok`]: an error must always
    /// carry an error code.
    #[must_use]
    #[track_caller]
    pub fn new(code: TransferErrorCode, details: impl Into<String>) -> Self {
        assert!(
            !code.is_ok(),
            "a pipeline error cannot be created with the \"ok\" code"
        );

        Self {
            code,
            details: details.into(),
            cause: None,
            notify_remote: true,
        }
    }

    /// Create an error from a local cause. Only `details` is ever sent to
    /// the partner.
    ///
    /// # Panics
    ///
    /// Panics if `code` is [`TransferErrorCode::Ok`].
    #[must_use]
    #[track_caller]
    pub fn with_cause<E>(code: TransferErrorCode, details: impl Into<String>, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let mut err = Self::new(code, details);
        err.cause = Some(Arc::new(cause));
        err
    }

    /// Create an internal error
    #[must_use]
    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(TransferErrorCode::Internal, details)
    }

    /// Error code
    #[must_use]
    pub fn code(&self) -> TransferErrorCode {
        self.code
    }

    /// Remote-safe message
    #[must_use]
    pub fn details(&self) -> &str {
        &self.details
    }

    /// Local cause, if any
    #[must_use]
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Mark the error as purely local: the partner will not be notified.
    #[must_use]
    pub fn local_only(mut self) -> Self {
        self.notify_remote = false;
        self
    }

    /// False for errors that must only be recorded locally (the gateway
    /// lost its own database, for instance)
    #[must_use]
    pub fn notifies_remote(&self) -> bool {
        self.notify_remote
    }

    /// Persisted form of the error
    #[must_use]
    pub fn to_transfer_error(&self) -> TransferError {
        TransferError::new(self.code, self.details.clone())
    }

    /// Pipeline error wrapped in an I/O error returned by a
    /// [`FileStream`](crate::FileStream)
    #[must_use]
    pub fn from_io(err: &io::Error) -> Option<Self> {
        err.get_ref()?.downcast_ref::<Self>().cloned()
    }
}

impl From<PipelineError> for io::Error {
    fn from(err: PipelineError) -> Self {
        io::Error::other(err)
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        let local = err.is_connection_loss();
        let err = PipelineError::with_cause(TransferErrorCode::Internal, "database error", err);
        if local { err.local_only() } else { err }
    }
}

impl From<StateError> for PipelineError {
    fn from(err: StateError) -> Self {
        PipelineError::new(TransferErrorCode::Internal, err.to_string())
    }
}

impl From<TransferError> for PipelineError {
    /// Convert a persisted error. An `Ok` error becomes an `Unknown` one.
    fn from(err: TransferError) -> Self {
        let code = if err.code.is_ok() {
            TransferErrorCode::Unknown
        } else {
            err.code
        };
        PipelineError::new(code, err.details)
    }
}

/// Classify a filesystem error.
///
/// Only three outcomes are possible: `file-not-found`, `forbidden`, or
/// `unknown`. The original error is kept as the cause.
#[must_use]
pub fn file_err_to_transfer_err(err: io::Error) -> PipelineError {
    match err.kind() {
        io::ErrorKind::NotFound => {
            PipelineError::with_cause(TransferErrorCode::FileNotFound, "file not found", err)
        }
        io::ErrorKind::PermissionDenied => PipelineError::with_cause(
            TransferErrorCode::Forbidden,
            "file operation not allowed",
            err,
        ),
        _ => PipelineError::with_cause(TransferErrorCode::Unknown, "file operation failed", err),
    }
}

/// Error returned by protocol implementations
pub type ProtocolError = Box<dyn StdError + Send + Sync>;

/// Pipeline error of a failed protocol operation.
///
/// Errors that already are pipeline errors (possibly wrapped in an I/O error
/// by a [`FileStream`](crate::FileStream)) are kept as is, anything else
/// becomes an `unknown-remote` error.
#[must_use]
pub fn wrap_remote_error(details: &str, err: ProtocolError) -> PipelineError {
    let err = match err.downcast::<PipelineError>() {
        Ok(err) => return *err,
        Err(err) => err,
    };
    match err.downcast::<io::Error>() {
        Ok(io_err) => match PipelineError::from_io(&io_err) {
            Some(err) => err,
            None => PipelineError::with_cause(TransferErrorCode::UnknownRemote, details, *io_err),
        },
        Err(err) => {
            PipelineError::with_cause(TransferErrorCode::UnknownRemote, details, BoxedError(err))
        }
    }
}

/// Boxed error usable as a cause
#[derive(Debug)]
pub(crate) struct BoxedError(pub(crate) ProtocolError);

impl fmt::Display for BoxedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl StdError for BoxedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
