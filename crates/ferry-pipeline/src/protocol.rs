//! Contracts between the pipelines and the protocol implementations.
//!
//! A protocol provides a [`Client`] for the transfers started by the gateway,
//! and a [`Partner`] for each transfer started by a partner. Optional
//! capabilities are discovered at run time through the `as_*` probes: a
//! protocol able to run the partner's tasks in lockstep implements
//! [`PreTasksHandler`], one with a dedicated pause message implements
//! [`PauseHandler`], and so on. Protocols without them get the generic
//! behavior, usually an error notification.

use ferry_core::{TransferContext, TransferErrorCode};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{PipelineError, ProtocolError, wrap_remote_error};
use crate::file_stream::FileStream;
use crate::pipeline::{InterruptionHandler, Pipeline};

/// Result of a protocol operation
pub type ProtocolResult<T = ()> = std::result::Result<T, ProtocolError>;

/// Partner of a transfer, as seen by the control plane.
///
/// Methods take `&self`: the control plane may notify the partner from
/// another thread while data is flowing.
pub trait Partner: Send + Sync {
    /// Tell the partner the transfer failed. Best effort: failures are only
    /// logged.
    fn send_error(&self, code: TransferErrorCode, details: &str);

    /// Dedicated pause notification, if supported
    fn as_pause_handler(&self) -> Option<&dyn PauseHandler> {
        None
    }

    /// Dedicated cancel notification, if supported
    fn as_cancel_handler(&self) -> Option<&dyn CancelHandler> {
        None
    }
}

/// Client side of a transfer
pub trait Client: Partner {
    /// Connect to the partner and ask for the transfer
    fn request(&self) -> ProtocolResult;

    /// Send the file of a push transfer
    fn send(&self, file: &FileStream) -> ProtocolResult;

    /// Receive the file of a pull transfer
    fn receive(&self, file: &FileStream) -> ProtocolResult;

    /// Tell the partner the transfer is over
    fn end_transfer(&self) -> ProtocolResult;

    /// Lockstep pre-tasks, if supported
    fn as_pre_tasks_handler(&self) -> Option<&dyn PreTasksHandler> {
        None
    }

    /// Lockstep post-tasks, if supported
    fn as_post_tasks_handler(&self) -> Option<&dyn PostTasksHandler> {
        None
    }
}

/// Runs the partner's pre-tasks around the local ones
pub trait PreTasksHandler {
    /// Ask the partner to run its pre-tasks
    fn begin_pre_tasks(&self) -> ProtocolResult;
    /// Wait for the partner's pre-tasks to end
    fn end_pre_tasks(&self) -> ProtocolResult;
}

/// Runs the partner's post-tasks around the local ones
pub trait PostTasksHandler {
    /// Ask the partner to run its post-tasks
    fn begin_post_tasks(&self) -> ProtocolResult;
    /// Wait for the partner's post-tasks to end
    fn end_post_tasks(&self) -> ProtocolResult;
}

/// Tells the partner the transfer is paused
pub trait PauseHandler {
    /// Notify the partner
    fn pause(&self) -> ProtocolResult;
}

/// Tells the partner the transfer is canceled
pub trait CancelHandler {
    /// Notify the partner
    fn cancel(&self) -> ProtocolResult;
}

/// Creates the [`Client`] of each client transfer of a protocol
pub trait ClientFactory: Send + Sync {
    /// Name of the protocol
    fn protocol(&self) -> &str;

    /// Client for the transfer of `ctx`
    fn new_client(&self, ctx: &Arc<TransferContext>) -> ProtocolResult<Arc<dyn Client>>;
}

/// Client factories by protocol name
#[derive(Clone, Default)]
pub struct Protocols {
    factories: HashMap<String, Arc<dyn ClientFactory>>,
}

impl Protocols {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a protocol, replacing any previous one with the same name
    #[must_use]
    pub fn with(mut self, factory: impl ClientFactory + 'static) -> Self {
        self.factories
            .insert(factory.protocol().to_string(), Arc::new(factory));
        self
    }

    /// Factory of a protocol
    #[must_use]
    pub fn get(&self, protocol: &str) -> Option<Arc<dyn ClientFactory>> {
        self.factories.get(protocol).cloned()
    }
}

impl fmt::Debug for Protocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_tuple("Protocols").field(&names).finish()
    }
}

/// Install the handlers telling `partner` about local pauses, interruptions
/// and cancellations. Without a dedicated handler the partner gets an error.
pub(crate) fn install_handlers<P>(pipeline: &Pipeline, partner: &Arc<P>)
where
    P: Partner + ?Sized + 'static,
{
    let pause: InterruptionHandler = {
        let partner = Arc::clone(partner);
        Arc::new(move || match partner.as_pause_handler() {
            Some(handler) => handler
                .pause()
                .map_err(|err| wrap_remote_error("failed to pause remote transfer", err)),
            None => {
                partner.send_error(TransferErrorCode::Stopped, "transfer paused by user");
                Ok(())
            }
        })
    };
    let interrupt: InterruptionHandler = {
        let partner = Arc::clone(partner);
        Arc::new(move || {
            partner.send_error(
                TransferErrorCode::ShuttingDown,
                "transfer interrupted by service shutdown",
            );
            Ok(())
        })
    };
    let cancel: InterruptionHandler = {
        let partner = Arc::clone(partner);
        Arc::new(move || match partner.as_cancel_handler() {
            Some(handler) => handler
                .cancel()
                .map_err(|err| wrap_remote_error("failed to cancel remote transfer", err)),
            None => {
                partner.send_error(TransferErrorCode::Canceled, "transfer canceled by user");
                Ok(())
            }
        })
    };

    pipeline.set_interruption_handlers(Some(pause), Some(interrupt), Some(cancel));
}

/// Forward a local failure to the partner, then give the error back.
///
/// Local-only errors are kept to ourselves, and interruptions were already
/// announced by their handler.
pub(crate) fn notify<P>(partner: &P, err: PipelineError) -> PipelineError
where
    P: Partner + ?Sized,
{
    let announced = matches!(
        err.code(),
        TransferErrorCode::Stopped | TransferErrorCode::ShuttingDown | TransferErrorCode::Canceled
    );
    if err.notifies_remote() && !announced {
        partner.send_error(err.code(), err.details());
    }
    err
}
