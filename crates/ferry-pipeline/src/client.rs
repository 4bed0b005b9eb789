//! Client transfers.
//!
//! A [`ClientPipeline`] pairs a [`Pipeline`] with the protocol [`Client`] of
//! the transfer and runs the whole transfer, from the request to the
//! partner to the archiving of the record.

use ferry_core::{Transfer, TransferErrorCode};
use std::sync::Arc;

use crate::error::{BoxedError, PipelineError, ProtocolError, Result, wrap_remote_error};
use crate::pipeline::Pipeline;
use crate::protocol::{self, Client};
use crate::services::Services;

/// Transfer started by the gateway
pub struct ClientPipeline {
    pipeline: Arc<Pipeline>,
    client: Arc<dyn Client>,
}

impl ClientPipeline {
    /// Create the pipeline of a client transfer and its protocol client.
    ///
    /// # Errors
    ///
    /// Fails like [`Pipeline::new_client`], or if no client exists for the
    /// transfer's protocol or it cannot be created. In the latter cases the
    /// transfer is marked as failed.
    pub fn new(services: &Services, transfer: Transfer) -> Result<Self> {
        let pipeline = Pipeline::new_client(services, transfer)?;
        let ctx = Arc::clone(pipeline.context());

        let protocol = ctx
            .client
            .as_ref()
            .map_or_else(|| ctx.protocol().to_string(), |c| c.protocol.clone());
        let Some(factory) = services.protocols.get(&protocol) else {
            return Err(pipeline.handle_error(PipelineError::internal(format!(
                "no client found for protocol \"{protocol}\""
            ))));
        };

        let client = factory.new_client(&ctx).map_err(|err| {
            let err = match err.downcast::<PipelineError>() {
                Ok(err) => *err,
                Err(err) => PipelineError::with_cause(
                    TransferErrorCode::Internal,
                    "failed to initialize the transfer client",
                    BoxedError(err),
                ),
            };
            pipeline.handle_error(err)
        })?;

        protocol::install_handlers(&pipeline, &client);

        let trans = ctx.snapshot();
        let partner = ctx.remote_agent.as_ref().map_or("", |a| a.name.as_str());
        let login = ctx.remote_account.as_ref().map_or("", |a| a.login.as_str());
        if ctx.is_send() {
            tracing::info!(
                transfer_id = trans.id,
                "Starting upload of file {:?} to {:?} as {:?} using rule {:?}",
                trans.local_path,
                partner,
                login,
                ctx.rule.name
            );
        } else {
            tracing::info!(
                transfer_id = trans.id,
                "Starting download of file {:?} from {:?} as {:?} using rule {:?}",
                trans.remote_path,
                partner,
                login,
                ctx.rule.name
            );
        }

        Ok(Self { pipeline, client })
    }

    /// Underlying pipeline
    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Run the whole transfer. Failures are recorded on the transfer before
    /// being returned.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the transfer.
    pub fn run(&self) -> Result<()> {
        self.client
            .request()
            .map_err(|err| self.remote_failure("transfer request failed", err))?;

        self.pre_tasks()?;

        let file = self.pipeline.start_data().map_err(|err| self.notify(err))?;
        let sent = if self.pipeline.is_send() {
            self.client
                .send(&file)
                .map_err(|err| ("file sending failed", err))
        } else {
            self.client
                .receive(&file)
                .map_err(|err| ("file reception failed", err))
        };
        if let Err((details, err)) = sent {
            // a local stream failure already ended the transfer
            return Err(match self.pipeline.stored_error() {
                Some(stored) => self.notify(stored),
                None => self.remote_failure(details, err),
            });
        }

        self.pipeline.end_data().map_err(|err| self.notify(err))?;

        self.post_tasks()?;

        self.client
            .end_transfer()
            .map_err(|err| self.remote_failure("transfer finalization failed", err))?;

        self.pipeline.end_transfer()
    }

    fn pre_tasks(&self) -> Result<()> {
        let Some(handler) = self.client.as_pre_tasks_handler() else {
            return self.pipeline.pre_tasks().map_err(|err| self.notify(err));
        };

        handler
            .begin_pre_tasks()
            .map_err(|err| self.remote_failure("remote pre-tasks failed", err))?;
        self.pipeline.pre_tasks().map_err(|err| self.notify(err))?;
        handler
            .end_pre_tasks()
            .map_err(|err| self.remote_failure("remote pre-tasks failed", err))
    }

    fn post_tasks(&self) -> Result<()> {
        let Some(handler) = self.client.as_post_tasks_handler() else {
            return self.pipeline.post_tasks().map_err(|err| self.notify(err));
        };

        handler
            .begin_post_tasks()
            .map_err(|err| self.remote_failure("remote post-tasks failed", err))?;
        self.pipeline.post_tasks().map_err(|err| self.notify(err))?;
        handler
            .end_post_tasks()
            .map_err(|err| self.remote_failure("remote post-tasks failed", err))
    }

    fn notify(&self, err: PipelineError) -> PipelineError {
        protocol::notify(&*self.client, err)
    }

    /// Fail the transfer because of a protocol error
    fn remote_failure(&self, details: &str, err: ProtocolError) -> PipelineError {
        let err = wrap_remote_error(details, err);
        self.pipeline.set_error(err.code(), err.details());
        self.pipeline.stored_error().unwrap_or(err)
    }
}
