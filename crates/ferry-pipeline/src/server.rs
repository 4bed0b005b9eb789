//! Server transfers.
//!
//! A protocol server creates a [`ServerPipeline`] when a partner asks for a
//! transfer, then drives it as the partner's requests come in. Errors
//! returned to the server carry the code of the failure and a generic
//! message meant for the partner.

use ferry_core::{Transfer, TransferErrorCode};
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::file_stream::FileStream;
use crate::pipeline::Pipeline;
use crate::protocol::{self, Partner};
use crate::services::Services;

/// Transfer started by a partner
pub struct ServerPipeline {
    pipeline: Arc<Pipeline>,
    partner: Arc<dyn Partner>,
}

impl ServerPipeline {
    /// Create the pipeline of a server transfer.
    ///
    /// # Errors
    ///
    /// Fails like [`Pipeline::new_server`].
    pub fn new(services: &Services, transfer: Transfer, partner: Arc<dyn Partner>) -> Result<Self> {
        let pipeline = Pipeline::new_server(services, transfer)?;
        protocol::install_handlers(&pipeline, &partner);

        let ctx = pipeline.context();
        let trans = ctx.snapshot();
        let account = ctx.local_account.as_ref().map_or("", |a| a.login.as_str());
        let server = ctx.local_agent.as_ref().map_or("", |a| a.name.as_str());
        tracing::info!(
            transfer_id = trans.id,
            "{} of file {:?} requested by {:?} on server {:?} using rule {:?}",
            if ctx.is_send() { "Download" } else { "Upload" },
            trans.local_path,
            account,
            server,
            ctx.rule.name
        );

        Ok(Self { pipeline, partner })
    }

    /// Underlying pipeline
    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Run the pre-tasks and open the file
    ///
    /// # Errors
    ///
    /// Fails if the pre-tasks fail or the file cannot be opened.
    pub fn start(&self) -> Result<Arc<FileStream>> {
        self.pipeline
            .pre_tasks()
            .map_err(|err| self.reply(err, "pre-tasks failed"))?;
        self.pipeline
            .start_data()
            .map_err(|err| self.notify(err))
    }

    /// Close the file, run the post-tasks and end the transfer
    ///
    /// # Errors
    ///
    /// Fails at the first step that fails.
    pub fn close(&self) -> Result<()> {
        self.pipeline
            .end_data()
            .map_err(|err| self.reply(err, "failed to close file"))?;
        self.pipeline
            .post_tasks()
            .map_err(|err| self.reply(err, "post-tasks failed"))?;
        self.pipeline
            .end_transfer()
            .map_err(|err| self.reply(err, "failed to finalize transfer"))
    }

    /// Fail the transfer because the partner reported an error or went away
    pub fn transfer_error(&self, code: TransferErrorCode, details: &str) {
        self.pipeline.set_error(code, details);
    }

    fn notify(&self, err: PipelineError) -> PipelineError {
        protocol::notify(&*self.partner, err)
    }

    /// Notify the partner with a generic message instead of the local one
    fn reply(&self, err: PipelineError, details: &str) -> PipelineError {
        let reply = PipelineError::new(err.code(), details);
        let reply = if err.notifies_remote() {
            reply
        } else {
            reply.local_only()
        };
        self.notify(reply);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{FnTask, StopSignal, Task, TaskChains, TaskError};
    use crate::states::PipelineState;
    use crate::services::DEFAULT_HANDLER_TIMEOUT;
    use crate::test_support::Fixture;
    use ferry_core::{TransferContext, TransferStatus, TransferStore};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        errors: Mutex<Vec<(TransferErrorCode, String)>>,
    }

    impl Partner for Recorder {
        fn send_error(&self, code: TransferErrorCode, details: &str) {
            self.errors.lock().unwrap().push((code, details.to_string()));
        }
    }

    #[test]
    fn test_upload() {
        let fx = Fixture::new(false);
        let partner = Arc::new(Recorder::default());
        let sp = ServerPipeline::new(&fx.services, fx.server_transfer("up.txt"), partner.clone())
            .unwrap();
        let id = sp.pipeline().transfer_id();
        assert_ne!(id, 0);

        let file = sp.start().unwrap();
        file.write_at(b"world", 6).unwrap();
        file.write_at(b"hello ", 0).unwrap();
        sp.close().unwrap();

        assert_eq!(sp.pipeline().state(), PipelineState::AllDone);
        let entry = fx.store.get_history(id).unwrap();
        assert_eq!(entry.status, TransferStatus::Done);
        assert_eq!(std::fs::read(&entry.local_path).unwrap(), b"hello world");
        assert_eq!(entry.local_path, fx.dir.path().join("in/server/up.txt"));
        assert!(partner.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pre_task_failure_replies_generic_message() {
        let failing: Arc<dyn Task> = Arc::new(FnTask::new(
            "fail",
            |_: &TransferContext, _: &StopSignal| Err(TaskError::new("/secret/script exited 1")),
        ));
        let fx = Fixture::with_chains(
            false,
            TaskChains {
                pre: vec![failing],
                ..TaskChains::default()
            },
        );
        let partner = Arc::new(Recorder::default());
        let sp = ServerPipeline::new(&fx.services, fx.server_transfer("up.txt"), partner.clone())
            .unwrap();

        let err = sp.start().err().unwrap();
        assert_eq!(err.code(), TransferErrorCode::ExternalOperation);
        assert_eq!(
            partner.errors.lock().unwrap().as_slice(),
            &[(
                TransferErrorCode::ExternalOperation,
                "pre-tasks failed".to_string()
            )]
        );
    }

    #[test]
    fn test_partner_error() {
        let fx = Fixture::new(false);
        let partner = Arc::new(Recorder::default());
        let sp = ServerPipeline::new(&fx.services, fx.server_transfer("up.txt"), partner.clone())
            .unwrap();
        let _file = sp.start().unwrap();

        sp.transfer_error(TransferErrorCode::ConnectionReset, "session closed unexpectedly");

        let trans = fx.store.get_transfer(sp.pipeline().transfer_id()).unwrap();
        assert_eq!(trans.status, TransferStatus::Error);
        assert_eq!(trans.error.code, TransferErrorCode::ConnectionReset);
        assert!(sp.close().is_err());
        assert!(partner.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_notifies_partner() {
        let fx = Fixture::new(false);
        let partner = Arc::new(Recorder::default());
        let sp = ServerPipeline::new(&fx.services, fx.server_transfer("up.txt"), partner.clone())
            .unwrap();

        sp.pipeline().cancel(DEFAULT_HANDLER_TIMEOUT).unwrap();
        assert_eq!(
            partner.errors.lock().unwrap().as_slice(),
            &[(
                TransferErrorCode::Canceled,
                "transfer canceled by user".to_string()
            )]
        );
    }
}
