//! Loopback protocol.
//!
//! The `local` protocol treats the address of the partner as a directory of
//! the local filesystem and copies files to and from it. It exercises every
//! part of a client transfer (resumption and integrity check included)
//! without any network.

use ferry_core::{TransferContext, TransferErrorCode};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{PipelineError, ProtocolError, file_err_to_transfer_err};
use crate::file_stream::{FileStream, file_hash};
use crate::protocol::{Client, ClientFactory, Partner, ProtocolResult};

/// Name of the loopback protocol
pub const LOCAL_PROTOCOL: &str = "local";

const CHUNK_SIZE: usize = 32 * 1024;

/// Client copying files to and from a local directory
#[derive(Debug)]
pub struct LocalClient {
    transfer_id: i64,
    root: PathBuf,
    remote: PathBuf,
    is_send: bool,
}

impl LocalClient {
    /// Client of the transfer of `ctx`
    ///
    /// # Errors
    ///
    /// Fails if the transfer has no partner.
    pub fn new(ctx: &TransferContext) -> Result<Self, PipelineError> {
        let Some(agent) = &ctx.remote_agent else {
            return Err(PipelineError::internal("the transfer has no partner"));
        };
        let root = PathBuf::from(&agent.address);
        let remote = root.join(ctx.transfer().remote_path.trim_start_matches('/'));

        Ok(Self {
            transfer_id: ctx.transfer_id(),
            root,
            remote,
            is_send: ctx.is_send(),
        })
    }

    /// Path of the file on the partner's side
    #[must_use]
    pub fn remote_path(&self) -> &Path {
        &self.remote
    }
}

fn open_remote(path: &Path, write: bool) -> Result<File, PipelineError> {
    let opened = if write {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(file_err_to_transfer_err)?;
        }
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    } else {
        File::open(path)
    };
    opened.map_err(file_err_to_transfer_err)
}

fn data_error(err: io::Error) -> ProtocolError {
    match PipelineError::from_io(&err) {
        Some(err) => Box::new(err),
        None => Box::new(PipelineError::with_cause(
            TransferErrorCode::DataTransfer,
            "remote file operation failed",
            err,
        )),
    }
}

impl Partner for LocalClient {
    fn send_error(&self, code: TransferErrorCode, details: &str) {
        tracing::warn!(
            transfer_id = self.transfer_id,
            %code,
            "Transfer aborted: {}",
            details
        );
    }
}

impl Client for LocalClient {
    fn request(&self) -> ProtocolResult {
        if !self.root.is_dir() {
            return Err(Box::new(PipelineError::new(
                TransferErrorCode::Connection,
                "partner unreachable",
            )));
        }
        if !self.is_send && !self.remote.is_file() {
            return Err(Box::new(PipelineError::new(
                TransferErrorCode::FileNotFound,
                "file not found",
            )));
        }

        tracing::debug!(
            transfer_id = self.transfer_id,
            remote = %self.remote.display(),
            "Transfer accepted by the partner"
        );
        Ok(())
    }

    fn send(&self, file: &FileStream) -> ProtocolResult {
        let mut remote = open_remote(&self.remote, true)?;
        remote
            .seek(SeekFrom::Start(file.progress()))
            .map_err(data_error)?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).map_err(data_error)?;
            if n == 0 {
                break;
            }
            remote.write_all(&buf[..n]).map_err(data_error)?;
        }

        let end = remote.stream_position().map_err(data_error)?;
        remote.set_len(end).map_err(data_error)?;
        remote.sync_all().map_err(data_error)?;
        Ok(())
    }

    fn receive(&self, file: &FileStream) -> ProtocolResult {
        let mut remote = open_remote(&self.remote, false)?;
        remote
            .seek(SeekFrom::Start(file.progress()))
            .map_err(data_error)?;

        let mut local = file;
        io::copy(&mut remote, &mut local).map_err(data_error)?;

        if !file.is_finished() {
            let expected = file_hash(&self.remote).map_err(data_error)?;
            file.check_hash(&expected)?;
        }
        Ok(())
    }

    fn end_transfer(&self) -> ProtocolResult {
        Ok(())
    }
}

/// Factory of [`LocalClient`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClientFactory;

impl ClientFactory for LocalClientFactory {
    fn protocol(&self) -> &str {
        LOCAL_PROTOCOL
    }

    fn new_client(&self, ctx: &Arc<TransferContext>) -> ProtocolResult<Arc<dyn Client>> {
        Ok(Arc::new(LocalClient::new(ctx)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientPipeline;
    use crate::protocol::Protocols;
    use crate::test_support::Fixture;
    use ferry_core::{TransferColumn, TransferStatus, TransferStep, TransferStore};

    fn services(fx: &Fixture) -> crate::Services {
        fx.services
            .clone()
            .with_protocols(Protocols::new().with(LocalClientFactory))
    }

    fn partner_dir(fx: &Fixture) -> PathBuf {
        let dir = fx.dir.path().join("partner");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_push() {
        let fx = Fixture::new(true);
        let partner = partner_dir(&fx);
        let id = fx.planned_client(b"pushed content");
        let name = fx.store.get_transfer(id).unwrap().src_filename;

        let cp = ClientPipeline::new(&services(&fx), fx.store.get_transfer(id).unwrap()).unwrap();
        cp.run().unwrap();

        assert_eq!(fs::read(partner.join(name)).unwrap(), b"pushed content");
        assert_eq!(fx.store.get_history(id).unwrap().progress, 14);
    }

    #[test]
    fn test_pull() {
        let fx = Fixture::new(false);
        let partner = partner_dir(&fx);
        let id = fx.planned_client(b"");
        let name = fx.store.get_transfer(id).unwrap().src_filename;
        fs::write(partner.join(&name), b"pulled content").unwrap();

        let cp = ClientPipeline::new(&services(&fx), fx.store.get_transfer(id).unwrap()).unwrap();
        cp.run().unwrap();

        let entry = fx.store.get_history(id).unwrap();
        assert_eq!(entry.status, TransferStatus::Done);
        assert_eq!(entry.local_path, fx.dir.path().join("in").join(&name));
        assert_eq!(fs::read(&entry.local_path).unwrap(), b"pulled content");
    }

    #[test]
    fn test_resumed_pull() {
        let fx = Fixture::new(false);
        let partner = partner_dir(&fx);
        let id = fx.planned_client(b"");
        let mut trans = fx.store.get_transfer(id).unwrap();
        fs::write(partner.join(&trans.src_filename), b"hello world").unwrap();

        let part = fx
            .dir
            .path()
            .join("tmp")
            .join(format!("{}.part", trans.src_filename));
        fs::create_dir_all(part.parent().unwrap()).unwrap();
        fs::write(&part, b"hello").unwrap();
        trans.local_path = part;
        trans.step = TransferStep::Data;
        trans.progress = 5;
        fx.store
            .update_transfer(
                &trans,
                &[
                    TransferColumn::Paths,
                    TransferColumn::Step,
                    TransferColumn::Progress,
                ],
            )
            .unwrap();

        let cp = ClientPipeline::new(&services(&fx), trans).unwrap();
        cp.run().unwrap();

        let entry = fx.store.get_history(id).unwrap();
        assert_eq!(fs::read(&entry.local_path).unwrap(), b"hello world");
        assert_eq!(entry.progress, 11);
    }

    #[test]
    fn test_pull_missing_file() {
        let fx = Fixture::new(false);
        partner_dir(&fx);
        let id = fx.planned_client(b"");

        let cp = ClientPipeline::new(&services(&fx), fx.store.get_transfer(id).unwrap()).unwrap();
        let err = cp.run().unwrap_err();

        assert_eq!(err.code(), TransferErrorCode::FileNotFound);
        assert_eq!(
            fx.store.get_transfer(id).unwrap().status,
            TransferStatus::Error
        );
    }

    #[test]
    fn test_unreachable_partner() {
        let fx = Fixture::new(true);
        let id = fx.planned_client(b"x");

        let cp = ClientPipeline::new(&services(&fx), fx.store.get_transfer(id).unwrap()).unwrap();
        let err = cp.run().unwrap_err();

        assert_eq!(err.code(), TransferErrorCode::Connection);
    }
}
