//! # Ferry Pipeline
//!
//! Transfer engine of the Ferry gateway.
//!
//! This crate provides:
//! - The transfer [`Pipeline`] and its lifecycle state machine
//! - The [`FileStream`] tracking the progress of the data phase
//! - Pre-, post- and error-task chains
//! - The registry of running pipelines and its control plane
//! - The protocol contracts and the client/server adapters built on them
//! - The `local` loopback protocol
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │            ClientPipeline          ServerPipeline            │
//! │      (drives a protocol Client) (driven by a protocol server)│
//! ├──────────────────────────────────────────────────────────────┤
//! │                          Pipeline                            │
//! │   lifecycle, task chains, error path, slot, registry entry   │
//! ├──────────────────────────────────────────────────────────────┤
//! │                         FileStream                           │
//! │            local file, progress, integrity check             │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod file_stream;
mod gate;
pub mod local;
pub mod paths;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod server;
pub mod services;
pub mod states;
pub mod trace;

#[cfg(test)]
mod test_support;

pub use client::ClientPipeline;
pub use error::{PipelineError, ProtocolError, Result, file_err_to_transfer_err, wrap_remote_error};
pub use file_stream::{FileStream, file_hash};
pub use local::{LOCAL_PROTOCOL, LocalClient, LocalClientFactory};
pub use pipeline::{InterruptionHandler, Pipeline};
pub use protocol::{
    CancelHandler, Client, ClientFactory, Partner, PauseHandler, PostTasksHandler,
    PreTasksHandler, ProtocolResult, Protocols,
};
pub use registry::PipelineRegistry;
pub use runner::{
    FnTask, NoopRunner, Runner, RunnerFactory, StopSignal, Task, TaskChainFactory, TaskChains,
    TaskError,
};
pub use server::ServerPipeline;
pub use services::{DEFAULT_HANDLER_TIMEOUT, DEFAULT_UPDATE_INTERVAL, Services};
pub use states::{PipelineState, StreamState};
pub use trace::Trace;
