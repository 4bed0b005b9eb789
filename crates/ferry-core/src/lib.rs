//! # Ferry Core
//!
//! Foundation types of the Ferry transfer gateway.
//!
//! This crate provides:
//! - The transfer data model (transfers, rules, agents, accounts, history)
//! - The closed taxonomy of transfer error codes
//! - A generic, data-driven state machine
//! - Slot counters limiting concurrent transfers
//! - The persistence contract and an in-memory store with JSON persistence

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod count;
pub mod error;
pub mod model;
pub mod statemachine;
pub mod store;
pub mod transfer_error;

pub use count::{SlotCounter, TransferLimits};
pub use error::{Result, StoreError};
pub use model::{
    HistoryEntry, PathsConfig, Rule, Transfer, TransferColumn, TransferContext, TransferStatus,
    TransferStep,
};
pub use statemachine::{Graph, Machine, StateError};
pub use store::{MemoryStore, Session, TransferStore};
pub use transfer_error::{TransferError, TransferErrorCode, UndefinedCode};
