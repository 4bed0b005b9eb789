use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::transfer::{TransferStatus, TransferStep};
use crate::transfer_error::TransferError;

/// Immutable archive of a finished (or cancelled) transfer.
///
/// Names are copied rather than referenced so the entry stays meaningful
/// after the rule, agent or account it ran with is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Identifier of the archived transfer
    pub id: i64,
    /// Identifier shared with the partner
    pub remote_transfer_id: String,
    /// True if the partner initiated the transfer
    pub is_server: bool,
    /// True if the file was sent to the partner
    pub is_send: bool,
    /// Rule name
    pub rule: String,
    /// Client name (client-side transfers)
    pub client: String,
    /// Account login
    pub account: String,
    /// Agent name
    pub agent: String,
    /// Protocol
    pub protocol: String,
    /// Name of the file at the source
    pub src_filename: String,
    /// Name of the file at the destination
    pub dest_filename: String,
    /// Local path
    pub local_path: PathBuf,
    /// Remote path
    pub remote_path: String,
    /// File size
    pub filesize: Option<u64>,
    /// Bytes transferred
    pub progress: u64,
    /// Final status
    pub status: TransferStatus,
    /// Step the transfer ended at
    pub step: TransferStep,
    /// Last error
    pub error: TransferError,
    /// Task rank the transfer ended at
    pub task_number: u32,
    /// Start date (unix seconds)
    pub start: u64,
    /// End date (unix seconds)
    pub stop: u64,
}
