//! Live transfer records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{Result, StoreError};
use crate::transfer_error::TransferError;

/// Persisted status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    /// Waiting for its scheduled start
    #[default]
    Planned,
    /// Server-side transfer waiting for the partner to connect
    Available,
    /// Currently running
    Running,
    /// Paused by a user
    Paused,
    /// Stopped by a service shutdown
    Interrupted,
    /// Cancelled by a user (archived)
    Cancelled,
    /// Finished successfully (archived)
    Done,
    /// Failed, may be retried
    Error,
}

impl TransferStatus {
    /// Returns true for the statuses a transfer is archived with
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// Returns true for statuses the scheduler may (re)start
    #[must_use]
    pub const fn is_startable(self) -> bool {
        matches!(self, Self::Planned | Self::Interrupted | Self::Error)
    }

    /// Stable textual name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Available => "available",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Interrupted => "interrupted",
            Self::Cancelled => "cancelled",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Persisted checkpoint of a transfer.
///
/// Steps are ordered: a resumed transfer skips every phase whose step is
/// lower than its persisted one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStep {
    /// Not started, or finished
    #[default]
    None,
    /// Pipeline being set up
    Setup,
    /// Running pre-tasks
    PreTasks,
    /// Moving file data
    Data,
    /// Running post-tasks
    PostTasks,
    /// Running error-tasks
    ErrorTasks,
    /// Archiving the transfer
    Finalization,
}

impl TransferStep {
    /// Stable textual name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Setup => "setup",
            Self::PreTasks => "pre-tasks",
            Self::Data => "data",
            Self::PostTasks => "post-tasks",
            Self::ErrorTasks => "error-tasks",
            Self::Finalization => "finalization",
        }
    }
}

impl fmt::Display for TransferStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Columns of a [`Transfer`] that can be updated independently.
///
/// Updating a subset avoids clobbering columns written concurrently by
/// another party (the file stream persists progress while the pipeline
/// persists step changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferColumn {
    /// `status`
    Status,
    /// `step`
    Step,
    /// `task_number`
    TaskNumber,
    /// `progress`
    Progress,
    /// `filesize`
    Filesize,
    /// `error`
    Error,
    /// `local_path` and `remote_path`
    Paths,
    /// `src_filename` and `dest_filename`
    Filenames,
    /// `start`
    Start,
    /// `next_retry`, `remaining_tries` and `next_retry_delay`
    Retry,
}

impl TransferColumn {
    /// Every column
    pub const ALL: [Self; 10] = [
        Self::Status,
        Self::Step,
        Self::TaskNumber,
        Self::Progress,
        Self::Filesize,
        Self::Error,
        Self::Paths,
        Self::Filenames,
        Self::Start,
        Self::Retry,
    ];
}

/// Default delay between two retries, in seconds
pub const DEFAULT_RETRY_DELAY: u32 = 30;

/// Default factor applied to the retry delay after each retry
pub const DEFAULT_RETRY_FACTOR: f32 = 2.0;

/// A live transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    /// Local identifier (`0` until inserted)
    pub id: i64,
    /// Identifier shared with the partner
    pub remote_transfer_id: String,
    /// Rule the transfer runs under
    pub rule_id: i64,
    /// Protocol client running a client-side transfer
    pub client_id: Option<i64>,
    /// Local account of a server-side transfer
    pub local_account_id: Option<i64>,
    /// Remote account of a client-side transfer
    pub remote_account_id: Option<i64>,
    /// Name of the file at the source
    pub src_filename: String,
    /// Name of the file at the destination
    pub dest_filename: String,
    /// Resolved local path
    pub local_path: PathBuf,
    /// Resolved remote path
    pub remote_path: String,
    /// File size, `None` until known
    pub filesize: Option<u64>,
    /// Bytes transferred so far
    pub progress: u64,
    /// Status
    pub status: TransferStatus,
    /// Checkpoint
    pub step: TransferStep,
    /// Last error
    pub error: TransferError,
    /// Rank of the task being run within the current step
    pub task_number: u32,
    /// Start date (unix seconds)
    pub start: u64,
    /// Date of the next retry (unix seconds)
    pub next_retry: Option<u64>,
    /// Automatic retries left
    pub remaining_tries: u32,
    /// Delay before the next retry, in seconds
    pub next_retry_delay: u32,
    /// Factor applied to the delay after each retry
    pub retry_increment_factor: f32,
}

impl Default for Transfer {
    fn default() -> Self {
        Self {
            id: 0,
            remote_transfer_id: String::new(),
            rule_id: 0,
            client_id: None,
            local_account_id: None,
            remote_account_id: None,
            src_filename: String::new(),
            dest_filename: String::new(),
            local_path: PathBuf::new(),
            remote_path: String::new(),
            filesize: None,
            progress: 0,
            status: TransferStatus::Planned,
            step: TransferStep::None,
            error: TransferError::default(),
            task_number: 0,
            start: 0,
            next_retry: None,
            remaining_tries: 0,
            next_retry_delay: DEFAULT_RETRY_DELAY,
            retry_increment_factor: DEFAULT_RETRY_FACTOR,
        }
    }
}

impl Transfer {
    /// Returns true for transfers initiated by a partner (server-side)
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.local_account_id.is_some()
    }

    /// Name of the local file, given the rule's direction
    #[must_use]
    pub fn local_filename(&self, is_send: bool) -> &str {
        if is_send {
            &self.src_filename
        } else {
            &self.dest_filename
        }
    }

    /// Name of the remote file, given the rule's direction
    #[must_use]
    pub fn remote_filename(&self, is_send: bool) -> &str {
        if is_send {
            &self.dest_filename
        } else {
            &self.src_filename
        }
    }

    /// Check the record before it is written
    pub fn validate(&self) -> Result<()> {
        if self.rule_id == 0 {
            return Err(StoreError::invalid("transfer has no rule"));
        }
        match (self.local_account_id, self.remote_account_id) {
            (Some(_), Some(_)) => {
                return Err(StoreError::invalid(
                    "transfer cannot have both a local and a remote account",
                ));
            }
            (None, None) => {
                return Err(StoreError::invalid("transfer has no account"));
            }
            (None, Some(_)) if self.client_id.is_none() => {
                return Err(StoreError::invalid("client transfer has no client"));
            }
            _ => {}
        }
        if self.src_filename.is_empty() && self.dest_filename.is_empty() {
            return Err(StoreError::invalid("transfer has no file name"));
        }
        if !self.retry_increment_factor.is_finite() || self.retry_increment_factor < 0.0 {
            return Err(StoreError::invalid("invalid retry increment factor"));
        }
        Ok(())
    }

    /// Copy the given columns of `other` into `self`
    pub fn copy_columns(&mut self, other: &Transfer, columns: &[TransferColumn]) {
        for column in columns {
            match column {
                TransferColumn::Status => self.status = other.status,
                TransferColumn::Step => self.step = other.step,
                TransferColumn::TaskNumber => self.task_number = other.task_number,
                TransferColumn::Progress => self.progress = other.progress,
                TransferColumn::Filesize => self.filesize = other.filesize,
                TransferColumn::Error => self.error = other.error.clone(),
                TransferColumn::Paths => {
                    self.local_path = other.local_path.clone();
                    self.remote_path = other.remote_path.clone();
                }
                TransferColumn::Filenames => {
                    self.src_filename = other.src_filename.clone();
                    self.dest_filename = other.dest_filename.clone();
                }
                TransferColumn::Start => self.start = other.start,
                TransferColumn::Retry => {
                    self.next_retry = other.next_retry;
                    self.remaining_tries = other.remaining_tries;
                    self.next_retry_delay = other.next_retry_delay;
                }
            }
        }
    }

    /// Plan the next automatic retry, if any is left.
    ///
    /// Returns true when a retry was scheduled. The delay grows by
    /// `retry_increment_factor` after each retry and saturates at `i32::MAX`.
    pub fn schedule_retry(&mut self, now: u64) -> bool {
        if self.remaining_tries == 0 {
            self.next_retry = None;
            return false;
        }

        self.next_retry = Some(now.saturating_add(u64::from(self.next_retry_delay)));

        let next = f64::from(self.next_retry_delay) * f64::from(self.retry_increment_factor);
        self.next_retry_delay = if next >= f64::from(i32::MAX) {
            i32::MAX as u32
        } else {
            next as u32
        };

        true
    }
}
