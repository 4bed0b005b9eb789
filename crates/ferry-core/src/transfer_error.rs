//! Transfer error codes.
//!
//! The taxonomy is closed: every failure a transfer can end with maps to one
//! of the [`TransferErrorCode`] values. Each code also has a single-character
//! wire form used by protocols that only carry one byte of error information.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Closed list of transfer error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum TransferErrorCode {
    /// No error
    #[default]
    Ok = 0,
    /// Valid but undefined error
    Unknown,
    /// Error internal to the gateway (database lost, bad state, ...)
    Internal,
    /// The remote asked for an unimplemented feature
    Unimplemented,
    /// Connection to the remote could not be established
    Connection,
    /// Connection reset by peer
    ConnectionReset,
    /// Remote is not known
    UnknownRemote,
    /// No resources left to process the request
    ExceededLimit,
    /// Bad credentials
    BadAuthentication,
    /// Failure while moving file data
    DataTransfer,
    /// Integrity check failed
    Integrity,
    /// Failure during the transfer's finalization
    Finalization,
    /// Failure of a pre-, post- or error-task
    ExternalOperation,
    /// A task ended with a warning, the transfer goes on
    Warning,
    /// The transfer was stopped
    Stopped,
    /// The transfer was canceled
    Canceled,
    /// The requested file does not exist
    FileNotFound,
    /// Operation not allowed
    Forbidden,
    /// File size error (quota, disk full, ...)
    BadSize,
    /// The gateway is shutting down
    ShuttingDown,
}

impl TransferErrorCode {
    /// Every defined code, in discriminant order
    pub const ALL: [Self; 20] = [
        Self::Ok,
        Self::Unknown,
        Self::Internal,
        Self::Unimplemented,
        Self::Connection,
        Self::ConnectionReset,
        Self::UnknownRemote,
        Self::ExceededLimit,
        Self::BadAuthentication,
        Self::DataTransfer,
        Self::Integrity,
        Self::Finalization,
        Self::ExternalOperation,
        Self::Warning,
        Self::Stopped,
        Self::Canceled,
        Self::FileNotFound,
        Self::Forbidden,
        Self::BadSize,
        Self::ShuttingDown,
    ];

    /// Single-character wire code
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Ok => 'O',
            Self::Unknown => '.',
            Self::Internal => 'I',
            Self::Unimplemented => 'U',
            Self::Connection => 'C',
            Self::ConnectionReset => 'D',
            Self::UnknownRemote => 'N',
            Self::ExceededLimit => 'l',
            Self::BadAuthentication => 'A',
            Self::DataTransfer => 'T',
            Self::Integrity => 'M',
            Self::Finalization => 'F',
            Self::ExternalOperation => 'E',
            Self::Warning => 'w',
            Self::Stopped => 'H',
            Self::Canceled => 'K',
            Self::FileNotFound => 'f',
            Self::Forbidden => 'a',
            Self::BadSize => 'd',
            Self::ShuttingDown => 'S',
        }
    }

    /// Decode a single-character wire code. Characters outside the table
    /// decode to [`TransferErrorCode::Unknown`].
    #[must_use]
    pub const fn from_char(c: char) -> Self {
        match c {
            'O' => Self::Ok,
            'I' => Self::Internal,
            'U' => Self::Unimplemented,
            'C' => Self::Connection,
            'D' => Self::ConnectionReset,
            'N' => Self::UnknownRemote,
            'l' => Self::ExceededLimit,
            'A' => Self::BadAuthentication,
            'T' => Self::DataTransfer,
            'M' => Self::Integrity,
            'F' => Self::Finalization,
            'E' => Self::ExternalOperation,
            'w' => Self::Warning,
            'H' => Self::Stopped,
            'K' => Self::Canceled,
            'f' => Self::FileNotFound,
            'a' => Self::Forbidden,
            'd' => Self::BadSize,
            'S' => Self::ShuttingDown,
            _ => Self::Unknown,
        }
    }

    /// Stable textual name, as stored in the database
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Unknown => "unknown",
            Self::Internal => "internal",
            Self::Unimplemented => "unimplemented",
            Self::Connection => "connection",
            Self::ConnectionReset => "connection-reset",
            Self::UnknownRemote => "unknown-remote",
            Self::ExceededLimit => "exceeded-limit",
            Self::BadAuthentication => "bad-authentication",
            Self::DataTransfer => "data-transfer",
            Self::Integrity => "integrity",
            Self::Finalization => "finalization",
            Self::ExternalOperation => "external-operation",
            Self::Warning => "warning",
            Self::Stopped => "stopped",
            Self::Canceled => "canceled",
            Self::FileNotFound => "file-not-found",
            Self::Forbidden => "forbidden",
            Self::BadSize => "bad-size",
            Self::ShuttingDown => "shutting-down",
        }
    }

    /// Returns true for the "no error" code
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for TransferErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw value outside the error-code taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("undefined transfer error code: {0}")]
pub struct UndefinedCode(pub String);

impl TryFrom<u8> for TransferErrorCode {
    type Error = UndefinedCode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or_else(|| UndefinedCode(value.to_string()))
    }
}

impl FromStr for TransferErrorCode {
    type Err = UndefinedCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| UndefinedCode(s.to_string()))
    }
}

/// Persisted error of a transfer: a code and a remote-safe message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferError {
    /// Error code
    pub code: TransferErrorCode,
    /// Human readable details
    pub details: String,
}

impl TransferError {
    /// Create a new persisted error. An `Ok` code never carries details.
    #[must_use]
    pub fn new(code: TransferErrorCode, details: impl Into<String>) -> Self {
        let details = if code.is_ok() {
            String::new()
        } else {
            details.into()
        };

        Self { code, details }
    }

    /// Returns true when no error is recorded
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferError({})", self.code)?;
        if !self.details.is_empty() {
            write!(f, ": {}", self.details)?;
        }
        Ok(())
    }
}
