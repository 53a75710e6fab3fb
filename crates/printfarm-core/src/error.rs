// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Printfarm.

use thiserror::Error;

/// Top-level error type for all Printfarm operations.
#[derive(Debug, Error)]
pub enum PrintFarmError {
    // -- Printer status --
    #[error("printer unreachable: {0}")]
    Unreachable(String),

    #[error("printer answered with HTTP status {0}")]
    BadStatus(u16),

    #[error("malformed printer response: {0}")]
    MalformedResponse(String),

    // -- File dispatch --
    #[error("could not open pending file: {0}")]
    OpenFailed(String),

    #[error("file transfer failed: {0}")]
    TransferFailed(String),

    #[error("printer rejected upload with HTTP status {0}")]
    RejectedByPrinter(u16),

    // -- Intake --
    #[error("could not store uploaded file: {0}")]
    StorageFailed(String),

    #[error("intake server error: {0}")]
    IntakeServer(String),

    // -- Startup --
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse failure taxonomy used for logging and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or connection failure (includes timeouts).
    Unreachable,
    /// Non-2xx or undecodable status payload from a printer.
    BadStatus,
    /// An upload attempt failed for any reason.
    SendFailed,
    /// Intake could not persist a file.
    StorageFailed,
    /// Malformed configuration. Fatal at startup.
    ConfigInvalid,
    /// The intake HTTP listener failed.
    Server,
}

impl PrintFarmError {
    /// Classify this error into the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unreachable(_) => ErrorKind::Unreachable,
            Self::BadStatus(_) | Self::MalformedResponse(_) => ErrorKind::BadStatus,
            Self::OpenFailed(_) | Self::TransferFailed(_) | Self::RejectedByPrinter(_) => {
                ErrorKind::SendFailed
            }
            Self::StorageFailed(_) | Self::Io(_) => ErrorKind::StorageFailed,
            Self::ConfigInvalid(_) | Self::Serialization(_) => ErrorKind::ConfigInvalid,
            Self::IntakeServer(_) => ErrorKind::Server,
        }
    }

    /// Whether the process can carry on after this error.
    ///
    /// Only configuration errors are fatal, and only at startup.
    pub fn is_recoverable(&self) -> bool {
        self.kind() != ErrorKind::ConfigInvalid
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PrintFarmError>;
