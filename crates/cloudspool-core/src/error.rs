// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Cloudspool.
//
// Every error maps onto an `ErrorClass`; retry and escalation decisions in the
// cloud client and the printer manager are made from the class alone.

use thiserror::Error;

use crate::types::{ErrorClass, Identity, JobState};

/// Top-level error type for all Cloudspool operations.
#[derive(Debug, Error)]
pub enum CloudspoolError {
    // -- Cloud transport --
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cloud returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("cloud rejected request: {0}")]
    CloudRejected(String),

    #[error("push session error: {0}")]
    Push(String),

    #[error("payload truncated: expected {expected} bytes, got {actual}")]
    TruncatedPayload { expected: u64, actual: u64 },

    // -- Credentials --
    #[error("authentication failed for {identity} identity: {detail}")]
    Authentication { identity: Identity, detail: String },

    #[error("no credentials configured for {0} identity")]
    MissingIdentity(Identity),

    // -- Protocol / job --
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported job ticket: {0}")]
    UnsupportedTicket(String),

    #[error("invalid job state transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    // -- Local print service --
    #[error("printer {0} is not present locally")]
    PrinterGone(String),

    #[error("local print service error: {0}")]
    LocalPrint(String),

    #[error("local job failed: {0}")]
    LocalJobFailed(String),

    // -- Process --
    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutting down")]
    ShuttingDown,

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CloudspoolError>;

impl CloudspoolError {
    /// Classify this error for retry and escalation decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::Push(_) => ErrorClass::Transient,
            Self::TruncatedPayload { .. } => ErrorClass::Transient,

            Self::HttpStatus { status, .. } => match *status {
                401 | 403 => ErrorClass::Authentication { fatal: false },
                408 | 429 => ErrorClass::Transient,
                s if s >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Protocol,
            },

            // Without the robot identity nothing else can work.
            Self::Authentication { identity, .. } | Self::MissingIdentity(identity) => {
                ErrorClass::Authentication {
                    fatal: *identity == Identity::Robot,
                }
            }

            Self::CloudRejected(_)
            | Self::Protocol(_)
            | Self::UnsupportedTicket(_)
            | Self::InvalidTransition { .. }
            | Self::Serialization(_) => ErrorClass::Protocol,

            Self::PrinterGone(_) | Self::LocalPrint(_) | Self::LocalJobFailed(_) => {
                ErrorClass::LocalDevice
            }

            Self::Config(_) => ErrorClass::Fatal,
            Self::ShuttingDown => ErrorClass::Cancelled,

            Self::Io(io_err) => match io_err.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::Interrupted => ErrorClass::Transient,
                _ => ErrorClass::LocalDevice,
            },
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether the process cannot keep operating after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Fatal | ErrorClass::Authentication { fatal: true }
        )
    }
}
