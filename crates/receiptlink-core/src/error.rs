// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Receiptlink.

use std::io::ErrorKind;

use thiserror::Error;

use crate::types::ErrorClass;

/// Top-level error type for all Receiptlink operations.
#[derive(Debug, Error)]
pub enum ReceiptError {
    // -- Link errors --
    /// Radio off, or the device cannot be resolved.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("connect to {address} failed after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        address: String,
        attempts: u32,
        reason: String,
    },

    /// Mid-transmission I/O failure; usually a silent disconnect.
    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    // -- Status errors --
    #[error("status response unparseable: {0}")]
    StatusUnparseable(String),

    #[error("printer offline: {0}")]
    StatusOffline(String),

    #[error("printer hardware error: {0}")]
    StatusError(String),

    // -- Delivery errors --
    #[error("no default printer configured")]
    NoDefaultPrinter,

    #[error("order {0} not found")]
    OrderNotFound(u64),

    #[error("nothing to print")]
    EmptyContent,

    #[error("printer driver error: {0}")]
    Driver(String),

    // -- Storage / persistence --
    #[error("database error: {0}")]
    Database(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // -- Platform --
    #[error("feature not available on this platform")]
    PlatformUnavailable,
}

impl ReceiptError {
    /// Whether the failure looks like the link went away under us
    /// (broken pipe, reset, write timeout).
    pub fn is_connection_related(&self) -> bool {
        match self {
            Self::WriteFailed(_) | Self::Timeout(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Map an I/O failure during a write onto `WriteFailed`, keeping the cause.
    pub fn write_failed(context: &str, err: impl std::fmt::Display) -> Self {
        Self::WriteFailed(format!("{context}: {err}"))
    }
}

/// Classify a `ReceiptError` into an `ErrorClass` for retry decisions.
pub fn classify_error(err: &ReceiptError) -> ErrorClass {
    if err.is_connection_related() {
        return ErrorClass::LinkLost;
    }
    match err {
        ReceiptError::ConnectFailed { .. } => ErrorClass::Transient,
        ReceiptError::StatusUnparseable(_) => ErrorClass::Transient,
        ReceiptError::Driver(_) => ErrorClass::Transient,
        ReceiptError::Database(_) => ErrorClass::Transient,
        ReceiptError::Io(_) => ErrorClass::Transient,

        ReceiptError::TransportUnavailable(_) => ErrorClass::UserAction,
        ReceiptError::StatusOffline(_) => ErrorClass::UserAction,
        ReceiptError::StatusError(_) => ErrorClass::UserAction,
        ReceiptError::NoDefaultPrinter => ErrorClass::UserAction,

        ReceiptError::Cancelled => ErrorClass::Permanent,
        ReceiptError::OrderNotFound(_) => ErrorClass::Permanent,
        ReceiptError::EmptyContent => ErrorClass::Permanent,
        ReceiptError::Serialization(_) => ErrorClass::Permanent,
        ReceiptError::PlatformUnavailable => ErrorClass::Permanent,

        ReceiptError::WriteFailed(_) | ReceiptError::Timeout(_) => ErrorClass::LinkLost,
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ReceiptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_pipe_is_link_lost() {
        let err = ReceiptError::Io(std::io::Error::new(ErrorKind::BrokenPipe, "pipe"));
        assert!(err.is_connection_related());
        assert_eq!(classify_error(&err), ErrorClass::LinkLost);
    }

    #[test]
    fn radio_off_needs_the_operator() {
        let err = ReceiptError::TransportUnavailable("bluetooth disabled".into());
        assert!(!err.is_connection_related());
        assert_eq!(classify_error(&err), ErrorClass::UserAction);
    }

    #[test]
    fn cancellation_is_never_retried() {
        assert_eq!(classify_error(&ReceiptError::Cancelled), ErrorClass::Permanent);
    }

    #[test]
    fn handshake_failure_is_transient() {
        let err = ReceiptError::ConnectFailed {
            address: "00:11:22:33:44:55".into(),
            attempts: 3,
            reason: "socket closed".into(),
        };
        assert_eq!(classify_error(&err), ErrorClass::Transient);
    }
}
