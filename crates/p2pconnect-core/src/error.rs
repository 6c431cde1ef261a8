use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a send operation failed. The serialized form is the stable error kind
/// string reported to the application.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SendError {
    #[error("the peer speaks a different protocol version")]
    VersionMismatch,
    #[error("the recipient refused the transfer")]
    TransferDenied,
    #[error("the transfer was interrupted")]
    TransferInterrupted,
    #[error("internal protocol error")]
    InternalError,
    #[error("the send operation was cancelled")]
    Cancelled,
}

impl SendError {
    pub fn kind(&self) -> &'static str {
        match self {
            SendError::VersionMismatch => "versionMismatch",
            SendError::TransferDenied => "transferDenied",
            SendError::TransferInterrupted => "transferInterrupted",
            SendError::InternalError => "internalError",
            SendError::Cancelled => "cancelled",
        }
    }
}

/// Failures observed on the receiving side.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("unsupported protocol version {0:?}")]
    VersionMismatch(String),
    #[error("transfer {0:?} was denied")]
    TransferDenied(String),
    #[error("no decision for transfer {0:?} within the acceptance window")]
    AcceptTimeout(String),
    #[error("peer sent more resources than announced ({0})")]
    TooManyResources(usize),
    #[error("io error: {0}")]
    Io(String),
    #[error("transmission error: {0}")]
    Transmission(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("the peer disconnected mid-transfer")]
    TransferInterrupted,
    #[error("advertising failed: {0}")]
    Advertising(String),
}

/// Errors raised by a [`crate::PeerSession`] or the layer that establishes it.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no peer connected")]
    NotConnected,
    #[error("session closed")]
    Closed,
    #[error("connection cancelled")]
    Cancelled,
    #[error("resource aborted by peer: {0}")]
    Aborted(String),
    #[error("integrity check failed for {0}")]
    Integrity(String),
    #[error("malformed frame: {0}")]
    Frame(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_error_kinds_match_serialized_form() {
        for err in [
            SendError::VersionMismatch,
            SendError::TransferDenied,
            SendError::TransferInterrupted,
            SendError::InternalError,
            SendError::Cancelled,
        ] {
            let json = serde_json::to_string(&err).unwrap();
            assert_eq!(json, format!("\"{}\"", err.kind()));
        }
    }
}
