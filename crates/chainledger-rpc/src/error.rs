//! Transport-level errors.

use chainledger_core::error::LedgerError;
use thiserror::Error;

use crate::request::JsonRpcError;

#[derive(Debug, Error)]
pub enum RpcError {
    /// Connection refused, TLS failure, non-2xx status.
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The node answered with an error object.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// The response id does not match the request id.
    #[error("Response id mismatch: expected {expected}, got {actual}")]
    IdMismatch { expected: String, actual: String },

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl RpcError {
    /// Returns `true` for transient failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Timeout { .. })
    }

    /// The node's error code, if the node answered with one.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Rpc(e) => Some(e.code),
            _ => None,
        }
    }
}

impl From<RpcError> for LedgerError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Http(msg) => LedgerError::PeerUnreachable(msg),
            RpcError::Timeout { ms } => LedgerError::PeerTimeout { ms },
            RpcError::Rpc(err) => LedgerError::PeerRpc {
                code: err.code,
                message: err.message,
            },
            RpcError::IdMismatch { expected, actual } => {
                LedgerError::PeerResponseMismatch { expected, actual }
            }
            RpcError::Deserialization(e) => LedgerError::Decode(e.to_string()),
            RpcError::Other(msg) => LedgerError::Other(msg),
        }
    }
}
