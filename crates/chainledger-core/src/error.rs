//! Error types for the crawl-and-parse pipeline.

use thiserror::Error;

/// Errors that can occur while crawling or parsing a chain.
///
/// Every variant is scoped to a single cycle or job; none of them is fatal
/// to the owning task.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Peer timed out after {ms}ms")]
    PeerTimeout { ms: u64 },

    #[error("Peer response id mismatch: expected {expected}, got {actual}")]
    PeerResponseMismatch { expected: String, actual: String },

    #[error("Peer RPC error {code}: {message}")]
    PeerRpc { code: i64, message: String },

    #[error("Reorg detected at height {height}: local hash {local}, peer hash {peer}")]
    ReorgDetected {
        height: u64,
        local: String,
        peer: String,
    },

    #[error("No common ancestor within {max_depth} blocks below height {from}")]
    ReorgTooDeep { from: u64, max_depth: u64 },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Transaction {txid} abandoned after {retries} retries")]
    MaxRetryExceeded { txid: String, retries: u32 },

    #[error("Transaction {txid} changed while it was parsed")]
    StaleParse { txid: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl LedgerError {
    /// Returns `true` if the error is a reorg (handled by rollback).
    pub fn is_reorg(&self) -> bool {
        matches!(self, Self::ReorgDetected { .. } | Self::ReorgTooDeep { .. })
    }

    /// Returns `true` for transient peer failures that the next cycle retries.
    pub fn is_peer(&self) -> bool {
        matches!(
            self,
            Self::PeerUnreachable(_)
                | Self::PeerTimeout { .. }
                | Self::PeerResponseMismatch { .. }
                | Self::PeerRpc { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(LedgerError::PeerTimeout { ms: 10 }.is_peer());
        assert!(LedgerError::PeerResponseMismatch {
            expected: "1".into(),
            actual: "2".into()
        }
        .is_peer());
        assert!(!LedgerError::Store("locked".into()).is_peer());
        assert!(LedgerError::ReorgTooDeep { from: 10, max_depth: 3 }.is_reorg());
        assert!(!LedgerError::StaleParse { txid: "t".into() }.is_reorg());
    }

    #[test]
    fn display_includes_context() {
        let e = LedgerError::MaxRetryExceeded {
            txid: "ab".into(),
            retries: 3,
        };
        assert_eq!(e.to_string(), "Transaction ab abandoned after 3 retries");
    }
}
