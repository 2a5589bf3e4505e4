//! The `PeerAdapter` trait — chain-family access to a node.
//!
//! Implementations issue JSON-RPC requests (`chainledger-bitcoin`,
//! `chainledger-evm`) and hand back typed results. Every call must be bounded
//! by a timeout; a timeout surfaces as [`LedgerError::PeerTimeout`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LedgerError;
use crate::types::ChainModel;

/// A transaction as fetched from the peer, before decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub txid: String,
    pub payload: Value,
}

/// A block with its full transaction objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBlock {
    pub height: u64,
    pub hash: String,
    pub parent_hash: Option<String>,
    pub timestamp: i64,
    pub transactions: Vec<RawTransaction>,
}

impl RawBlock {
    /// Returns `true` if this block builds on a block with hash `parent`.
    pub fn extends(&self, parent: &str) -> bool {
        self.parent_hash.as_deref() == Some(parent)
    }

    pub fn tx_ids(&self) -> Vec<String> {
        self.transactions.iter().map(|t| t.txid.clone()).collect()
    }
}

/// Chain-family adapter the crawler drives.
#[async_trait]
pub trait PeerAdapter: Send + Sync {
    /// Ledger model of this chain.
    fn model(&self) -> ChainModel;

    /// Current best height on the peer.
    async fn chain_height(&self) -> Result<u64, LedgerError>;

    /// Canonical block hash at `height`, `None` if the peer has no block there.
    async fn block_hash(&self, height: u64) -> Result<Option<String>, LedgerError>;

    /// Full block with transaction objects.
    async fn block_by_hash(&self, hash: &str) -> Result<RawBlock, LedgerError>;

    /// Median fee rate of the block at `height`.
    async fn fee_estimate(&self, _height: u64) -> Result<Option<u64>, LedgerError> {
        Ok(None)
    }

    /// Ids of all transactions in the peer's mempool. `None` if unsupported.
    async fn mempool_txids(&self) -> Result<Option<Vec<String>>, LedgerError> {
        Ok(None)
    }

    /// A single transaction by id, `None` if the peer no longer knows it.
    async fn transaction(&self, _txid: &str) -> Result<Option<RawTransaction>, LedgerError> {
        Ok(None)
    }
}
