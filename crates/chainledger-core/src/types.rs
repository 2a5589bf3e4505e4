//! Persisted entities shared by the crawler, the parser and the store.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;

/// Ledger model of a chain family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainModel {
    /// State is a set of unspent outputs (Bitcoin family).
    Utxo,
    /// State is per-account balances (Ethereum family).
    Account,
}

impl std::fmt::Display for ChainModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Utxo => write!(f, "utxo"),
            Self::Account => write!(f, "account"),
        }
    }
}

// ─── Chain position ──────────────────────────────────────────────────────────

/// The local tip of one chain. One row per chain.
///
/// A head without a `block_hash` has not recorded any block yet: `height` is
/// then the configured start height, i.e. the first block to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainHead {
    pub chain_id: String,
    pub height: u64,
    pub block_hash: Option<String>,
    /// Median fee rate sampled from the peer (UTXO chains only).
    pub avg_fee: Option<u64>,
    pub updated_at: i64,
}

impl BlockchainHead {
    /// A fresh head positioned before `start_height`.
    pub fn unsynced(chain_id: impl Into<String>, start_height: u64) -> Self {
        Self {
            chain_id: chain_id.into(),
            height: start_height,
            block_hash: None,
            avg_fee: None,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Height of the next block the crawler has to fetch.
    pub fn next_height(&self) -> u64 {
        if self.block_hash.is_some() {
            self.height + 1
        } else {
            self.height
        }
    }

    /// Returns `true` if the peer has blocks this head has not recorded.
    pub fn is_behind(&self, peer_height: u64) -> bool {
        self.next_height() <= peer_height
    }

    /// Height of the last recorded block, if any.
    pub fn synced_height(&self) -> Option<u64> {
        self.block_hash.as_ref().map(|_| self.height)
    }

    /// Returns `true` if a block at `height` is at least `depth` blocks deep.
    pub fn confirms(&self, height: u64, depth: u64) -> bool {
        self.synced_height()
            .map(|tip| tip >= height && tip - height >= depth)
            .unwrap_or(false)
    }
}

/// A block the crawler has durably recorded. Unique on `(chain_id, height)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedBlock {
    pub chain_id: String,
    pub height: u64,
    pub block_hash: String,
    pub parent_hash: Option<String>,
    pub timestamp: i64,
    pub tx_ids: Vec<String>,
}

// ─── Work items ──────────────────────────────────────────────────────────────

/// A raw transaction waiting to be decoded. Unique on `(chain_id, txid)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnparsedTransaction {
    pub chain_id: String,
    pub txid: String,
    /// Transaction object as returned by the peer, annotated with its block.
    pub raw_payload: serde_json::Value,
    /// `None` while the transaction was only seen in the mempool.
    pub block_height: Option<u64>,
    pub block_hash: Option<String>,
    pub timestamp: i64,
    pub retry_count: u32,
    pub last_retry_at: Option<i64>,
    /// When the row was committed or last handed a parse job.
    pub queued_at: i64,
    /// A parse job for this row is waiting in the work lane. Cleared when a
    /// job fails, so the requeue sweep only re-publishes rows nobody holds.
    #[serde(default)]
    pub job_queued: bool,
}

impl UnparsedTransaction {
    pub fn new(
        chain_id: impl Into<String>,
        txid: impl Into<String>,
        raw_payload: serde_json::Value,
        block: Option<(u64, String)>,
        timestamp: i64,
    ) -> Self {
        let (block_height, block_hash) = match block {
            Some((h, hash)) => (Some(h), Some(hash)),
            None => (None, None),
        };
        Self {
            chain_id: chain_id.into(),
            txid: txid.into(),
            raw_payload,
            block_height,
            block_hash,
            timestamp,
            retry_count: 0,
            last_retry_at: None,
            queued_at: chrono::Utc::now().timestamp(),
            job_queued: false,
        }
    }

    /// Returns `true` if this row was captured from the mempool.
    pub fn is_pending(&self) -> bool {
        self.block_height.is_none()
    }

    /// Latest activity on the row: its last publish or its last failure.
    pub fn last_touched_at(&self) -> i64 {
        self.last_retry_at.map_or(self.queued_at, |at| at.max(self.queued_at))
    }

    /// Returns `true` once the row has used up its retries.
    pub fn is_abandoned(&self, max_retry: u32) -> bool {
        self.retry_count >= max_retry
    }
}

/// One mempool observation per polling cycle, keyed by `(chain_id, block_height_asked)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSnapshot {
    pub chain_id: String,
    pub block_height_asked: u64,
    pub tx_ids: Vec<String>,
    pub timestamp: i64,
}

// ─── Accounts & addresses ────────────────────────────────────────────────────

/// A wallet account watching one chain through an extended public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub chain_id: String,
    pub extended_public_key: String,
}

/// HD change branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyBranch {
    /// Receive addresses (`chain_index = 0`).
    External,
    /// Change addresses (`chain_index = 1`).
    Internal,
}

impl KeyBranch {
    pub fn chain_index(&self) -> u32 {
        match self {
            Self::External => 0,
            Self::Internal => 1,
        }
    }

    pub fn from_chain_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Self::External),
            1 => Some(Self::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeyBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::External => write!(f, "external"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// A derived, watched address. Never mutated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address_id: String,
    pub account_id: String,
    pub chain_id: String,
    pub branch: KeyBranch,
    pub key_index: u32,
    pub address: String,
    pub public_key: String,
}

impl Address {
    pub fn id_for(account_id: &str, branch: KeyBranch, key_index: u32) -> String {
        format!("{account_id}/{}/{key_index}", branch.chain_index())
    }
}

/// Balance ledger of one account in one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCurrency {
    pub id: String,
    pub account_id: String,
    pub currency_id: String,
    pub balance: Amount,
    /// High-water mark of external key indices; only ever raised.
    pub external_key_count: u32,
    /// High-water mark of internal key indices; only ever raised.
    pub internal_key_count: u32,
}

impl AccountCurrency {
    pub fn new(account_id: impl Into<String>, currency_id: impl Into<String>) -> Self {
        let account_id = account_id.into();
        let currency_id = currency_id.into();
        Self {
            id: Self::id_for(&account_id, &currency_id),
            account_id,
            currency_id,
            balance: Amount::ZERO,
            external_key_count: 0,
            internal_key_count: 0,
        }
    }

    pub fn id_for(account_id: &str, currency_id: &str) -> String {
        format!("{account_id}/{currency_id}")
    }

    pub fn key_count(&self, branch: KeyBranch) -> u32 {
        match branch {
            KeyBranch::External => self.external_key_count,
            KeyBranch::Internal => self.internal_key_count,
        }
    }

    /// Raise the high-water mark for `branch` to at least `count`.
    pub fn raise_key_count(&mut self, branch: KeyBranch, count: u32) {
        let slot = match branch {
            KeyBranch::External => &mut self.external_key_count,
            KeyBranch::Internal => &mut self.internal_key_count,
        };
        *slot = (*slot).max(count);
    }
}

// ─── Decoded ledger rows ─────────────────────────────────────────────────────

/// Native chain transaction or contract-level token transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TxKind {
    Native,
    Token { contract: String },
}

/// Execution status reported by the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxOutcome {
    Success,
    Failed,
}

impl std::fmt::Display for TxOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Direction of value relative to the watched addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    /// Value moved between addresses of the same wallet.
    Internal,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::In => write!(f, "in"),
            Self::Out => write!(f, "out"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Canonical decoded transaction, unique on `(chain_id, txid, currency_id)`.
///
/// Native rows are the Transaction entity; token rows are TokenTransaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub chain_id: String,
    pub txid: String,
    pub currency_id: String,
    pub kind: TxKind,
    pub amount: Amount,
    pub fee: Amount,
    pub block_height: Option<u64>,
    pub timestamp: i64,
    pub direction: Direction,
    /// Status field as reported by the chain, kept until the row is confirmed.
    pub outcome: Option<TxOutcome>,
    /// `None` while pending; set once the block is deep enough.
    pub result: Option<TxOutcome>,
    pub source_addresses: Vec<String>,
    pub destination_addresses: Vec<String>,
}

impl TransactionRecord {
    pub fn is_pending(&self) -> bool {
        self.result.is_none()
    }
}

/// Links one watched address to one transaction row with a per-address amount.
///
/// Unique on `(currency_id, address_id, txid)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressLink {
    pub chain_id: String,
    pub currency_id: String,
    pub address_id: String,
    pub txid: String,
    pub amount: Amount,
    pub direction: Direction,
}

/// Reference to a transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }

    pub fn utxo_id(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }
}

/// An output paying a watched address (UTXO chains only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub utxo_id: String,
    pub chain_id: String,
    pub address_id: String,
    pub txid: String,
    pub vout: u32,
    pub amount: Amount,
    pub script: String,
    pub script_type: String,
    pub block_height: Option<u64>,
    pub block_timestamp: i64,
    /// Txid of the transaction consuming this output, once seen.
    pub spent_by: Option<String>,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid.clone(), self.vout)
    }

    pub fn is_unspent(&self) -> bool {
        self.spent_by.is_none()
    }
}
