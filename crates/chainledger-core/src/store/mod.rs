//! The `ChainStore` trait — repository over every persisted entity.
//!
//! Implementations: [`MemoryChainStore`](memory::MemoryChainStore) in this
//! crate and `SqliteStore` in `chainledger-storage`.
//!
//! Operations that must be atomic together (`commit_block`, `apply_parse`,
//! `rollback_to`) take their whole unit of work in one call, so that a
//! backend can wrap it in a single transaction.

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::types::{
    Account, AccountCurrency, Address, AddressLink, BlockchainHead, KeyBranch, OutPoint,
    PendingSnapshot, ScannedBlock, TransactionRecord, UnparsedTransaction, Utxo,
};

pub use memory::MemoryChainStore;

/// The derived rows one parsed transaction produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseEffects {
    pub chain_id: String,
    pub txid: String,
    /// Block of the unparsed row these effects were derived from. The apply
    /// is refused if that row is gone or now belongs to another block.
    pub block_hash: Option<String>,
    pub records: Vec<TransactionRecord>,
    pub links: Vec<AddressLink>,
    pub created_utxos: Vec<Utxo>,
    /// Ids of watched outputs consumed by `txid`.
    pub spent_utxos: Vec<String>,
}

impl ParseEffects {
    /// Address ids whose ledger this transaction touches.
    pub fn address_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.links.iter().map(|l| l.address_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// What a rollback removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSummary {
    pub chain_id: String,
    pub from_height: u64,
    /// New head height, `None` if every scanned block was dropped.
    pub to_height: Option<u64>,
    pub blocks_removed: usize,
    pub transactions_removed: usize,
    pub utxos_removed: usize,
    pub utxos_restored: usize,
    pub unparsed_removed: usize,
}

/// Repository over the persisted pipeline state.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; a chain's crawler and parser use
/// the same store concurrently.
#[async_trait]
pub trait ChainStore: Send + Sync {
    // ── Chain position ────────────────────────────────────────────────────

    async fn head(&self, chain_id: &str) -> Result<Option<BlockchainHead>, LedgerError>;

    /// Load the head, creating an unsynced one at `start_height` if missing.
    async fn ensure_head(
        &self,
        chain_id: &str,
        start_height: u64,
    ) -> Result<BlockchainHead, LedgerError>;

    async fn scanned_block(
        &self,
        chain_id: &str,
        height: u64,
    ) -> Result<Option<ScannedBlock>, LedgerError>;

    /// All scanned heights of a chain, ascending.
    async fn scanned_heights(&self, chain_id: &str) -> Result<Vec<u64>, LedgerError>;

    /// Atomically upsert `block`, queue its transactions and move the head to it.
    ///
    /// Transactions already queued are skipped, except mempool-only rows,
    /// which are replaced by the block version with a fresh retry counter.
    /// Returns the txids that were (re)queued.
    async fn commit_block(
        &self,
        block: ScannedBlock,
        transactions: Vec<UnparsedTransaction>,
    ) -> Result<Vec<String>, LedgerError>;

    async fn update_fee(&self, chain_id: &str, avg_fee: u64) -> Result<(), LedgerError>;

    /// Drop everything recorded above `ancestor` and move the head to it.
    ///
    /// With `ancestor = None` every scanned block is dropped and the head
    /// returns, unsynced, to the lowest scanned height.
    async fn rollback_to(
        &self,
        chain_id: &str,
        ancestor: Option<u64>,
    ) -> Result<RollbackSummary, LedgerError>;

    // ── Unparsed transactions ─────────────────────────────────────────────

    /// Insert if absent. Returns `true` if the row was created.
    async fn insert_unparsed(&self, tx: UnparsedTransaction) -> Result<bool, LedgerError>;

    async fn unparsed(
        &self,
        chain_id: &str,
        txid: &str,
    ) -> Result<Option<UnparsedTransaction>, LedgerError>;

    /// Delete a row that decoded to nothing watched. A row that has since
    /// moved off `block_hash` is left in place for its new job.
    async fn discard_unparsed(
        &self,
        chain_id: &str,
        txid: &str,
        block_hash: Option<&str>,
    ) -> Result<(), LedgerError>;

    /// Flag rows whose first parse job was just published. Rows that already
    /// failed once are skipped; the sweep owns those. Returns rows flagged.
    async fn mark_queued(
        &self,
        chain_id: &str,
        txids: &[String],
        at: i64,
    ) -> Result<usize, LedgerError>;

    /// Clear the queued flag after a publish that did not go through.
    async fn release_job(&self, chain_id: &str, txid: &str) -> Result<(), LedgerError>;

    /// Increment the retry counter, stamp `at` and clear the queued flag.
    /// Returns the new count.
    async fn record_parse_failure(
        &self,
        chain_id: &str,
        txid: &str,
        at: i64,
    ) -> Result<u32, LedgerError>;

    /// Rows still eligible for parsing that have no job in the work lane and
    /// were last touched before `older_than`. They are flagged as queued with
    /// `queued_at` reset to now.
    async fn take_stale_unparsed(
        &self,
        chain_id: &str,
        max_retry: u32,
        older_than: i64,
        limit: usize,
    ) -> Result<Vec<UnparsedTransaction>, LedgerError>;

    /// Rows that exhausted their retries, left for operational inspection.
    async fn abandoned_unparsed(
        &self,
        chain_id: &str,
        max_retry: u32,
    ) -> Result<Vec<UnparsedTransaction>, LedgerError>;

    // ── Parse inputs & outputs ────────────────────────────────────────────

    /// Watched addresses of `chain_id` among `candidates`.
    async fn watched_addresses(
        &self,
        chain_id: &str,
        candidates: &[String],
    ) -> Result<Vec<Address>, LedgerError>;

    async fn addresses_by_id(&self, address_ids: &[String]) -> Result<Vec<Address>, LedgerError>;

    /// Watched outputs among `outpoints` that are unspent or already spent by
    /// `spender` (a redelivered job must see the same inputs again).
    async fn spendable_utxos(
        &self,
        chain_id: &str,
        outpoints: &[OutPoint],
        spender: &str,
    ) -> Result<Vec<Utxo>, LedgerError>;

    /// Atomically apply one parsed transaction: upsert records and links,
    /// create and spend outputs, raise key high-water marks, recompute the
    /// touched balances and delete the unparsed row.
    ///
    /// Fails with [`LedgerError::StaleParse`], writing nothing, unless the
    /// unparsed row still exists with `effects.block_hash`.
    async fn apply_parse(&self, effects: ParseEffects) -> Result<(), LedgerError>;

    /// Set `result` on pending records at or below `up_to_height`.
    async fn confirm_transactions(
        &self,
        chain_id: &str,
        up_to_height: u64,
    ) -> Result<u64, LedgerError>;

    /// Txids among `candidates` already queued or recorded.
    async fn known_txids(
        &self,
        chain_id: &str,
        candidates: &[String],
    ) -> Result<HashSet<String>, LedgerError>;

    async fn latest_pending_snapshot(
        &self,
        chain_id: &str,
    ) -> Result<Option<PendingSnapshot>, LedgerError>;

    /// Upsert on `(chain_id, block_height_asked)`.
    async fn save_pending_snapshot(&self, snapshot: PendingSnapshot) -> Result<(), LedgerError>;

    /// Recompute every balance of the chain from its links. Returns rows updated.
    async fn recompute_balances(&self, chain_id: &str) -> Result<usize, LedgerError>;

    // ── Accounts ──────────────────────────────────────────────────────────

    async fn insert_account(&self, account: Account) -> Result<(), LedgerError>;

    async fn account(&self, account_id: &str) -> Result<Option<Account>, LedgerError>;

    async fn account_currency(&self, id: &str) -> Result<Option<AccountCurrency>, LedgerError>;

    /// Create the ledger row if absent; existing rows are left untouched.
    async fn ensure_account_currency(
        &self,
        account_id: &str,
        currency_id: &str,
    ) -> Result<AccountCurrency, LedgerError>;

    async fn address_at(
        &self,
        account_id: &str,
        branch: KeyBranch,
        key_index: u32,
    ) -> Result<Option<Address>, LedgerError>;

    /// Insert if absent; returns the stored address for that slot.
    async fn insert_address(&self, address: Address) -> Result<Address, LedgerError>;

    // ── Read side ─────────────────────────────────────────────────────────

    async fn transactions(
        &self,
        chain_id: &str,
        txid: &str,
    ) -> Result<Vec<TransactionRecord>, LedgerError>;

    async fn transaction_count(&self, chain_id: &str) -> Result<usize, LedgerError>;

    async fn address_links(&self, address_id: &str) -> Result<Vec<AddressLink>, LedgerError>;

    /// Unspent outputs owned by `address_id`.
    async fn unspent_utxos(&self, address_id: &str) -> Result<Vec<Utxo>, LedgerError>;
}
