//! In-memory chain store for tests and ephemeral pipelines.
//!
//! All state sits behind one mutex, so every trait call is atomic.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::amount::Amount;
use crate::error::LedgerError;
use crate::store::{ChainStore, ParseEffects, RollbackSummary};
use crate::types::{
    Account, AccountCurrency, Address, AddressLink, BlockchainHead, Direction, KeyBranch,
    OutPoint, PendingSnapshot, ScannedBlock, TransactionRecord, TxOutcome, UnparsedTransaction,
    Utxo,
};

type ChainKey = (String, String);

#[derive(Default)]
struct State {
    heads: HashMap<String, BlockchainHead>,
    blocks: BTreeMap<(String, u64), ScannedBlock>,
    unparsed: BTreeMap<ChainKey, UnparsedTransaction>,
    /// Keyed by (chain_id, txid, currency_id).
    records: BTreeMap<(String, String, String), TransactionRecord>,
    /// Keyed by (currency_id, address_id, txid).
    links: BTreeMap<(String, String, String), AddressLink>,
    /// Keyed by (chain_id, utxo_id).
    utxos: BTreeMap<ChainKey, Utxo>,
    snapshots: BTreeMap<(String, u64), PendingSnapshot>,
    accounts: HashMap<String, Account>,
    ledgers: HashMap<String, AccountCurrency>,
    addresses: BTreeMap<String, Address>,
}

impl State {
    fn ensure_ledger(&mut self, account_id: &str, currency_id: &str) -> &mut AccountCurrency {
        self.ledgers
            .entry(AccountCurrency::id_for(account_id, currency_id))
            .or_insert_with(|| AccountCurrency::new(account_id, currency_id))
    }

    /// Balance = Σ incoming link amounts − Σ outgoing, over the account's addresses.
    fn recompute(&mut self, account_id: &str, currency_id: &str) {
        let mut incoming = Amount::ZERO;
        let mut outgoing = Amount::ZERO;
        for link in self.links.values().filter(|l| l.currency_id == currency_id) {
            let owned = self
                .addresses
                .get(&link.address_id)
                .map(|a| a.account_id == account_id)
                .unwrap_or(false);
            if !owned {
                continue;
            }
            match link.direction {
                Direction::Out => outgoing = outgoing.saturating_add(link.amount),
                _ => incoming = incoming.saturating_add(link.amount),
            }
        }
        self.ensure_ledger(account_id, currency_id).balance = incoming.saturating_sub(outgoing);
    }

    fn owner_of(&self, address_id: &str) -> Option<(String, KeyBranch, u32)> {
        self.addresses
            .get(address_id)
            .map(|a| (a.account_id.clone(), a.branch, a.key_index))
    }
}

/// In-memory [`ChainStore`].
#[derive(Default)]
pub struct MemoryChainStore {
    state: Mutex<State>,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Store("memory store poisoned".into()))
    }
}

#[async_trait]
impl ChainStore for MemoryChainStore {
    async fn head(&self, chain_id: &str) -> Result<Option<BlockchainHead>, LedgerError> {
        Ok(self.lock()?.heads.get(chain_id).cloned())
    }

    async fn ensure_head(
        &self,
        chain_id: &str,
        start_height: u64,
    ) -> Result<BlockchainHead, LedgerError> {
        Ok(self
            .lock()?
            .heads
            .entry(chain_id.to_string())
            .or_insert_with(|| BlockchainHead::unsynced(chain_id, start_height))
            .clone())
    }

    async fn scanned_block(
        &self,
        chain_id: &str,
        height: u64,
    ) -> Result<Option<ScannedBlock>, LedgerError> {
        Ok(self.lock()?.blocks.get(&(chain_id.to_string(), height)).cloned())
    }

    async fn scanned_heights(&self, chain_id: &str) -> Result<Vec<u64>, LedgerError> {
        Ok(self
            .lock()?
            .blocks
            .keys()
            .filter(|(c, _)| c == chain_id)
            .map(|(_, h)| *h)
            .collect())
    }

    async fn commit_block(
        &self,
        block: ScannedBlock,
        transactions: Vec<UnparsedTransaction>,
    ) -> Result<Vec<String>, LedgerError> {
        let mut state = self.lock()?;
        let chain_id = block.chain_id.clone();
        if let Some(head) = state.heads.get(&chain_id) {
            if head.next_height() != block.height {
                return Err(LedgerError::Store(format!(
                    "block {} does not follow head {} of chain {chain_id}",
                    block.height, head.height
                )));
            }
        }

        let mut queued = Vec::new();
        for tx in transactions {
            let key = (chain_id.clone(), tx.txid.clone());
            let replace = match state.unparsed.get(&key) {
                Some(existing) => existing.is_pending(),
                None => true,
            };
            if replace {
                queued.push(tx.txid.clone());
                state.unparsed.insert(key, tx);
            }
        }

        let head = state
            .heads
            .entry(chain_id.clone())
            .or_insert_with(|| BlockchainHead::unsynced(&chain_id, block.height));
        head.height = block.height;
        head.block_hash = Some(block.block_hash.clone());
        head.updated_at = chrono::Utc::now().timestamp();

        state.blocks.insert((chain_id, block.height), block);
        Ok(queued)
    }

    async fn update_fee(&self, chain_id: &str, avg_fee: u64) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        let head = state
            .heads
            .get_mut(chain_id)
            .ok_or_else(|| LedgerError::Store(format!("no head for chain {chain_id}")))?;
        head.avg_fee = Some(avg_fee);
        Ok(())
    }

    async fn rollback_to(
        &self,
        chain_id: &str,
        ancestor: Option<u64>,
    ) -> Result<RollbackSummary, LedgerError> {
        let mut state = self.lock()?;
        let from_height = state.heads.get(chain_id).map(|h| h.height).unwrap_or(0);
        let lowest = state
            .blocks
            .keys()
            .filter(|(c, _)| c == chain_id)
            .map(|(_, h)| *h)
            .min();
        let above = |h: Option<u64>| match (h, ancestor) {
            (Some(h), Some(a)) => h > a,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let doomed_blocks: Vec<(String, u64)> = state
            .blocks
            .keys()
            .filter(|(c, h)| c == chain_id && above(Some(*h)))
            .cloned()
            .collect();
        for key in &doomed_blocks {
            state.blocks.remove(key);
        }

        let doomed_records: Vec<(String, String, String)> = state
            .records
            .iter()
            .filter(|((c, _, _), r)| c == chain_id && above(r.block_height))
            .map(|(k, _)| k.clone())
            .collect();
        let doomed_txids: HashSet<String> =
            doomed_records.iter().map(|(_, txid, _)| txid.clone()).collect();
        for key in &doomed_records {
            state.records.remove(key);
        }

        let doomed_links: Vec<(String, String, String)> = state
            .links
            .iter()
            .filter(|(_, l)| l.chain_id == chain_id && doomed_txids.contains(&l.txid))
            .map(|(k, _)| k.clone())
            .collect();
        let mut affected: BTreeSet<(String, String)> = BTreeSet::new();
        for key in &doomed_links {
            if let Some(link) = state.links.remove(key) {
                if let Some((account_id, _, _)) = state.owner_of(&link.address_id) {
                    affected.insert((account_id, link.currency_id));
                }
            }
        }

        let mut utxos_restored = 0;
        let mut doomed_utxos = Vec::new();
        for (key, utxo) in state.utxos.iter_mut().filter(|((c, _), _)| c == chain_id) {
            if doomed_txids.contains(&utxo.txid) {
                doomed_utxos.push(key.clone());
            } else if utxo
                .spent_by
                .as_ref()
                .map(|s| doomed_txids.contains(s))
                .unwrap_or(false)
            {
                utxo.spent_by = None;
                utxos_restored += 1;
            }
        }
        for key in &doomed_utxos {
            state.utxos.remove(key);
        }

        let doomed_unparsed: Vec<ChainKey> = state
            .unparsed
            .iter()
            .filter(|((c, _), tx)| c == chain_id && above(tx.block_height))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed_unparsed {
            state.unparsed.remove(key);
        }

        let new_head = match ancestor {
            Some(a) => state
                .blocks
                .get(&(chain_id.to_string(), a))
                .map(|b| (a, Some(b.block_hash.clone())))
                .or(Some((a + 1, None))),
            None => lowest.map(|h| (h, None)),
        };
        let to_height = match &new_head {
            Some((height, Some(_))) => Some(*height),
            _ => None,
        };
        if let Some((height, hash)) = new_head {
            if let Some(head) = state.heads.get_mut(chain_id) {
                head.height = height;
                head.block_hash = hash;
                head.updated_at = chrono::Utc::now().timestamp();
            }
        }

        for (account_id, currency_id) in affected {
            state.recompute(&account_id, &currency_id);
        }

        Ok(RollbackSummary {
            chain_id: chain_id.to_string(),
            from_height,
            to_height,
            blocks_removed: doomed_blocks.len(),
            transactions_removed: doomed_txids.len(),
            utxos_removed: doomed_utxos.len(),
            utxos_restored,
            unparsed_removed: doomed_unparsed.len(),
        })
    }

    async fn insert_unparsed(&self, tx: UnparsedTransaction) -> Result<bool, LedgerError> {
        let mut state = self.lock()?;
        let key = (tx.chain_id.clone(), tx.txid.clone());
        if state.unparsed.contains_key(&key) {
            return Ok(false);
        }
        state.unparsed.insert(key, tx);
        Ok(true)
    }

    async fn unparsed(
        &self,
        chain_id: &str,
        txid: &str,
    ) -> Result<Option<UnparsedTransaction>, LedgerError> {
        Ok(self
            .lock()?
            .unparsed
            .get(&(chain_id.to_string(), txid.to_string()))
            .cloned())
    }

    async fn discard_unparsed(
        &self,
        chain_id: &str,
        txid: &str,
        block_hash: Option<&str>,
    ) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        let key = (chain_id.to_string(), txid.to_string());
        if state
            .unparsed
            .get(&key)
            .is_some_and(|row| row.block_hash.as_deref() == block_hash)
        {
            state.unparsed.remove(&key);
        }
        Ok(())
    }

    async fn mark_queued(
        &self,
        chain_id: &str,
        txids: &[String],
        at: i64,
    ) -> Result<usize, LedgerError> {
        let mut state = self.lock()?;
        let mut marked = 0;
        for txid in txids {
            if let Some(row) = state.unparsed.get_mut(&(chain_id.to_string(), txid.clone())) {
                if !row.job_queued && row.last_retry_at.is_none() {
                    row.job_queued = true;
                    row.queued_at = at;
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    async fn release_job(&self, chain_id: &str, txid: &str) -> Result<(), LedgerError> {
        if let Some(row) = self
            .lock()?
            .unparsed
            .get_mut(&(chain_id.to_string(), txid.to_string()))
        {
            row.job_queued = false;
        }
        Ok(())
    }

    async fn record_parse_failure(
        &self,
        chain_id: &str,
        txid: &str,
        at: i64,
    ) -> Result<u32, LedgerError> {
        let mut state = self.lock()?;
        let row = state
            .unparsed
            .get_mut(&(chain_id.to_string(), txid.to_string()))
            .ok_or_else(|| LedgerError::Store(format!("unparsed {txid} not found")))?;
        row.retry_count += 1;
        row.last_retry_at = Some(at);
        row.job_queued = false;
        Ok(row.retry_count)
    }

    async fn take_stale_unparsed(
        &self,
        chain_id: &str,
        max_retry: u32,
        older_than: i64,
        limit: usize,
    ) -> Result<Vec<UnparsedTransaction>, LedgerError> {
        let mut state = self.lock()?;
        let now = chrono::Utc::now().timestamp();
        let mut stale: Vec<&mut UnparsedTransaction> = state
            .unparsed
            .iter_mut()
            .filter(|((c, _), tx)| {
                c == chain_id
                    && !tx.job_queued
                    && tx.retry_count < max_retry
                    && tx.last_touched_at() < older_than
            })
            .map(|(_, tx)| tx)
            .collect();
        stale.sort_by_key(|tx| (tx.block_height.unwrap_or(u64::MAX), tx.last_touched_at()));
        Ok(stale
            .into_iter()
            .take(limit)
            .map(|tx| {
                tx.queued_at = now;
                tx.job_queued = true;
                tx.clone()
            })
            .collect())
    }

    async fn abandoned_unparsed(
        &self,
        chain_id: &str,
        max_retry: u32,
    ) -> Result<Vec<UnparsedTransaction>, LedgerError> {
        Ok(self
            .lock()?
            .unparsed
            .iter()
            .filter(|((c, _), tx)| c == chain_id && tx.is_abandoned(max_retry))
            .map(|(_, tx)| tx.clone())
            .collect())
    }

    async fn watched_addresses(
        &self,
        chain_id: &str,
        candidates: &[String],
    ) -> Result<Vec<Address>, LedgerError> {
        let wanted: HashSet<&str> = candidates.iter().map(String::as_str).collect();
        Ok(self
            .lock()?
            .addresses
            .values()
            .filter(|a| a.chain_id == chain_id && wanted.contains(a.address.as_str()))
            .cloned()
            .collect())
    }

    async fn addresses_by_id(&self, address_ids: &[String]) -> Result<Vec<Address>, LedgerError> {
        let state = self.lock()?;
        Ok(address_ids
            .iter()
            .filter_map(|id| state.addresses.get(id).cloned())
            .collect())
    }

    async fn spendable_utxos(
        &self,
        chain_id: &str,
        outpoints: &[OutPoint],
        spender: &str,
    ) -> Result<Vec<Utxo>, LedgerError> {
        let state = self.lock()?;
        Ok(outpoints
            .iter()
            .filter_map(|op| state.utxos.get(&(chain_id.to_string(), op.utxo_id())))
            .filter(|u| u.spent_by.as_deref().map(|s| s == spender).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn apply_parse(&self, effects: ParseEffects) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        let chain_id = effects.chain_id.clone();

        let source = (chain_id.clone(), effects.txid.clone());
        match state.unparsed.get(&source) {
            Some(row) if row.block_hash == effects.block_hash => {}
            _ => {
                return Err(LedgerError::StaleParse {
                    txid: effects.txid.clone(),
                })
            }
        }

        // Validate before mutating so a failure leaves nothing behind.
        let mut owners = Vec::with_capacity(effects.links.len());
        for link in &effects.links {
            let owner = state.owner_of(&link.address_id).ok_or_else(|| {
                LedgerError::Store(format!("unknown address {}", link.address_id))
            })?;
            owners.push((owner, link.currency_id.clone()));
        }

        for mut record in effects.records {
            let key = (chain_id.clone(), record.txid.clone(), record.currency_id.clone());
            if let Some(existing) = state.records.get(&key) {
                if record.block_height.is_none() && existing.block_height.is_some() {
                    record.block_height = existing.block_height;
                    record.timestamp = existing.timestamp;
                }
                if record.result.is_none() && record.block_height == existing.block_height {
                    record.result = existing.result;
                }
            }
            state.records.insert(key, record);
        }

        for link in effects.links {
            let key = (link.currency_id.clone(), link.address_id.clone(), link.txid.clone());
            state.links.insert(key, link);
        }

        for utxo in effects.created_utxos {
            let key = (chain_id.clone(), utxo.utxo_id.clone());
            match state.utxos.get_mut(&key) {
                Some(existing) => {
                    existing.block_height = utxo.block_height.or(existing.block_height);
                    existing.block_timestamp = utxo.block_timestamp;
                }
                None => {
                    state.utxos.insert(key, utxo);
                }
            }
        }

        for utxo_id in &effects.spent_utxos {
            if let Some(utxo) = state.utxos.get_mut(&(chain_id.clone(), utxo_id.clone())) {
                if utxo.spent_by.is_none() {
                    utxo.spent_by = Some(effects.txid.clone());
                }
            }
        }

        for ((account_id, branch, index), currency_id) in &owners {
            state
                .ensure_ledger(account_id, currency_id)
                .raise_key_count(*branch, index + 1);
        }
        let touched: BTreeSet<(String, String)> = owners
            .into_iter()
            .map(|((account_id, _, _), currency_id)| (account_id, currency_id))
            .collect();
        for (account_id, currency_id) in touched {
            state.recompute(&account_id, &currency_id);
        }

        state.unparsed.remove(&source);
        Ok(())
    }

    async fn confirm_transactions(
        &self,
        chain_id: &str,
        up_to_height: u64,
    ) -> Result<u64, LedgerError> {
        let mut state = self.lock()?;
        let mut confirmed = 0;
        for record in state.records.values_mut().filter(|r| {
            r.chain_id == chain_id
                && r.result.is_none()
                && r.block_height.map(|h| h <= up_to_height).unwrap_or(false)
        }) {
            record.result = Some(record.outcome.unwrap_or(TxOutcome::Success));
            confirmed += 1;
        }
        Ok(confirmed)
    }

    async fn known_txids(
        &self,
        chain_id: &str,
        candidates: &[String],
    ) -> Result<HashSet<String>, LedgerError> {
        let state = self.lock()?;
        let recorded: HashSet<&str> = state
            .records
            .keys()
            .filter(|(c, _, _)| c == chain_id)
            .map(|(_, txid, _)| txid.as_str())
            .collect();
        Ok(candidates
            .iter()
            .filter(|txid| {
                recorded.contains(txid.as_str())
                    || state
                        .unparsed
                        .contains_key(&(chain_id.to_string(), txid.to_string()))
            })
            .cloned()
            .collect())
    }

    async fn latest_pending_snapshot(
        &self,
        chain_id: &str,
    ) -> Result<Option<PendingSnapshot>, LedgerError> {
        Ok(self
            .lock()?
            .snapshots
            .iter()
            .filter(|((c, _), _)| c == chain_id)
            .map(|(_, s)| s)
            .max_by_key(|s| (s.timestamp, s.block_height_asked))
            .cloned())
    }

    async fn save_pending_snapshot(&self, snapshot: PendingSnapshot) -> Result<(), LedgerError> {
        self.lock()?.snapshots.insert(
            (snapshot.chain_id.clone(), snapshot.block_height_asked),
            snapshot,
        );
        Ok(())
    }

    async fn recompute_balances(&self, chain_id: &str) -> Result<usize, LedgerError> {
        let mut state = self.lock()?;
        let ledgers: Vec<(String, String)> = state
            .ledgers
            .values()
            .filter(|l| {
                state
                    .accounts
                    .get(&l.account_id)
                    .map(|a| a.chain_id == chain_id)
                    .unwrap_or(false)
            })
            .map(|l| (l.account_id.clone(), l.currency_id.clone()))
            .collect();
        for (account_id, currency_id) in &ledgers {
            state.recompute(account_id, currency_id);
        }
        Ok(ledgers.len())
    }

    async fn insert_account(&self, account: Account) -> Result<(), LedgerError> {
        self.lock()?
            .accounts
            .insert(account.account_id.clone(), account);
        Ok(())
    }

    async fn account(&self, account_id: &str) -> Result<Option<Account>, LedgerError> {
        Ok(self.lock()?.accounts.get(account_id).cloned())
    }

    async fn account_currency(&self, id: &str) -> Result<Option<AccountCurrency>, LedgerError> {
        Ok(self.lock()?.ledgers.get(id).cloned())
    }

    async fn ensure_account_currency(
        &self,
        account_id: &str,
        currency_id: &str,
    ) -> Result<AccountCurrency, LedgerError> {
        Ok(self.lock()?.ensure_ledger(account_id, currency_id).clone())
    }

    async fn address_at(
        &self,
        account_id: &str,
        branch: KeyBranch,
        key_index: u32,
    ) -> Result<Option<Address>, LedgerError> {
        Ok(self
            .lock()?
            .addresses
            .get(&Address::id_for(account_id, branch, key_index))
            .cloned())
    }

    async fn insert_address(&self, address: Address) -> Result<Address, LedgerError> {
        Ok(self
            .lock()?
            .addresses
            .entry(address.address_id.clone())
            .or_insert(address)
            .clone())
    }

    async fn transactions(
        &self,
        chain_id: &str,
        txid: &str,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        Ok(self
            .lock()?
            .records
            .iter()
            .filter(|((c, t, _), _)| c == chain_id && t == txid)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn transaction_count(&self, chain_id: &str) -> Result<usize, LedgerError> {
        Ok(self
            .lock()?
            .records
            .keys()
            .filter(|(c, _, _)| c == chain_id)
            .count())
    }

    async fn address_links(&self, address_id: &str) -> Result<Vec<AddressLink>, LedgerError> {
        Ok(self
            .lock()?
            .links
            .values()
            .filter(|l| l.address_id == address_id)
            .cloned()
            .collect())
    }

    async fn unspent_utxos(&self, address_id: &str) -> Result<Vec<Utxo>, LedgerError> {
        Ok(self
            .lock()?
            .utxos
            .values()
            .filter(|u| u.address_id == address_id && u.is_unspent())
            .cloned()
            .collect())
    }
}
