//! Scripted peer, toy decoder and fixtures for unit tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::amount::Amount;
use crate::decode::{DecodedInput, DecodedOutput, DecodedTransaction, Decoder};
use crate::error::LedgerError;
use crate::peer::{PeerAdapter, RawBlock, RawTransaction};
use crate::store::ChainStore;
use crate::types::{Account, Address, ChainModel, KeyBranch, OutPoint, UnparsedTransaction};

pub fn block(height: u64, hash: &str, parent: Option<&str>) -> RawBlock {
    RawBlock {
        height,
        hash: hash.to_string(),
        parent_hash: parent.map(str::to_string),
        timestamp: 1_700_000_000 + height as i64,
        transactions: vec![],
    }
}

/// A linked chain of empty blocks starting at `start`.
pub fn chain_of(start: u64, hashes: &[&str]) -> Vec<RawBlock> {
    hashes
        .iter()
        .enumerate()
        .map(|(i, hash)| {
            let parent = if i == 0 { None } else { Some(hashes[i - 1]) };
            block(start + i as u64, hash, parent)
        })
        .collect()
}

pub fn raw_tx(txid: &str) -> RawTransaction {
    RawTransaction {
        txid: txid.to_string(),
        payload: json!({ "txid": txid }),
    }
}

/// A transaction in the shape [`ToyUtxoDecoder`] reads.
pub fn utxo_tx(txid: &str, inputs: &[(&str, u32)], outputs: &[(&str, u128)]) -> RawTransaction {
    let vin: Vec<Value> = inputs
        .iter()
        .map(|(t, v)| json!({ "txid": t, "vout": v }))
        .collect();
    let vout: Vec<Value> = outputs
        .iter()
        .map(|(a, v)| json!({ "address": a, "value": v.to_string() }))
        .collect();
    RawTransaction {
        txid: txid.to_string(),
        payload: json!({ "txid": txid, "vin": vin, "vout": vout }),
    }
}

// ─── Scripted peer ───────────────────────────────────────────────────────────

struct Script {
    blocks: Vec<RawBlock>,
    unreachable: bool,
    fail_from: u64,
    delay: Duration,
    mempool: Option<Vec<RawTransaction>>,
    failing_txs: HashSet<String>,
    fee: Option<u64>,
}

/// A peer serving a fixed, swappable chain.
pub struct ScriptedPeer {
    script: Mutex<Script>,
}

impl ScriptedPeer {
    pub fn new(blocks: Vec<RawBlock>) -> Self {
        Self {
            script: Mutex::new(Script {
                blocks,
                unreachable: false,
                fail_from: u64::MAX,
                delay: Duration::ZERO,
                mempool: None,
                failing_txs: HashSet::new(),
                fee: None,
            }),
        }
    }

    pub fn set_chain(&self, blocks: Vec<RawBlock>) {
        self.script.lock().unwrap().blocks = blocks;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.script.lock().unwrap().unreachable = unreachable;
    }

    /// Block lookups at or above `height` time out.
    pub fn fail_blocks_from(&self, height: u64) {
        self.script.lock().unwrap().fail_from = height;
    }

    /// Delay applied to `chain_height`.
    pub fn set_delay(&self, delay: Duration) {
        self.script.lock().unwrap().delay = delay;
    }

    pub fn set_mempool(&self, txs: Vec<RawTransaction>) {
        self.script.lock().unwrap().mempool = Some(txs);
    }

    pub fn set_failing_tx(&self, txid: &str, failing: bool) {
        let mut s = self.script.lock().unwrap();
        if failing {
            s.failing_txs.insert(txid.to_string());
        } else {
            s.failing_txs.remove(txid);
        }
    }

    pub fn set_fee(&self, fee: Option<u64>) {
        self.script.lock().unwrap().fee = fee;
    }

    fn check(&self, height: Option<u64>) -> Result<(), LedgerError> {
        let s = self.script.lock().unwrap();
        if s.unreachable {
            return Err(LedgerError::PeerUnreachable("scripted".into()));
        }
        if height.map(|h| h >= s.fail_from).unwrap_or(false) {
            return Err(LedgerError::PeerTimeout { ms: 0 });
        }
        Ok(())
    }
}

#[async_trait]
impl PeerAdapter for ScriptedPeer {
    fn model(&self) -> ChainModel {
        ChainModel::Utxo
    }

    async fn chain_height(&self) -> Result<u64, LedgerError> {
        let delay = self.script.lock().unwrap().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check(None)?;
        let s = self.script.lock().unwrap();
        Ok(s.blocks.last().map(|b| b.height).unwrap_or(0))
    }

    async fn block_hash(&self, height: u64) -> Result<Option<String>, LedgerError> {
        self.check(Some(height))?;
        let s = self.script.lock().unwrap();
        Ok(s.blocks
            .iter()
            .find(|b| b.height == height)
            .map(|b| b.hash.clone()))
    }

    async fn block_by_hash(&self, hash: &str) -> Result<RawBlock, LedgerError> {
        let found = {
            let s = self.script.lock().unwrap();
            s.blocks.iter().find(|b| b.hash == hash).cloned()
        };
        let block = found.ok_or_else(|| LedgerError::PeerRpc {
            code: -5,
            message: format!("Block not found: {hash}"),
        })?;
        self.check(Some(block.height))?;
        Ok(block)
    }

    async fn fee_estimate(&self, _height: u64) -> Result<Option<u64>, LedgerError> {
        Ok(self.script.lock().unwrap().fee)
    }

    async fn mempool_txids(&self) -> Result<Option<Vec<String>>, LedgerError> {
        let s = self.script.lock().unwrap();
        Ok(s.mempool
            .as_ref()
            .map(|txs| txs.iter().map(|t| t.txid.clone()).collect()))
    }

    async fn transaction(&self, txid: &str) -> Result<Option<RawTransaction>, LedgerError> {
        let s = self.script.lock().unwrap();
        if s.failing_txs.contains(txid) {
            return Err(LedgerError::PeerTimeout { ms: 0 });
        }
        Ok(s.mempool
            .as_ref()
            .and_then(|txs| txs.iter().find(|t| t.txid == txid).cloned()))
    }
}

// ─── Toy decoder ─────────────────────────────────────────────────────────────

/// Reads `{"vin": [{"txid", "vout"}], "vout": [{"address", "value"}]}` with
/// integer base-unit values. A `"broken": true` payload fails to decode.
pub struct ToyUtxoDecoder;

impl Decoder for ToyUtxoDecoder {
    fn model(&self) -> ChainModel {
        ChainModel::Utxo
    }

    fn native_currency(&self) -> &str {
        "btc"
    }

    fn decode(&self, tx: &UnparsedTransaction) -> Result<DecodedTransaction, LedgerError> {
        let p = &tx.raw_payload;
        if p.get("broken").and_then(Value::as_bool).unwrap_or(false) {
            return Err(LedgerError::Decode(format!("broken payload for {}", tx.txid)));
        }
        let inputs = p
            .get("vin")
            .and_then(Value::as_array)
            .map(|vin| {
                vin.iter()
                    .filter_map(|i| {
                        Some(DecodedInput {
                            outpoint: OutPoint::new(i.get("txid")?.as_str()?, i.get("vout")?.as_u64()? as u32),
                            address: None,
                            amount: None,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut outputs = Vec::new();
        if let Some(vout) = p.get("vout").and_then(Value::as_array) {
            for (n, o) in vout.iter().enumerate() {
                let amount = o
                    .get("value")
                    .and_then(Value::as_str)
                    .and_then(|v| v.parse::<Amount>().ok())
                    .ok_or_else(|| LedgerError::Decode(format!("bad value in {}", tx.txid)))?;
                outputs.push(DecodedOutput {
                    vout: n as u32,
                    address: o.get("address").and_then(Value::as_str).map(str::to_string),
                    amount,
                    script: String::new(),
                    script_type: "toy".into(),
                });
            }
        }
        Ok(DecodedTransaction {
            txid: tx.txid.clone(),
            block_height: tx.block_height,
            timestamp: tx.timestamp,
            inputs,
            outputs,
            transfers: vec![],
            fee: Amount::ZERO,
            outcome: None,
        })
    }
}

// ─── Store fixtures ──────────────────────────────────────────────────────────

/// Register `address` as external key `index` of `account_id`.
pub async fn watch(
    store: &dyn ChainStore,
    chain_id: &str,
    account_id: &str,
    address: &str,
    index: u32,
) -> Address {
    store
        .insert_account(Account {
            account_id: account_id.to_string(),
            chain_id: chain_id.to_string(),
            extended_public_key: format!("xpub-{account_id}"),
        })
        .await
        .unwrap();
    store
        .insert_address(Address {
            address_id: Address::id_for(account_id, KeyBranch::External, index),
            account_id: account_id.to_string(),
            chain_id: chain_id.to_string(),
            branch: KeyBranch::External,
            key_index: index,
            address: address.to_string(),
            public_key: format!("pk-{address}"),
        })
        .await
        .unwrap()
}
