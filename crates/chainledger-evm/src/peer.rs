//! Ethereum JSON-RPC peer adapter.
//!
//! Uses `eth_getBlockByNumber` for canonical hashes and `eth_getBlockByHash`
//! with full transaction objects for block bodies. With receipts enabled,
//! each transaction payload gains a `receipt` object carrying execution
//! status and gas used; receipts for one block are fetched concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value};

use chainledger_core::error::LedgerError;
use chainledger_core::peer::{PeerAdapter, RawBlock, RawTransaction};
use chainledger_core::types::ChainModel;
use chainledger_rpc::{JsonRpcVersion, RpcClient, RpcError, RpcTransport};

use crate::command::EvmCommand;

/// [`PeerAdapter`] for Ethereum-family nodes.
pub struct EvmPeer {
    client: RpcClient,
    fetch_receipts: bool,
}

impl EvmPeer {
    pub fn new(transport: Arc<dyn RpcTransport>, timeout: Duration) -> Self {
        Self {
            client: RpcClient::new(transport, JsonRpcVersion::V2, timeout),
            fetch_receipts: false,
        }
    }

    pub fn with_receipts(mut self, enabled: bool) -> Self {
        self.fetch_receipts = enabled;
        self
    }

    pub fn url(&self) -> &str {
        self.client.url()
    }

    async fn call(&self, cmd: EvmCommand<'_>) -> Result<Value, RpcError> {
        self.client.call_value(cmd.method(), cmd.params()).await
    }

    async fn attach_receipts(&self, transactions: &mut [RawTransaction]) -> Result<(), LedgerError> {
        let receipts = join_all(
            transactions
                .iter()
                .map(|t| self.call(EvmCommand::TransactionReceipt(&t.txid))),
        )
        .await;
        for (tx, receipt) in transactions.iter_mut().zip(receipts) {
            let receipt = receipt?;
            if receipt.is_null() {
                continue;
            }
            if let Value::Object(obj) = &mut tx.payload {
                obj.insert("receipt".into(), receipt);
            }
        }
        Ok(())
    }
}

/// Parse a hex quantity (`"0x1b4"`) to u64.
pub fn parse_hex_u64(s: &str) -> Result<u64, LedgerError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|_| LedgerError::Decode(format!("invalid hex quantity '{s}'")))
}

fn hex_field(v: &Value, name: &str) -> Result<u64, LedgerError> {
    let s = v
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| LedgerError::Decode(format!("block is missing '{name}'")))?;
    parse_hex_u64(s)
}

/// Turn an `eth_getBlockByHash(.., true)` result into a [`RawBlock`].
pub fn block_from_json(v: &Value) -> Result<RawBlock, LedgerError> {
    let hash = v
        .get("hash")
        .and_then(Value::as_str)
        .ok_or_else(|| LedgerError::Decode("block is missing 'hash'".into()))?
        .to_string();
    let height = hex_field(v, "number")?;
    let timestamp = hex_field(v, "timestamp")? as i64;
    let parent_hash = v.get("parentHash").and_then(Value::as_str).map(String::from);

    let txs = v
        .get("transactions")
        .and_then(Value::as_array)
        .ok_or_else(|| LedgerError::Decode(format!("block {hash} has no transaction list")))?;
    let mut transactions = Vec::with_capacity(txs.len());
    for tx in txs {
        let Value::Object(obj) = tx else {
            return Err(LedgerError::Decode(format!(
                "block {hash} returned hashes only; full transactions are required"
            )));
        };
        let txid = obj
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::Decode(format!("transaction without hash in block {hash}")))?
            .to_string();
        let payload: Map<String, Value> = obj.clone();
        transactions.push(RawTransaction {
            txid,
            payload: Value::Object(payload),
        });
    }

    Ok(RawBlock {
        height,
        hash,
        parent_hash,
        timestamp,
        transactions,
    })
}

#[async_trait]
impl PeerAdapter for EvmPeer {
    fn model(&self) -> ChainModel {
        ChainModel::Account
    }

    async fn chain_height(&self) -> Result<u64, LedgerError> {
        let v = self.call(EvmCommand::BlockNumber).await?;
        let s = v
            .as_str()
            .ok_or_else(|| LedgerError::Decode(format!("eth_blockNumber returned {v}")))?;
        parse_hex_u64(s)
    }

    async fn block_hash(&self, height: u64) -> Result<Option<String>, LedgerError> {
        let v = self.call(EvmCommand::BlockByNumber(height)).await?;
        if v.is_null() {
            return Ok(None);
        }
        Ok(v.get("hash").and_then(Value::as_str).map(String::from))
    }

    async fn block_by_hash(&self, hash: &str) -> Result<RawBlock, LedgerError> {
        let v = self.call(EvmCommand::BlockByHash(hash)).await?;
        if v.is_null() {
            return Err(LedgerError::Decode(format!("peer does not know block {hash}")));
        }
        let mut block = block_from_json(&v)?;
        if self.fetch_receipts {
            self.attach_receipts(&mut block.transactions).await?;
        }
        Ok(block)
    }
}
