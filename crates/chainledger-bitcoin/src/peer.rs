//! Bitcoin Core peer adapter.
//!
//! Speaks JSON-RPC 1.0 to `bitcoind`. Blocks are fetched at verbosity 2 and
//! every transaction object is stamped with its block context before it
//! leaves the adapter, so the parser never has to query the node again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use chainledger_core::error::LedgerError;
use chainledger_core::peer::{PeerAdapter, RawBlock, RawTransaction};
use chainledger_core::types::ChainModel;
use chainledger_rpc::{JsonRpcVersion, RpcClient, RpcError, RpcTransport};

use crate::command::{BitcoinCommand, RPC_INVALID_ADDRESS_OR_KEY, RPC_INVALID_PARAMETER};

/// Fee rate reported when a block carries no percentile data.
const DEFAULT_FEE_RATE: u64 = 1;

/// [`PeerAdapter`] for Bitcoin-family nodes.
pub struct BitcoinPeer {
    client: RpcClient,
}

impl BitcoinPeer {
    pub fn new(transport: Arc<dyn RpcTransport>, timeout: Duration) -> Self {
        Self {
            client: RpcClient::new(transport, JsonRpcVersion::V1, timeout),
        }
    }

    pub fn url(&self) -> &str {
        self.client.url()
    }

    async fn call<T: DeserializeOwned>(&self, cmd: BitcoinCommand<'_>) -> Result<T, RpcError> {
        self.client.call(cmd.method(), cmd.params()).await
    }
}

fn field<'a>(v: &'a Value, name: &str) -> Result<&'a Value, LedgerError> {
    v.get(name)
        .ok_or_else(|| LedgerError::Decode(format!("block is missing '{name}'")))
}

/// Turn a verbosity-2 `getblock` result into a [`RawBlock`].
pub fn block_from_json(v: &Value) -> Result<RawBlock, LedgerError> {
    let hash = field(v, "hash")?
        .as_str()
        .ok_or_else(|| LedgerError::Decode("block hash is not a string".into()))?
        .to_string();
    let height = field(v, "height")?
        .as_u64()
        .ok_or_else(|| LedgerError::Decode(format!("block {hash} has no numeric height")))?;
    let timestamp = field(v, "time")?.as_i64().unwrap_or_default();
    let confirmations = v.get("confirmations").and_then(Value::as_i64).unwrap_or(1);
    let parent_hash = v
        .get("previousblockhash")
        .and_then(Value::as_str)
        .map(String::from);

    let txs = field(v, "tx")?
        .as_array()
        .ok_or_else(|| LedgerError::Decode(format!("block {hash} tx list is not an array")))?;
    let mut transactions = Vec::with_capacity(txs.len());
    for tx in txs {
        let Value::Object(obj) = tx else {
            return Err(LedgerError::Decode(format!(
                "block {hash} returned txids only; verbosity 2 is required"
            )));
        };
        let txid = obj
            .get("txid")
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::Decode(format!("transaction without txid in block {hash}")))?
            .to_string();
        let mut payload: Map<String, Value> = obj.clone();
        payload.insert("blockhash".into(), Value::from(hash.clone()));
        payload.insert("height".into(), Value::from(height));
        payload.insert("blocktime".into(), Value::from(timestamp));
        payload.insert("confirmations".into(), Value::from(confirmations));
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
impl PeerAdapter for BitcoinPeer {
    fn model(&self) -> ChainModel {
        ChainModel::Utxo
    }

    async fn chain_height(&self) -> Result<u64, LedgerError> {
        Ok(self.call(BitcoinCommand::BlockCount).await?)
    }

    async fn block_hash(&self, height: u64) -> Result<Option<String>, LedgerError> {
        match self.call(BitcoinCommand::BlockHash(height)).await {
            Ok(hash) => Ok(Some(hash)),
            Err(e) if e.code() == Some(RPC_INVALID_PARAMETER) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn block_by_hash(&self, hash: &str) -> Result<RawBlock, LedgerError> {
        let v: Value = self.call(BitcoinCommand::Block(hash)).await?;
        block_from_json(&v)
    }

    async fn fee_estimate(&self, height: u64) -> Result<Option<u64>, LedgerError> {
        let stats: Value = self.call(BitcoinCommand::BlockStats(height)).await?;
        let median = stats
            .get("feerate_percentiles")
            .and_then(|p| p.get(2))
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_FEE_RATE);
        Ok(Some(median))
    }

    async fn mempool_txids(&self) -> Result<Option<Vec<String>>, LedgerError> {
        Ok(Some(self.call(BitcoinCommand::RawMempool).await?))
    }

    async fn transaction(&self, txid: &str) -> Result<Option<RawTransaction>, LedgerError> {
        match self.call::<Value>(BitcoinCommand::RawTransaction(txid)).await {
            Ok(payload) => Ok(Some(RawTransaction {
                txid: txid.to_string(),
                payload,
            })),
            // Mined or evicted between getrawmempool and this call.
            Err(e) if e.code() == Some(RPC_INVALID_ADDRESS_OR_KEY) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainledger_rpc::MockTransport;
    use serde_json::json;

    fn peer(mock: &Arc<MockTransport>) -> BitcoinPeer {
        BitcoinPeer::new(mock.clone(), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn height_out_of_range_is_none() {
        let mock = Arc::new(MockTransport::new());
        mock.on("getblockhash", vec![json!(5)], json!("00aa"));
        mock.on_error("getblockhash", vec![json!(6)], -8, "Block height out of range");
        let p = peer(&mock);
        assert_eq!(p.block_hash(5).await.unwrap().as_deref(), Some("00aa"));
        assert_eq!(p.block_hash(6).await.unwrap(), None);
        assert_eq!(mock.requests()[0].jsonrpc, "1.0");
    }

    #[tokio::test]
    async fn block_transactions_are_annotated() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            "getblock",
            vec![json!("00bb"), json!(2)],
            json!({
                "hash": "00bb", "height": 7, "time": 1_700_000_007,
                "confirmations": 3, "previousblockhash": "00aa",
                "tx": [{ "txid": "t1", "vin": [], "vout": [] }]
            }),
        );
        let block = peer(&mock).block_by_hash("00bb").await.unwrap();
        assert_eq!(block.height, 7);
        assert!(block.extends("00aa"));
        let tx = &block.transactions[0].payload;
        assert_eq!(tx["blockhash"], "00bb");
        assert_eq!(tx["height"], 7);
        assert_eq!(tx["blocktime"], 1_700_000_007);
        assert_eq!(tx["confirmations"], 3);
    }

    #[test]
    fn txid_only_blocks_are_rejected() {
        let v = json!({ "hash": "00bb", "height": 7, "time": 1, "tx": ["t1"] });
        assert!(matches!(block_from_json(&v), Err(LedgerError::Decode(_))));
    }

    #[tokio::test]
    async fn fee_uses_median_percentile() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            "getblockstats",
            vec![json!(10), json!(["feerate_percentiles"])],
            json!({ "feerate_percentiles": [1, 3, 12, 30, 90] }),
        );
        mock.on(
            "getblockstats",
            vec![json!(11), json!(["feerate_percentiles"])],
            json!({}),
        );
        let p = peer(&mock);
        assert_eq!(p.fee_estimate(10).await.unwrap(), Some(12));
        assert_eq!(p.fee_estimate(11).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn evicted_mempool_tx_is_none() {
        let mock = Arc::new(MockTransport::new());
        mock.on("getrawmempool", vec![json!(false)], json!(["a", "b"]));
        mock.on_error(
            "getrawtransaction",
            vec![json!("a"), json!(true)],
            -5,
            "No such mempool or blockchain transaction",
        );
        let p = peer(&mock);
        assert_eq!(p.mempool_txids().await.unwrap().unwrap().len(), 2);
        assert!(p.transaction("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreachable_node_maps_to_peer_error() {
        let mock = Arc::new(MockTransport::new());
        mock.set_down(true);
        let err = peer(&mock).chain_height().await.unwrap_err();
        assert!(matches!(err, LedgerError::PeerUnreachable(_)));
    }
}
