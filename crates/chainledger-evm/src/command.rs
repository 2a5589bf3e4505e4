//! Ethereum JSON-RPC requests as `(method, params)` pairs.

use serde_json::{json, Value};

/// One `eth_*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvmCommand<'a> {
    BlockNumber,
    /// Header only; used to read the canonical hash at a height.
    BlockByNumber(u64),
    /// Full transaction objects.
    BlockByHash(&'a str),
    TransactionReceipt(&'a str),
}

impl EvmCommand<'_> {
    pub fn method(&self) -> &'static str {
        match self {
            Self::BlockNumber => "eth_blockNumber",
            Self::BlockByNumber(_) => "eth_getBlockByNumber",
            Self::BlockByHash(_) => "eth_getBlockByHash",
            Self::TransactionReceipt(_) => "eth_getTransactionReceipt",
        }
    }

    pub fn params(&self) -> Vec<Value> {
        match self {
            Self::BlockNumber => vec![],
            Self::BlockByNumber(height) => vec![json!(format!("0x{height:x}")), json!(false)],
            Self::BlockByHash(hash) => vec![json!(hash), json!(true)],
            Self::TransactionReceipt(hash) => vec![json!(hash)],
        }
    }
}
