//! Bitcoin Core RPC requests as `(method, params)` pairs.

use serde_json::{json, Value};

/// `getblockhash` error code for a height beyond the tip.
pub const RPC_INVALID_PARAMETER: i64 = -8;
/// `getrawtransaction` error code for a txid the node does not know.
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

/// One bitcoind call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitcoinCommand<'a> {
    BlockCount,
    BlockHash(u64),
    /// `getblock` at verbosity 2: header plus decoded transactions.
    Block(&'a str),
    BlockStats(u64),
    RawMempool,
    RawTransaction(&'a str),
}

impl BitcoinCommand<'_> {
    pub fn method(&self) -> &'static str {
        match self {
            Self::BlockCount => "getblockcount",
            Self::BlockHash(_) => "getblockhash",
            Self::Block(_) => "getblock",
            Self::BlockStats(_) => "getblockstats",
            Self::RawMempool => "getrawmempool",
            Self::RawTransaction(_) => "getrawtransaction",
        }
    }

    pub fn params(&self) -> Vec<Value> {
        match self {
            Self::BlockCount => vec![],
            Self::BlockHash(height) => vec![json!(height)],
            Self::Block(hash) => vec![json!(hash), json!(2)],
            Self::BlockStats(height) => vec![json!(height), json!(["feerate_percentiles"])],
            Self::RawMempool => vec![json!(false)],
            Self::RawTransaction(txid) => vec![json!(txid), json!(true)],
        }
    }
}
