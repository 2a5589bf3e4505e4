//! The `Decoder` trait — chain-specific transaction decoding rules.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::error::LedgerError;
use crate::types::{ChainModel, OutPoint, TxKind, TxOutcome, UnparsedTransaction};

/// An output of a UTXO-model transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedOutput {
    pub vout: u32,
    /// Receiving address, `None` for non-standard scripts (e.g. OP_RETURN).
    pub address: Option<String>,
    pub amount: Amount,
    pub script: String,
    pub script_type: String,
}

/// A spent outpoint, with its owner and value when the peer reports them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedInput {
    pub outpoint: OutPoint,
    pub address: Option<String>,
    pub amount: Option<Amount>,
}

/// A value transfer between two accounts (account-model chains).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub currency_id: String,
    pub kind: TxKind,
    pub from: String,
    pub to: String,
    pub amount: Amount,
}

/// A transaction reduced to the value movements the ledger cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedTransaction {
    pub txid: String,
    pub block_height: Option<u64>,
    pub timestamp: i64,
    /// UTXO chains: consumed outpoints (coinbase inputs are skipped).
    pub inputs: Vec<DecodedInput>,
    /// UTXO chains: created outputs.
    pub outputs: Vec<DecodedOutput>,
    /// Account chains: native transfer first, then token transfers.
    pub transfers: Vec<Transfer>,
    /// Fee paid in the native currency, zero when unknown.
    pub fee: Amount,
    /// Chain status, `None` when the chain does not report one yet.
    pub outcome: Option<TxOutcome>,
}

impl DecodedTransaction {
    /// Every address this transaction mentions, for watched-address lookup.
    pub fn addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .inputs
            .iter()
            .filter_map(|i| i.address.clone())
            .chain(self.outputs.iter().filter_map(|o| o.address.clone()))
            .chain(
                self.transfers
                    .iter()
                    .flat_map(|t| [t.from.clone(), t.to.clone()]),
            )
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn spent_outpoints(&self) -> Vec<OutPoint> {
        self.inputs.iter().map(|i| i.outpoint.clone()).collect()
    }
}

/// Chain-family decoding rules.
pub trait Decoder: Send + Sync {
    fn model(&self) -> ChainModel;

    /// Currency id of the chain's native coin.
    fn native_currency(&self) -> &str;

    /// Decode a raw payload. A malformed or unrecognised shape is a
    /// [`LedgerError::Decode`], which the parser retries up to its limit.
    fn decode(&self, tx: &UnparsedTransaction) -> Result<DecodedTransaction, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_deduplicated() {
        let tx = DecodedTransaction {
            txid: "t".into(),
            block_height: None,
            timestamp: 0,
            inputs: vec![DecodedInput {
                outpoint: OutPoint::new("p", 0),
                address: Some("a".into()),
                amount: None,
            }],
            outputs: vec![DecodedOutput {
                vout: 0,
                address: Some("a".into()),
                amount: Amount(1),
                script: String::new(),
                script_type: "pubkeyhash".into(),
            }],
            transfers: vec![Transfer {
                currency_id: "eth".into(),
                kind: TxKind::Native,
                from: "b".into(),
                to: "a".into(),
                amount: Amount(1),
            }],
            fee: Amount::ZERO,
            outcome: None,
        };
        assert_eq!(tx.addresses(), vec!["a".to_string(), "b".to_string()]);
    }
}
