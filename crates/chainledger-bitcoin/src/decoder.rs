//! Decoding rules for Bitcoin Core transaction objects.
//!
//! Reads the verbose JSON shape shared by `getblock` (verbosity 2) and
//! `getrawtransaction` (verbose). Values are decimal coin amounts; they are
//! converted to satoshis without going through floating point.

use serde_json::Value;

use chainledger_core::amount::Amount;
use chainledger_core::decode::{DecodedInput, DecodedOutput, DecodedTransaction, Decoder};
use chainledger_core::error::LedgerError;
use chainledger_core::types::{ChainModel, OutPoint, UnparsedTransaction};

/// Satoshis per coin, as a power of ten.
pub const BTC_DECIMALS: u32 = 8;

/// [`Decoder`] for UTXO-model chains.
#[derive(Debug, Clone)]
pub struct UtxoDecoder {
    currency_id: String,
    decimals: u32,
}

impl UtxoDecoder {
    pub fn new(currency_id: impl Into<String>) -> Self {
        Self {
            currency_id: currency_id.into(),
            decimals: BTC_DECIMALS,
        }
    }

    /// Forks with a different coin precision.
    pub fn with_decimals(mut self, decimals: u32) -> Self {
        self.decimals = decimals;
        self
    }

    fn amount(&self, v: &Value, txid: &str) -> Result<Amount, LedgerError> {
        Amount::from_json_decimal(v, self.decimals)
            .map_err(|e| LedgerError::Decode(format!("{txid}: {e}")))
    }
}

/// Address of a `scriptPubKey`: the modern `address` field, or the first of
/// the legacy `addresses` list.
fn script_address(script: &Value) -> Option<String> {
    script
        .get("address")
        .and_then(Value::as_str)
        .or_else(|| {
            script
                .get("addresses")
                .and_then(|a| a.get(0))
                .and_then(Value::as_str)
        })
        .map(String::from)
}

impl UtxoDecoder {
    fn input(&self, vin: &Value, txid: &str) -> Result<Option<DecodedInput>, LedgerError> {
        if vin.get("coinbase").is_some() {
            return Ok(None);
        }
        let prev_txid = vin
            .get("txid")
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::Decode(format!("{txid}: input without txid")))?;
        let prev_vout = vin
            .get("vout")
            .and_then(Value::as_u64)
            .ok_or_else(|| LedgerError::Decode(format!("{txid}: input without vout")))?;
        let prev_vout = u32::try_from(prev_vout).map_err(|_| {
            LedgerError::Decode(format!("{txid}: input vout {prev_vout} out of range"))
        })?;

        // Present when the node runs with -txindex or at verbosity 3.
        let prevout = vin.get("prevout");
        let address = prevout
            .and_then(|p| p.get("scriptPubKey"))
            .and_then(script_address);
        let amount = prevout
            .and_then(|p| p.get("value"))
            .map(|v| self.amount(v, txid))
            .transpose()?;

        Ok(Some(DecodedInput {
            outpoint: OutPoint::new(prev_txid, prev_vout),
            address,
            amount,
        }))
    }

    fn output(&self, index: usize, vout: &Value, txid: &str) -> Result<DecodedOutput, LedgerError> {
        let n = vout.get("n").and_then(Value::as_u64).unwrap_or(index as u64);
        let n = u32::try_from(n)
            .map_err(|_| LedgerError::Decode(format!("{txid}: output index {n} out of range")))?;
        let value = vout
            .get("value")
            .ok_or_else(|| LedgerError::Decode(format!("{txid}: output {n} has no value")))?;
        let script = vout.get("scriptPubKey");
        let text = |name: &str| {
            script
                .and_then(|s| s.get(name))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Ok(DecodedOutput {
            vout: n,
            address: script.and_then(script_address),
            amount: self.amount(value, txid)?,
            script: text("hex"),
            script_type: text("type"),
        })
    }
}

impl Decoder for UtxoDecoder {
    fn model(&self) -> ChainModel {
        ChainModel::Utxo
    }

    fn native_currency(&self) -> &str {
        &self.currency_id
    }

    fn decode(&self, tx: &UnparsedTransaction) -> Result<DecodedTransaction, LedgerError> {
        let p = &tx.raw_payload;
        let txid = tx.txid.as_str();
        let vin = p
            .get("vin")
            .and_then(Value::as_array)
            .ok_or_else(|| LedgerError::Decode(format!("{txid}: missing vin")))?;
        let vout = p
            .get("vout")
            .and_then(Value::as_array)
            .ok_or_else(|| LedgerError::Decode(format!("{txid}: missing vout")))?;

        let mut inputs = Vec::with_capacity(vin.len());
        for i in vin {
            if let Some(input) = self.input(i, txid)? {
                inputs.push(input);
            }
        }
        let outputs = vout
            .iter()
            .enumerate()
            .map(|(index, o)| self.output(index, o, txid))
            .collect::<Result<Vec<_>, _>>()?;
        let fee = match p.get("fee") {
            Some(v) => self.amount(v, txid)?,
            None => Amount::ZERO,
        };

        Ok(DecodedTransaction {
            txid: tx.txid.clone(),
            block_height: tx.block_height,
            timestamp: tx.timestamp,
            inputs,
            outputs,
            transfers: Vec::new(),
            fee,
            outcome: None,
        })
    }
}
