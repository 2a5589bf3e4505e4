//! Decoding rules for Ethereum transaction objects.
//!
//! Every transaction yields a native transfer first (possibly of zero value,
//! so gas paid by a watched sender is still recorded). Calls to configured
//! token contracts additionally yield a token transfer when the calldata is
//! an ERC-20 `transfer` or `transferFrom`.
//!
//! Addresses are lowercased; watched addresses are stored the same way.

use std::collections::HashMap;

use serde_json::Value;

use chainledger_core::amount::Amount;
use chainledger_core::config::TokenConfig;
use chainledger_core::decode::{DecodedTransaction, Decoder, Transfer};
use chainledger_core::error::LedgerError;
use chainledger_core::types::{ChainModel, TxKind, TxOutcome, UnparsedTransaction};

/// `transfer(address,uint256)`
pub const TRANSFER_SELECTOR: &str = "a9059cbb";
/// `transferFrom(address,address,uint256)`
pub const TRANSFER_FROM_SELECTOR: &str = "23b872dd";

/// Hex digits in one ABI word.
const WORD: usize = 64;

/// [`Decoder`] for account-model chains.
#[derive(Debug, Clone)]
pub struct AccountDecoder {
    currency_id: String,
    /// Lowercased contract address → currency id.
    tokens: HashMap<String, String>,
}

impl AccountDecoder {
    pub fn new(currency_id: impl Into<String>) -> Self {
        Self {
            currency_id: currency_id.into(),
            tokens: HashMap::new(),
        }
    }

    pub fn with_tokens(mut self, tokens: &[TokenConfig]) -> Self {
        for t in tokens {
            self.tokens
                .insert(t.contract.to_lowercase(), t.currency_id.clone());
        }
        self
    }

    pub fn with_token(mut self, currency_id: impl Into<String>, contract: &str) -> Self {
        self.tokens.insert(contract.to_lowercase(), currency_id.into());
        self
    }

    fn token_transfer(
        &self,
        contract: &str,
        sender: &str,
        input: &str,
        txid: &str,
    ) -> Result<Option<Transfer>, LedgerError> {
        let Some(currency_id) = self.tokens.get(contract) else {
            return Ok(None);
        };
        let data = input.strip_prefix("0x").unwrap_or(input);
        if !data.is_ascii() {
            return Err(LedgerError::Decode(format!("{txid}: calldata is not hex")));
        }
        if data.len() < 8 {
            return Ok(None);
        }
        let (selector, args) = data.split_at(8);
        let (from, to, amount) = match selector.to_ascii_lowercase().as_str() {
            TRANSFER_SELECTOR => (
                sender.to_string(),
                word_address(args, 0, txid)?,
                word_amount(args, 1, txid)?,
            ),
            TRANSFER_FROM_SELECTOR => (
                word_address(args, 0, txid)?,
                word_address(args, 1, txid)?,
                word_amount(args, 2, txid)?,
            ),
            _ => return Ok(None),
        };
        Ok(Some(Transfer {
            currency_id: currency_id.clone(),
            kind: TxKind::Token {
                contract: contract.to_string(),
            },
            from,
            to,
            amount,
        }))
    }
}

fn word<'a>(args: &'a str, index: usize, txid: &str) -> Result<&'a str, LedgerError> {
    args.get(index * WORD..(index + 1) * WORD)
        .ok_or_else(|| LedgerError::Decode(format!("{txid}: token calldata too short")))
}

/// The low 20 bytes of an ABI word, as a lowercased address.
fn word_address(args: &str, index: usize, txid: &str) -> Result<String, LedgerError> {
    let w = word(args, index, txid)?;
    Ok(format!("0x{}", w[WORD - 40..].to_ascii_lowercase()))
}

fn word_amount(args: &str, index: usize, txid: &str) -> Result<Amount, LedgerError> {
    let w = word(args, index, txid)?;
    let (high, low) = w.split_at(WORD / 2);
    if high.chars().any(|c| c != '0') {
        return Err(LedgerError::Decode(format!("{txid}: token amount exceeds 128 bits")));
    }
    Amount::from_hex(low)
}

fn lower(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str).map(str::to_lowercase)
}

fn hex_amount(v: Option<&Value>) -> Result<Option<Amount>, LedgerError> {
    v.and_then(Value::as_str).map(Amount::from_hex).transpose()
}

impl Decoder for AccountDecoder {
    fn model(&self) -> ChainModel {
        ChainModel::Account
    }

    fn native_currency(&self) -> &str {
        &self.currency_id
    }

    fn decode(&self, tx: &UnparsedTransaction) -> Result<DecodedTransaction, LedgerError> {
        let p = &tx.raw_payload;
        let txid = tx.txid.as_str();
        let from = lower(p.get("from"))
            .ok_or_else(|| LedgerError::Decode(format!("{txid}: missing sender")))?;
        let receipt = p.get("receipt").filter(|r| r.is_object());
        // Contract creation has no `to`; the receipt names the new contract.
        let to = lower(p.get("to"))
            .or_else(|| lower(receipt.and_then(|r| r.get("contractAddress"))))
            .unwrap_or_default();
        let value = hex_amount(p.get("value"))?.unwrap_or(Amount::ZERO);

        let outcome = match receipt.and_then(|r| r.get("status")).and_then(Value::as_str) {
            Some("0x1") => Some(TxOutcome::Success),
            Some("0x0") => Some(TxOutcome::Failed),
            Some(other) => {
                return Err(LedgerError::Decode(format!("{txid}: unknown receipt status '{other}'")))
            }
            None => None,
        };
        let fee = match receipt {
            Some(r) => {
                let gas_used = hex_amount(r.get("gasUsed"))?.unwrap_or(Amount::ZERO);
                let price = match hex_amount(r.get("effectiveGasPrice"))? {
                    Some(price) => price,
                    None => hex_amount(p.get("gasPrice"))?.unwrap_or(Amount::ZERO),
                };
                gas_used
                    .units()
                    .checked_mul(price.units())
                    .map(Amount::new)
                    .ok_or_else(|| LedgerError::Decode(format!("{txid}: fee overflows")))?
            }
            None => Amount::ZERO,
        };

        let mut transfers = vec![Transfer {
            currency_id: self.currency_id.clone(),
            kind: TxKind::Native,
            from: from.clone(),
            to: to.clone(),
            amount: value,
        }];
        if let Some(input) = p.get("input").and_then(Value::as_str) {
            if let Some(token) = self.token_transfer(&to, &from, input, txid)? {
                transfers.push(token);
            }
        }

        Ok(DecodedTransaction {
            txid: tx.txid.clone(),
            block_height: tx.block_height,
            timestamp: tx.timestamp,
            inputs: Vec::new(),
            outputs: Vec::new(),
            transfers,
            fee,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const USDT: &str = "0xdAC17F958D2ee523a2206206994597C13D831ec7";

    fn row(payload: Value) -> UnparsedTransaction {
        UnparsedTransaction::new("80000060", "0xt", payload, Some((16, "0xb16".into())), 1_700_000_000)
    }

    fn pad(hex: &str) -> String {
        format!("{hex:0>64}")
    }

    fn decoder() -> AccountDecoder {
        AccountDecoder::new("eth").with_token("usdt", USDT)
    }

    #[test]
    fn native_transfer_with_receipt() {
        let d = decoder()
            .decode(&row(json!({
                "from": "0xAbC", "to": "0xDeF", "value": "0xde0b6b3a7640000",
                "gasPrice": "0x4a817c800",
                "receipt": { "status": "0x1", "gasUsed": "0x5208", "effectiveGasPrice": "0x3b9aca00" }
            })))
            .unwrap();
        assert_eq!(d.transfers.len(), 1);
        let t = &d.transfers[0];
        assert_eq!((t.from.as_str(), t.to.as_str()), ("0xabc", "0xdef"));
        assert_eq!(t.amount, Amount::new(1_000_000_000_000_000_000));
        assert_eq!(d.fee, Amount::new(21_000 * 1_000_000_000));
        assert_eq!(d.outcome, Some(TxOutcome::Success));
    }

    #[test]
    fn without_receipt_fee_and_status_are_unknown() {
        let d = decoder()
            .decode(&row(json!({ "from": "0xa", "to": "0xb", "value": "0x0", "gasPrice": "0x1" })))
            .unwrap();
        assert_eq!(d.fee, Amount::ZERO);
        assert_eq!(d.outcome, None);
    }

    #[test]
    fn erc20_transfer_and_transfer_from() {
        let input = format!("0x{TRANSFER_SELECTOR}{}{}", pad("00000000000000000000000011aa"), pad("f4240"));
        let d = decoder()
            .decode(&row(json!({ "from": "0xSender", "to": USDT, "value": "0x0", "input": input })))
            .unwrap();
        assert_eq!(d.transfers.len(), 2);
        let token = &d.transfers[1];
        assert_eq!(token.currency_id, "usdt");
        assert_eq!(token.kind, TxKind::Token { contract: USDT.to_lowercase() });
        assert_eq!(token.from, "0xsender");
        assert_eq!(token.to, format!("0x{:0>40}", "11aa"));
        assert_eq!(token.amount, Amount::new(1_000_000));

        let input = format!(
            "0x{TRANSFER_FROM_SELECTOR}{}{}{}",
            pad("aa"),
            pad("bb"),
            pad("64")
        );
        let d = decoder()
            .decode(&row(json!({ "from": "0xspender", "to": USDT, "value": "0x0", "input": input })))
            .unwrap();
        let token = &d.transfers[1];
        assert_eq!(token.from, format!("0x{:0>40}", "aa"));
        assert_eq!(token.to, format!("0x{:0>40}", "bb"));
        assert_eq!(token.amount, Amount::new(100));
    }

    #[test]
    fn unknown_contracts_and_selectors_are_native_only() {
        let input = format!("0x{TRANSFER_SELECTOR}{}{}", pad("aa"), pad("1"));
        let d = decoder()
            .decode(&row(json!({ "from": "0xa", "to": "0xnottoken", "value": "0x0", "input": input })))
            .unwrap();
        assert_eq!(d.transfers.len(), 1);

        let d = decoder()
            .decode(&row(json!({ "from": "0xa", "to": USDT, "value": "0x0", "input": "0x095ea7b3" })))
            .unwrap();
        assert_eq!(d.transfers.len(), 1);
    }

    #[test]
    fn malformed_payloads_are_decode_errors() {
        let short = format!("0x{TRANSFER_SELECTOR}{}", pad("aa"));
        let cases = [
            json!({ "to": "0xb", "value": "0x0" }),
            json!({ "from": "0xa", "to": "0xb", "value": "0xnothex" }),
            json!({ "from": "0xa", "to": USDT, "value": "0x0", "input": short }),
            json!({ "from": "0xa", "to": "0xb", "value": "0x0", "receipt": { "status": "0x2" } }),
        ];
        for payload in cases {
            assert!(matches!(decoder().decode(&row(payload)), Err(LedgerError::Decode(_))));
        }
    }

    #[test]
    fn contract_creation_uses_receipt_address() {
        let d = decoder()
            .decode(&row(json!({
                "from": "0xa", "to": null, "value": "0x0", "input": "0x6080",
                "receipt": { "status": "0x1", "gasUsed": "0x1", "contractAddress": "0xNEW" }
            })))
            .unwrap();
        assert_eq!(d.transfers[0].to, "0xnew");
    }
}
