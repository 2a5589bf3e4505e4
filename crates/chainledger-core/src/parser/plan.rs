//! Effect planning: turn a decoded transaction into ledger rows.
//!
//! Planning is pure. The parser gathers the watched addresses and spendable
//! outputs a transaction touches, calls [`plan_effects`], and hands the
//! resulting [`ParseEffects`] to the store, which applies it atomically.
//!
//! Per-address amounts are nets: an address that both funds and receives
//! change from one transaction gets a single link carrying the difference.
//! Summing links per account therefore reproduces the unspent-output total
//! on UTXO chains.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::amount::Amount;
use crate::decode::DecodedTransaction;
use crate::store::ParseEffects;
use crate::types::{
    Address, AddressLink, ChainModel, Direction, TransactionRecord, TxKind, TxOutcome, Utxo,
};

/// Everything `plan_effects` needs to know about one transaction.
pub struct PlanInput<'a> {
    pub chain_id: &'a str,
    /// Block of the unparsed row being planned.
    pub block_hash: Option<&'a str>,
    pub model: ChainModel,
    pub native_currency: &'a str,
    pub decoded: &'a DecodedTransaction,
    /// Watched addresses mentioned by the transaction or owning `spendable`.
    pub watched: &'a [Address],
    /// Watched outputs consumed by the transaction's inputs.
    pub spendable: &'a [Utxo],
    /// Whether the containing block is past the confirmation depth.
    pub confirmed: bool,
}

/// Plan the ledger effects of a transaction. `None` if it touches nothing watched.
pub fn plan_effects(input: &PlanInput<'_>) -> Option<ParseEffects> {
    match input.model {
        ChainModel::Utxo => plan_utxo(input),
        ChainModel::Account => plan_account(input),
    }
}

#[derive(Default, Clone, Copy)]
struct Flow {
    incoming: Amount,
    outgoing: Amount,
}

impl Flow {
    fn link(&self) -> (Direction, Amount) {
        if self.incoming >= self.outgoing {
            (Direction::In, self.incoming.saturating_sub(self.outgoing))
        } else {
            (Direction::Out, self.outgoing.saturating_sub(self.incoming))
        }
    }
}

fn result_for(input: &PlanInput<'_>) -> Option<TxOutcome> {
    if input.confirmed && input.decoded.block_height.is_some() {
        Some(input.decoded.outcome.unwrap_or(TxOutcome::Success))
    } else {
        None
    }
}

// ─── UTXO model ──────────────────────────────────────────────────────────────

fn plan_utxo(input: &PlanInput<'_>) -> Option<ParseEffects> {
    let tx = input.decoded;
    let by_address: HashMap<&str, &Address> =
        input.watched.iter().map(|a| (a.address.as_str(), a)).collect();
    let by_id: HashMap<&str, &Address> =
        input.watched.iter().map(|a| (a.address_id.as_str(), a)).collect();

    let inputs: BTreeSet<String> = tx.inputs.iter().map(|i| i.outpoint.utxo_id()).collect();
    let spent: Vec<&Utxo> = input
        .spendable
        .iter()
        .filter(|u| inputs.contains(&u.utxo_id))
        .collect();

    let mut flows: BTreeMap<String, Flow> = BTreeMap::new();
    for u in &spent {
        let f = flows.entry(u.address_id.clone()).or_default();
        f.outgoing = f.outgoing.saturating_add(u.amount);
    }

    let mut created = Vec::new();
    let mut paid_watched = Amount::ZERO;
    let mut paid_external = Amount::ZERO;
    for out in &tx.outputs {
        let owner = out.address.as_deref().and_then(|a| by_address.get(a));
        match owner {
            Some(addr) => {
                paid_watched = paid_watched.saturating_add(out.amount);
                let f = flows.entry(addr.address_id.clone()).or_default();
                f.incoming = f.incoming.saturating_add(out.amount);
                created.push(Utxo {
                    utxo_id: format!("{}:{}", tx.txid, out.vout),
                    chain_id: input.chain_id.to_string(),
                    address_id: addr.address_id.clone(),
                    txid: tx.txid.clone(),
                    vout: out.vout,
                    amount: out.amount,
                    script: out.script.clone(),
                    script_type: out.script_type.clone(),
                    block_height: tx.block_height,
                    block_timestamp: tx.timestamp,
                    spent_by: None,
                });
            }
            None => paid_external = paid_external.saturating_add(out.amount),
        }
    }

    if flows.is_empty() {
        return None;
    }

    let (direction, amount) = if spent.is_empty() {
        (Direction::In, paid_watched)
    } else if paid_external.is_zero() {
        (Direction::Internal, paid_watched)
    } else {
        (Direction::Out, paid_external)
    };

    let fee = if !tx.fee.is_zero() {
        tx.fee
    } else if !tx.inputs.is_empty() && spent.len() == tx.inputs.len() {
        // Every input is ours, so the input total is known.
        let spent_total: Amount = spent.iter().map(|u| u.amount).sum();
        spent_total.saturating_sub(paid_watched.saturating_add(paid_external))
    } else {
        Amount::ZERO
    };

    let mut sources: Vec<String> = tx.inputs.iter().filter_map(|i| i.address.clone()).collect();
    sources.extend(
        spent
            .iter()
            .filter_map(|u| by_id.get(u.address_id.as_str()).map(|a| a.address.clone())),
    );
    sources.sort();
    sources.dedup();
    let destinations: Vec<String> = tx.outputs.iter().filter_map(|o| o.address.clone()).collect();

    let links = flows
        .iter()
        .map(|(address_id, flow)| {
            let (direction, amount) = flow.link();
            AddressLink {
                chain_id: input.chain_id.to_string(),
                currency_id: input.native_currency.to_string(),
                address_id: address_id.clone(),
                txid: tx.txid.clone(),
                amount,
                direction,
            }
        })
        .collect();

    let record = TransactionRecord {
        chain_id: input.chain_id.to_string(),
        txid: tx.txid.clone(),
        currency_id: input.native_currency.to_string(),
        kind: TxKind::Native,
        amount,
        fee,
        block_height: tx.block_height,
        timestamp: tx.timestamp,
        direction,
        outcome: tx.outcome,
        result: result_for(input),
        source_addresses: sources,
        destination_addresses: destinations,
    };

    Some(ParseEffects {
        chain_id: input.chain_id.to_string(),
        txid: tx.txid.clone(),
        block_hash: input.block_hash.map(str::to_string),
        records: vec![record],
        links,
        created_utxos: created,
        spent_utxos: spent.iter().map(|u| u.utxo_id.clone()).collect(),
    })
}

// ─── Account model ───────────────────────────────────────────────────────────

struct RecordDraft {
    kind: TxKind,
    amount: Amount,
    sends: bool,
    receives: bool,
    sources: BTreeSet<String>,
    destinations: BTreeSet<String>,
}

fn plan_account(input: &PlanInput<'_>) -> Option<ParseEffects> {
    let tx = input.decoded;
    let by_address: HashMap<&str, &Address> =
        input.watched.iter().map(|a| (a.address.as_str(), a)).collect();
    let failed = tx.outcome == Some(TxOutcome::Failed);

    let mut flows: BTreeMap<(String, String), Flow> = BTreeMap::new();
    let mut drafts: BTreeMap<String, RecordDraft> = BTreeMap::new();

    for t in &tx.transfers {
        let from = by_address.get(t.from.as_str());
        let to = by_address.get(t.to.as_str());
        if from.is_none() && to.is_none() {
            continue;
        }

        // A failed call still burns gas but moves no value.
        let value = if failed { Amount::ZERO } else { t.amount };
        let is_native = t.kind == TxKind::Native;

        if let Some(addr) = from {
            let debit = if is_native { value.saturating_add(tx.fee) } else { value };
            let f = flows
                .entry((t.currency_id.clone(), addr.address_id.clone()))
                .or_default();
            f.outgoing = f.outgoing.saturating_add(debit);
        }
        if let Some(addr) = to {
            let f = flows
                .entry((t.currency_id.clone(), addr.address_id.clone()))
                .or_default();
            f.incoming = f.incoming.saturating_add(value);
        }

        let draft = drafts.entry(t.currency_id.clone()).or_insert_with(|| RecordDraft {
            kind: t.kind.clone(),
            amount: Amount::ZERO,
            sends: false,
            receives: false,
            sources: BTreeSet::new(),
            destinations: BTreeSet::new(),
        });
        draft.amount = draft.amount.saturating_add(t.amount);
        draft.sends |= from.is_some();
        draft.receives |= to.is_some();
        draft.sources.insert(t.from.clone());
        draft.destinations.insert(t.to.clone());
    }

    if flows.is_empty() {
        return None;
    }

    let result = result_for(input);
    let records = drafts
        .into_iter()
        .map(|(currency_id, d)| TransactionRecord {
            chain_id: input.chain_id.to_string(),
            txid: tx.txid.clone(),
            currency_id,
            kind: d.kind,
            amount: d.amount,
            fee: tx.fee,
            block_height: tx.block_height,
            timestamp: tx.timestamp,
            direction: match (d.sends, d.receives) {
                (true, true) => Direction::Internal,
                (true, false) => Direction::Out,
                _ => Direction::In,
            },
            outcome: tx.outcome,
            result,
            source_addresses: d.sources.into_iter().collect(),
            destination_addresses: d.destinations.into_iter().collect(),
        })
        .collect();

    let links = flows
        .iter()
        .map(|((currency_id, address_id), flow)| {
            let (direction, amount) = flow.link();
            AddressLink {
                chain_id: input.chain_id.to_string(),
                currency_id: currency_id.clone(),
                address_id: address_id.clone(),
                txid: tx.txid.clone(),
                amount,
                direction,
            }
        })
        .collect();

    Some(ParseEffects {
        chain_id: input.chain_id.to_string(),
        txid: tx.txid.clone(),
        block_hash: input.block_hash.map(str::to_string),
        records,
        links,
        created_utxos: Vec::new(),
        spent_utxos: Vec::new(),
    })
}
