//! End-to-end: scripted bitcoind → BitcoinPeer → Crawler → queue → Parser → store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use chainledger_bitcoin::{BitcoinPeer, UtxoDecoder};
use chainledger_core::amount::Amount;
use chainledger_core::crawler::{Crawler, CrawlerConfig};
use chainledger_core::decode::{DecodedTransaction, Decoder};
use chainledger_core::error::LedgerError;
use chainledger_core::parser::{Parser, ParserConfig};
use chainledger_core::queue::{work_lane, JobDescriptor, JobQueue, JobResult, JobStatus, MemoryJobQueue};
use chainledger_core::store::{ChainStore, MemoryChainStore};
use chainledger_core::types::{Account, Address, ChainModel, Direction, KeyBranch, UnparsedTransaction};
use chainledger_rpc::MockTransport;

const CHAIN: &str = "80000000";
const WATCHED: &str = "bc1qwatched";

// ─── Scripted node ───────────────────────────────────────────────────────────

struct Node {
    mock: Arc<MockTransport>,
}

impl Node {
    fn new() -> Self {
        let mock = Arc::new(MockTransport::new());
        mock.on_method("getblockstats", json!({ "feerate_percentiles": [1, 2, 5, 8, 13] }));
        mock.on("getrawmempool", vec![json!(false)], json!([]));
        Self { mock }
    }

    fn tip(&self, height: u64) {
        self.mock.on("getblockcount", vec![], json!(height));
    }

    fn block(&self, height: u64, hash: &str, parent: Option<&str>, txs: Vec<Value>) {
        self.mock.on("getblockhash", vec![json!(height)], json!(hash));
        let mut block = json!({
            "hash": hash,
            "height": height,
            "time": 1_700_000_000u64 + height,
            "confirmations": 1,
            "tx": txs,
        });
        if let Some(parent) = parent {
            block["previousblockhash"] = json!(parent);
        }
        self.mock.on("getblock", vec![json!(hash), json!(2)], block);
    }

    fn mempool(&self, txs: Vec<Value>) {
        let ids: Vec<Value> = txs.iter().map(|t| t["txid"].clone()).collect();
        for tx in txs {
            self.mock
                .on("getrawtransaction", vec![tx["txid"].clone(), json!(true)], tx);
        }
        self.mock.on("getrawmempool", vec![json!(false)], Value::from(ids));
    }
}

fn coinbase(txid: &str) -> Value {
    json!({
        "txid": txid,
        "vin": [{ "coinbase": "03a0bb0d" }],
        "vout": [{ "n": 0, "value": 3.125, "scriptPubKey": { "address": "bc1qminer", "type": "witness_v0_keyhash" } }]
    })
}

fn payment(txid: &str, spends: &[(&str, u32)], outputs: &[(&str, f64)]) -> Value {
    let vin: Vec<Value> = spends
        .iter()
        .map(|(t, v)| json!({ "txid": t, "vout": v }))
        .collect();
    let vout: Vec<Value> = outputs
        .iter()
        .enumerate()
        .map(|(n, (addr, value))| {
            json!({ "n": n, "value": value, "scriptPubKey": { "address": addr, "hex": "0014", "type": "witness_v0_keyhash" } })
        })
        .collect();
    json!({ "txid": txid, "vin": vin, "vout": vout, "fee": 0.00001 })
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

struct Pipeline {
    node: Node,
    store: Arc<MemoryChainStore>,
    queue: Arc<MemoryJobQueue>,
    crawler: Crawler,
    parser: Parser,
    address: Address,
}

async fn pipeline(start_height: u64, mempool: bool, max_retry: u32) -> Pipeline {
    let node = Node::new();
    let store = Arc::new(MemoryChainStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let peer = Arc::new(BitcoinPeer::new(node.mock.clone(), Duration::from_secs(1)));

    let mut crawler_config = CrawlerConfig::new(CHAIN);
    crawler_config.start_height = start_height;
    crawler_config.mempool = mempool;
    crawler_config.max_rollback_depth = 10;
    let crawler = Crawler::new(crawler_config, peer, store.clone(), queue.clone());

    let mut parser_config = ParserConfig::new(CHAIN);
    parser_config.max_retry = max_retry;
    parser_config.queue_timeout = Duration::from_millis(20);
    let parser = Parser::new(
        parser_config,
        store.clone(),
        queue.clone(),
        Arc::new(UtxoDecoder::new("btc")),
    );

    store
        .insert_account(Account {
            account_id: "acc".into(),
            chain_id: CHAIN.into(),
            extended_public_key: "xpub6watched".into(),
        })
        .await
        .unwrap();
    let address = store
        .insert_address(Address {
            address_id: Address::id_for("acc", KeyBranch::External, 0),
            account_id: "acc".into(),
            chain_id: CHAIN.into(),
            branch: KeyBranch::External,
            key_index: 0,
            address: WATCHED.into(),
            public_key: "02ab".into(),
        })
        .await
        .unwrap();

    Pipeline {
        node,
        store,
        queue,
        crawler,
        parser,
        address,
    }
}

impl Pipeline {
    async fn drain(&self) -> Vec<JobResult> {
        let mut results = Vec::new();
        while let Some(result) = self.parser.run_once().await.unwrap() {
            results.push(result);
        }
        results
    }

    async fn republish(&self, txid: &str, height: Option<u64>) {
        let job = JobDescriptor::new(CHAIN, txid, height);
        self.queue
            .publish(&work_lane(CHAIN), job.to_payload().unwrap())
            .await
            .unwrap();
    }

    async fn balance(&self) -> Amount {
        self.store
            .account_currency("acc/btc")
            .await
            .unwrap()
            .map(|l| l.balance)
            .unwrap_or(Amount::ZERO)
    }

    async fn unspent_total(&self) -> Amount {
        self.store
            .unspent_utxos(&self.address.address_id)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.amount)
            .sum()
    }
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn catches_up_two_blocks_without_watched_activity() {
    let p = pipeline(98, false, 3).await;
    p.node.block(98, "b98", Some("b97"), vec![coinbase("cb98")]);
    p.node.tip(98);
    p.crawler.run_cycle().await.unwrap();
    p.drain().await;

    p.node.block(99, "b99", Some("b98"), vec![coinbase("cb99")]);
    p.node.block(100, "b100", Some("b99"), vec![coinbase("cb100")]);
    p.node.tip(100);
    let report = p.crawler.run_cycle().await.unwrap();

    assert_eq!(report.local_height, Some(98));
    assert_eq!(report.blocks_committed, 2);
    assert_eq!(report.jobs_published, 2);
    assert_eq!(report.fee, Some(5));
    let head = p.store.head(CHAIN).await.unwrap().unwrap();
    assert_eq!((head.height, head.block_hash.as_deref()), (100, Some("b100")));
    assert_eq!(head.avg_fee, Some(5));
    assert_eq!(p.store.scanned_heights(CHAIN).await.unwrap(), vec![98, 99, 100]);

    let results = p.drain().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == JobStatus::Irrelevant));
    assert_eq!(p.store.transaction_count(CHAIN).await.unwrap(), 0);
}

#[tokio::test]
async fn rerunning_a_cycle_changes_nothing() {
    let p = pipeline(1, false, 3).await;
    p.node.block(1, "b1", None, vec![payment("f1", &[("ext", 0)], &[(WATCHED, 0.5)])]);
    p.node.tip(1);
    p.crawler.run_cycle().await.unwrap();
    p.drain().await;

    let again = p.crawler.run_cycle().await.unwrap();
    assert_eq!(again.blocks_committed, 0);
    assert_eq!(again.jobs_published, 0);
    assert_eq!(p.queue.depth(&work_lane(CHAIN)).await.unwrap(), 0);
    assert_eq!(p.store.scanned_heights(CHAIN).await.unwrap(), vec![1]);
    assert_eq!(p.store.transaction_count(CHAIN).await.unwrap(), 1);
    assert_eq!(p.store.unspent_utxos(&p.address.address_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn spending_half_a_coin_with_change_nets_the_balance() {
    let p = pipeline(1, false, 3).await;
    p.node.block(1, "b1", None, vec![payment("f1", &[("ext", 0)], &[(WATCHED, 0.5)])]);
    p.node.tip(1);
    p.crawler.run_cycle().await.unwrap();
    let results = p.drain().await;
    assert_eq!(results[0].status, JobStatus::Applied);
    assert_eq!(results[0].addresses, vec![WATCHED.to_string()]);
    assert_eq!(p.balance().await, Amount::new(50_000_000));

    p.node.block(
        2,
        "b2",
        Some("b1"),
        vec![payment("s1", &[("f1", 0)], &[(WATCHED, 0.3), ("bc1qshop", 0.19999)])],
    );
    p.node.tip(2);
    p.crawler.run_cycle().await.unwrap();
    p.drain().await;

    let unspent = p.store.unspent_utxos(&p.address.address_id).await.unwrap();
    assert_eq!(unspent.len(), 1);
    assert_eq!(unspent[0].utxo_id, "s1:0");
    assert_eq!(unspent[0].amount, Amount::new(30_000_000));
    assert_eq!(p.balance().await, Amount::new(30_000_000));
    assert_eq!(p.unspent_total().await, p.balance().await);

    let links = p.store.address_links(&p.address.address_id).await.unwrap();
    let spend = links.iter().find(|l| l.txid == "s1").unwrap();
    assert_eq!(spend.direction, Direction::Out);
    assert_eq!(spend.amount, Amount::new(20_000_000));
    let record = &p.store.transactions(CHAIN, "s1").await.unwrap()[0];
    assert_eq!(record.fee, Amount::new(1_000));

    let ledger = p.store.account_currency("acc/btc").await.unwrap().unwrap();
    assert_eq!(ledger.external_key_count, 1);
}

#[tokio::test]
async fn reorg_moves_payment_to_new_branch() {
    let p = pipeline(1, false, 3).await;
    p.node.block(1, "a1", None, vec![coinbase("cb1")]);
    p.node.block(2, "a2", Some("a1"), vec![coinbase("cb2")]);
    p.node.block(3, "a3", Some("a2"), vec![payment("pay", &[("ext", 1)], &[(WATCHED, 0.25)])]);
    p.node.tip(3);
    p.crawler.run_cycle().await.unwrap();
    p.drain().await;
    assert_eq!(p.balance().await, Amount::new(25_000_000));

    // The peer switches to a longer branch forking after height 2; the payment lands in b4.
    p.node.block(3, "b3", Some("a2"), vec![coinbase("cb3b")]);
    p.node.block(4, "b4", Some("b3"), vec![payment("pay", &[("ext", 1)], &[(WATCHED, 0.25)])]);
    p.node.tip(4);
    let report = p.crawler.run_cycle().await.unwrap();

    let reorg = report.reorg.expect("reorg resolved");
    assert_eq!(reorg.common_ancestor, Some(2));
    assert_eq!(reorg.depth, 1);
    assert_eq!(report.blocks_committed, 2);
    let head = p.store.head(CHAIN).await.unwrap().unwrap();
    assert_eq!((head.height, head.block_hash.as_deref()), (4, Some("b4")));
    assert_eq!(p.store.scanned_block(CHAIN, 3).await.unwrap().unwrap().block_hash, "b3");

    // Rolled back until the new branch is parsed.
    assert!(p.store.transactions(CHAIN, "pay").await.unwrap().is_empty());
    assert_eq!(p.balance().await, Amount::ZERO);

    p.drain().await;
    let record = &p.store.transactions(CHAIN, "pay").await.unwrap()[0];
    assert_eq!(record.block_height, Some(4));
    assert_eq!(p.balance().await, Amount::new(25_000_000));
    let unspent = p.store.unspent_utxos(&p.address.address_id).await.unwrap();
    assert_eq!(unspent.len(), 1);
    assert_eq!(unspent[0].block_height, Some(4));
}

#[tokio::test]
async fn undecodable_transaction_is_abandoned_at_max_retry() {
    let p = pipeline(1, false, 2).await;
    let broken = json!({ "txid": "bad", "vin": [{ "vout": 0 }], "vout": [] });
    p.node.block(1, "b1", None, vec![broken]);
    p.node.tip(1);
    p.crawler.run_cycle().await.unwrap();

    let first = p.drain().await;
    assert_eq!(first[0].status, JobStatus::Failed);
    assert_eq!(first[0].retry_count, 1);

    p.republish("bad", Some(1)).await;
    let second = p.drain().await;
    assert_eq!(second[0].status, JobStatus::Abandoned);
    assert_eq!(second[0].retry_count, 2);

    p.republish("bad", Some(1)).await;
    let third = p.drain().await;
    assert_eq!(third[0].status, JobStatus::Abandoned);
    let row = p.store.unparsed(CHAIN, "bad").await.unwrap().unwrap();
    assert_eq!(row.retry_count, 2);
    assert_eq!(p.store.abandoned_unparsed(CHAIN, 2).await.unwrap().len(), 1);
    assert_eq!(p.store.transaction_count(CHAIN).await.unwrap(), 0);
}

#[tokio::test]
async fn crash_before_ack_reprocesses_once_without_double_credit() {
    let p = pipeline(1, false, 3).await;
    p.node.block(1, "b1", None, vec![payment("f1", &[("ext", 0)], &[(WATCHED, 0.5)])]);
    p.node.tip(1);
    p.crawler.run_cycle().await.unwrap();

    // A consumer applies the job, then dies before acknowledging it.
    let lane = work_lane(CHAIN);
    let delivery = p
        .queue
        .receive(&lane, Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap();
    let job = JobDescriptor::from_payload(&delivery.payload).unwrap();
    assert_eq!(p.parser.process(&job).await.status, JobStatus::Applied);
    assert_eq!(p.queue.depth(&lane).await.unwrap(), 0);

    // Restart: in-flight work returns to the lane and is handled exactly once more.
    assert_eq!(p.queue.recover(&lane).await.unwrap(), 1);
    let results = p.drain().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, JobStatus::AlreadyParsed);
    assert_eq!(p.queue.inflight(&lane), 0);

    assert_eq!(p.balance().await, Amount::new(50_000_000));
    assert_eq!(p.store.address_links(&p.address.address_id).await.unwrap().len(), 1);
    assert_eq!(p.unspent_total().await, p.balance().await);
}

#[tokio::test]
async fn mempool_payment_is_pending_until_mined() {
    let p = pipeline(1, true, 3).await;
    p.node.block(1, "b1", None, vec![coinbase("cb1")]);
    p.node.tip(1);
    let incoming = payment("m1", &[("ext", 3)], &[(WATCHED, 0.1)]);
    p.node.mempool(vec![incoming.clone()]);

    let report = p.crawler.run_cycle().await.unwrap();
    assert_eq!(report.mempool_new, 1);
    p.drain().await;
    let pending = &p.store.transactions(CHAIN, "m1").await.unwrap()[0];
    assert_eq!(pending.block_height, None);
    assert!(pending.is_pending());

    // The same mempool content is not fetched twice.
    let again = p.crawler.run_cycle().await.unwrap();
    assert_eq!(again.mempool_new, 0);
    assert_eq!(p.node.mock.count("getrawtransaction"), 1);

    p.node.mempool(vec![]);
    p.node.block(2, "b2", Some("b1"), vec![coinbase("cb2"), incoming]);
    p.node.tip(2);
    p.crawler.run_cycle().await.unwrap();
    p.drain().await;

    let mined = p.store.transactions(CHAIN, "m1").await.unwrap();
    assert_eq!(mined.len(), 1);
    assert_eq!(mined[0].block_height, Some(2));
    assert!(!mined[0].is_pending());
    assert_eq!(p.balance().await, Amount::new(10_000_000));
    assert_eq!(p.unspent_total().await, p.balance().await);
}

/// Decodes normally, but the first time it sees `txid` the chain is rolled
/// back to `ancestor` before the parser gets to apply anything.
struct ReorgMidDecode {
    inner: UtxoDecoder,
    store: Arc<MemoryChainStore>,
    txid: &'static str,
    ancestor: u64,
    fired: AtomicBool,
}

impl Decoder for ReorgMidDecode {
    fn model(&self) -> ChainModel {
        self.inner.model()
    }

    fn native_currency(&self) -> &str {
        self.inner.native_currency()
    }

    fn decode(&self, tx: &UnparsedTransaction) -> Result<DecodedTransaction, LedgerError> {
        let decoded = self.inner.decode(tx)?;
        if tx.txid == self.txid && !self.fired.swap(true, Ordering::SeqCst) {
            futures::executor::block_on(self.store.rollback_to(CHAIN, Some(self.ancestor)))?;
        }
        Ok(decoded)
    }
}

#[tokio::test]
async fn rollback_while_parsing_leaves_no_orphans() {
    let p = pipeline(0, false, 3).await;
    p.node.block(0, "b0", None, vec![coinbase("cb0")]);
    p.node.block(1, "b1", Some("b0"), vec![payment("t1", &[("ext", 0)], &[(WATCHED, 0.5)])]);
    p.node.tip(1);
    p.crawler.run_cycle().await.unwrap();

    let mut config = ParserConfig::new(CHAIN);
    config.queue_timeout = Duration::from_millis(20);
    let parser = Parser::new(
        config,
        p.store.clone(),
        p.queue.clone(),
        Arc::new(ReorgMidDecode {
            inner: UtxoDecoder::new("btc"),
            store: p.store.clone(),
            txid: "t1",
            ancestor: 0,
            fired: AtomicBool::new(false),
        }),
    );
    let mut results = Vec::new();
    while let Some(result) = parser.run_once().await.unwrap() {
        results.push(result);
    }
    let t1 = results.iter().find(|r| r.txid == "t1").unwrap();
    assert_eq!(t1.status, JobStatus::Superseded);
    assert_eq!(t1.retry_count, 0);

    assert_eq!(p.store.transaction_count(CHAIN).await.unwrap(), 0);
    assert!(p.store.address_links(&p.address.address_id).await.unwrap().is_empty());
    assert_eq!(p.unspent_total().await, Amount::ZERO);
    assert_eq!(p.balance().await, Amount::ZERO);
    assert_eq!(p.store.head(CHAIN).await.unwrap().unwrap().height, 0);

    // The next cycle re-syncs block 1 and the payment is credited once.
    let report = p.crawler.run_cycle().await.unwrap();
    assert_eq!(report.blocks_committed, 1);
    let results = p.drain().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, JobStatus::Applied);
    assert_eq!(p.balance().await, Amount::new(50_000_000));
    assert_eq!(p.unspent_total().await, p.balance().await);
}

#[tokio::test]
async fn sweep_does_not_duplicate_a_queued_backlog() {
    let p = pipeline(1, false, 3).await;
    p.node.block(
        1,
        "b1",
        None,
        vec![
            payment("f1", &[("ext", 0)], &[(WATCHED, 0.5)]),
            payment("f2", &[("ext", 1)], &[(WATCHED, 0.25)]),
        ],
    );
    p.node.tip(1);
    assert_eq!(p.crawler.run_cycle().await.unwrap().jobs_published, 2);

    let mut config = ParserConfig::new(CHAIN);
    config.retry_delay = Duration::ZERO;
    config.queue_timeout = Duration::from_millis(20);
    let sweeper = Parser::new(
        config,
        p.store.clone(),
        p.queue.clone(),
        Arc::new(UtxoDecoder::new("btc")),
    );

    // Nobody has consumed the jobs yet; they are simply waiting.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(sweeper.requeue_stale().await.unwrap(), 0);
    assert_eq!(sweeper.requeue_stale().await.unwrap(), 0);
    let lane = work_lane(CHAIN);
    assert_eq!(p.queue.depth(&lane).await.unwrap(), 2);

    let results = p.drain().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == JobStatus::Applied));
    assert_eq!(p.balance().await, Amount::new(75_000_000));
    assert_eq!(sweeper.requeue_stale().await.unwrap(), 0);
    assert_eq!(p.queue.depth(&lane).await.unwrap(), 0);
}
