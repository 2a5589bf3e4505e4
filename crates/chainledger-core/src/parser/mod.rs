//! The per-chain parser — turns queued transactions into ledger rows.
//!
//! ```text
//! <chain>ParseJob ──▶ Parser ──▶ unparsed row ──▶ Decoder ──▶ plan_effects ──▶ ChainStore
//!                       │                                                       (one tx)
//!                       └──▶ <chain>ParseJobCallback (best-effort JobResult)
//! ```
//!
//! Every delivery is acknowledged after it is processed, whatever the outcome.
//! A failed row stays in the store with a bumped `retry_count`; the periodic
//! stale sweep republishes it once `retry_delay` has passed, until
//! `max_retry` is reached and it is left for an operator.

pub mod plan;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ChainConfig;
use crate::decode::Decoder;
use crate::error::LedgerError;
use crate::queue::{
    callback_lane, publish_with_timeout, work_lane, Delivery, JobDescriptor, JobQueue, JobResult,
    JobStatus,
};
use crate::store::ChainStore;
use crate::types::{ChainModel, UnparsedTransaction};

use self::plan::{plan_effects, PlanInput};

/// Parser settings for one chain.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub chain_id: String,
    pub max_retry: u32,
    pub retry_delay: Duration,
    /// Jobs handled concurrently.
    pub prefetch: usize,
    pub confirmation_depth: u64,
    pub queue_timeout: Duration,
    /// Rows republished per stale sweep.
    pub sweep_limit: usize,
}

impl ParserConfig {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            max_retry: 3,
            retry_delay: Duration::from_secs(60),
            prefetch: 1,
            confirmation_depth: 0,
            queue_timeout: Duration::from_secs(5),
            sweep_limit: 500,
        }
    }
}

impl From<&ChainConfig> for ParserConfig {
    fn from(c: &ChainConfig) -> Self {
        Self {
            chain_id: c.id.clone(),
            max_retry: c.max_retry,
            retry_delay: c.retry_delay(),
            prefetch: c.prefetch.max(1),
            confirmation_depth: c.confirmation_depth,
            queue_timeout: c.queue_timeout(),
            sweep_limit: 500,
        }
    }
}

/// Consumes one chain's work lane.
pub struct Parser {
    config: ParserConfig,
    store: Arc<dyn ChainStore>,
    queue: Arc<dyn JobQueue>,
    decoder: Arc<dyn Decoder>,
    work_lane: String,
    callback_lane: String,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Parser {
    pub fn new(
        config: ParserConfig,
        store: Arc<dyn ChainStore>,
        queue: Arc<dyn JobQueue>,
        decoder: Arc<dyn Decoder>,
    ) -> Self {
        Self {
            work_lane: work_lane(&config.chain_id),
            callback_lane: callback_lane(&config.chain_id),
            config,
            store,
            queue,
            decoder,
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.config.chain_id
    }

    pub fn is_started(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    // ─── Job handling ───────────────────────────────────────────────────────

    /// Parse the transaction a job points at. Never fails: the outcome is in
    /// the returned status.
    pub async fn process(&self, job: &JobDescriptor) -> JobResult {
        let chain = self.config.chain_id.as_str();
        let row = match self.store.unparsed(chain, &job.txid).await {
            Ok(Some(row)) => row,
            Ok(None) => return JobResult::new(job, JobStatus::AlreadyParsed),
            Err(e) => {
                tracing::warn!(chain, txid = %job.txid, error = %e, "Unparsed row lookup failed");
                self.release(&job.txid).await;
                let mut result = JobResult::new(job, JobStatus::Failed);
                result.error = Some(e.to_string());
                return result;
            }
        };

        let mut result = JobResult::new(job, JobStatus::Applied);
        result.retry_count = row.retry_count;
        result.block_height = row.block_height;
        if row.is_abandoned(self.config.max_retry) {
            tracing::debug!(chain, txid = %row.txid, retries = row.retry_count, "Row already abandoned");
            result.status = JobStatus::Abandoned;
            return result;
        }

        match self.apply(&row).await {
            Ok(Some(addresses)) => result.addresses = addresses,
            Ok(None) => result.status = JobStatus::Irrelevant,
            // The crawler replaced or rolled back the row mid-parse and owns
            // publishing a job for whatever replaced it.
            Err(LedgerError::StaleParse { .. }) => result.status = JobStatus::Superseded,
            Err(e) => {
                let now = chrono::Utc::now().timestamp();
                match self.store.record_parse_failure(chain, &row.txid, now).await {
                    Ok(retries) => {
                        result.retry_count = retries;
                        if retries >= self.config.max_retry {
                            let exceeded = LedgerError::MaxRetryExceeded {
                                txid: row.txid.clone(),
                                retries,
                            };
                            tracing::error!(chain, cause = %e, "{exceeded}");
                            result.status = JobStatus::Abandoned;
                        } else {
                            tracing::warn!(chain, txid = %row.txid, retries, error = %e, "Parse failed");
                            result.status = JobStatus::Failed;
                        }
                    }
                    Err(store_err) => {
                        tracing::warn!(chain, txid = %row.txid, error = %store_err, "Recording parse failure failed");
                        self.release(&row.txid).await;
                        result.status = JobStatus::Failed;
                    }
                }
                result.error = Some(e.to_string());
            }
        }
        result
    }

    /// Hand a row back to the stale sweep once its job is gone.
    async fn release(&self, txid: &str) {
        if let Err(e) = self.store.release_job(&self.config.chain_id, txid).await {
            tracing::warn!(chain = %self.config.chain_id, txid, error = %e, "Releasing row failed");
        }
    }

    /// Decode and apply one row. `None` if the transaction touches nothing watched.
    async fn apply(&self, row: &UnparsedTransaction) -> Result<Option<Vec<String>>, LedgerError> {
        let chain = self.config.chain_id.as_str();
        let model = self.decoder.model();
        let decoded = self.decoder.decode(row)?;

        let mut watched = self.store.watched_addresses(chain, &decoded.addresses()).await?;
        let spendable = match model {
            ChainModel::Utxo => {
                let spent = decoded.spent_outpoints();
                if spent.is_empty() {
                    Vec::new()
                } else {
                    self.store.spendable_utxos(chain, &spent, &row.txid).await?
                }
            }
            ChainModel::Account => Vec::new(),
        };
        // Spent outputs name their owner only by address id.
        let known: HashSet<&str> = watched.iter().map(|a| a.address_id.as_str()).collect();
        let mut owners: Vec<String> = spendable
            .iter()
            .map(|u| u.address_id.clone())
            .filter(|id| !known.contains(id.as_str()))
            .collect();
        owners.sort();
        owners.dedup();
        if !owners.is_empty() {
            watched.extend(self.store.addresses_by_id(&owners).await?);
        }

        let confirmed = match decoded.block_height {
            Some(height) => self
                .store
                .head(chain)
                .await?
                .map(|head| head.confirms(height, self.config.confirmation_depth))
                .unwrap_or(false),
            None => false,
        };

        let input = PlanInput {
            chain_id: chain,
            block_hash: row.block_hash.as_deref(),
            model,
            native_currency: self.decoder.native_currency(),
            decoded: &decoded,
            watched: &watched,
            spendable: &spendable,
            confirmed,
        };
        let Some(effects) = plan_effects(&input) else {
            self.store
                .discard_unparsed(chain, &row.txid, row.block_hash.as_deref())
                .await?;
            return Ok(None);
        };

        let touched: HashSet<String> = effects.address_ids().into_iter().collect();
        let mut addresses: Vec<String> = watched
            .iter()
            .filter(|a| touched.contains(&a.address_id))
            .map(|a| a.address.clone())
            .collect();
        addresses.sort();
        addresses.dedup();

        self.store.apply_parse(effects).await?;
        Ok(Some(addresses))
    }

    /// Process a delivery, publish its result and acknowledge it.
    pub async fn handle(&self, delivery: Delivery) -> Result<JobResult, LedgerError> {
        let chain = self.config.chain_id.as_str();
        let job = match JobDescriptor::from_payload(&delivery.payload) {
            Ok(job) if job.chain_id == chain => job,
            Ok(job) => {
                self.queue.ack(&delivery).await?;
                return Err(LedgerError::Queue(format!(
                    "job for chain {} on lane {}",
                    job.chain_id, delivery.lane
                )));
            }
            Err(e) => {
                tracing::warn!(chain, id = delivery.id, error = %e, "Dropping malformed job");
                self.queue.ack(&delivery).await?;
                return Err(e);
            }
        };
        if delivery.is_redelivery() {
            tracing::debug!(chain, txid = %job.txid, count = delivery.delivery_count, "Redelivered job");
        }

        let result = self.process(&job).await;
        match result.status {
            JobStatus::Applied => tracing::info!(
                chain,
                txid = %job.txid,
                addresses = ?result.addresses,
                "Transaction parsed"
            ),
            JobStatus::Irrelevant => tracing::debug!(chain, txid = %job.txid, "Transaction irrelevant"),
            JobStatus::AlreadyParsed => tracing::debug!(chain, txid = %job.txid, "Already parsed"),
            JobStatus::Superseded => {
                tracing::info!(chain, txid = %job.txid, "Row changed during parse; effects dropped")
            }
            JobStatus::Failed | JobStatus::Abandoned => {}
        }

        self.publish_callback(&result).await;
        self.queue.ack(&delivery).await?;
        Ok(result)
    }

    async fn publish_callback(&self, result: &JobResult) {
        let payload = match result.to_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(chain = %self.config.chain_id, error = %e, "Callback encoding failed");
                return;
            }
        };
        if let Err(e) = publish_with_timeout(
            self.queue.as_ref(),
            &self.callback_lane,
            payload,
            self.config.queue_timeout,
        )
        .await
        {
            tracing::warn!(chain = %self.config.chain_id, txid = %result.txid, error = %e, "Callback publish failed");
        }
    }

    /// Receive and handle at most one job.
    pub async fn run_once(&self) -> Result<Option<JobResult>, LedgerError> {
        match self
            .queue
            .receive(&self.work_lane, self.config.queue_timeout)
            .await?
        {
            Some(delivery) => self.handle(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Republish jobs for rows that failed, or whose first publish never went
    /// through, more than `retry_delay` ago. Rows whose job is still in the
    /// work lane are left alone.
    pub async fn requeue_stale(&self) -> Result<usize, LedgerError> {
        let chain = self.config.chain_id.as_str();
        let older_than = chrono::Utc::now().timestamp() - self.config.retry_delay.as_secs() as i64;
        let rows = self
            .store
            .take_stale_unparsed(chain, self.config.max_retry, older_than, self.config.sweep_limit)
            .await?;

        let mut published = 0;
        for row in rows {
            let payload = JobDescriptor::new(chain, row.txid.as_str(), row.block_height).to_payload()?;
            match publish_with_timeout(self.queue.as_ref(), &self.work_lane, payload, self.config.queue_timeout).await {
                Ok(()) => published += 1,
                Err(e) => {
                    tracing::warn!(chain, txid = %row.txid, error = %e, "Requeue failed");
                    self.release(&row.txid).await;
                }
            }
        }
        if published > 0 {
            tracing::info!(chain, published, "Stale rows requeued");
        }
        Ok(published)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Start consuming. Ignored (returns `false`) if already started.
    pub fn start(self: &Arc<Self>) -> bool {
        let Ok(mut task) = self.task.lock() else {
            return false;
        };
        if task.is_some() {
            return false;
        }
        let cancel = CancellationToken::new();
        if let Ok(mut c) = self.cancel.lock() {
            *c = cancel.clone();
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.run_loop(cancel).await }));
        true
    }

    /// Stop receiving and wait for in-flight jobs to finish.
    pub async fn stop(&self) {
        let handle = match self.task.lock() {
            Ok(mut t) => t.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return;
        };
        if let Ok(c) = self.cancel.lock() {
            c.cancel();
        }
        if let Err(e) = handle.await {
            tracing::error!(chain = %self.config.chain_id, error = %e, "Parser task failed");
        }
        tracing::info!(chain = %self.config.chain_id, "Parser stopped");
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let chain = self.config.chain_id.clone();
        match self.queue.recover(&self.work_lane).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(chain = %chain, recovered = n, "Unacknowledged jobs redelivered"),
            Err(e) => tracing::warn!(chain = %chain, error = %e, "Queue recovery failed"),
        }
        tracing::info!(chain = %chain, prefetch = self.config.prefetch, "Parser started");

        let mut inflight: JoinSet<Result<JobResult, LedgerError>> = JoinSet::new();
        let mut next_sweep = Instant::now();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if Instant::now() >= next_sweep {
                if let Err(e) = self.requeue_stale().await {
                    tracing::warn!(chain = %chain, error = %e, "Stale sweep failed");
                }
                next_sweep = Instant::now() + self.config.retry_delay.max(Duration::from_secs(1));
            }
            while inflight.len() >= self.config.prefetch {
                if let Some(joined) = inflight.join_next().await {
                    log_joined(&chain, joined);
                }
            }

            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.queue.receive(&self.work_lane, self.config.queue_timeout) => r,
            };
            match received {
                Ok(Some(delivery)) => {
                    let this = Arc::clone(&self);
                    inflight.spawn(async move { this.handle(delivery).await });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(chain = %chain, error = %e, "Receive failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.queue_timeout) => {}
                    }
                }
            }
        }

        while let Some(joined) = inflight.join_next().await {
            log_joined(&chain, joined);
        }
    }
}

fn log_joined(chain: &str, joined: Result<Result<JobResult, LedgerError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::warn!(chain, error = %e, "Job handling failed"),
        Err(e) => tracing::error!(chain, error = %e, "Job task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::decode::DecodedTransaction;
    use crate::queue::MemoryJobQueue;
    use crate::store::MemoryChainStore;
    use crate::test_util::{utxo_tx, watch, ToyUtxoDecoder};
    use crate::types::{Direction, ScannedBlock};

    const CHAIN: &str = "80000000";

    struct Harness {
        store: Arc<MemoryChainStore>,
        queue: Arc<MemoryJobQueue>,
        parser: Arc<Parser>,
    }

    fn harness(config: ParserConfig) -> Harness {
        let store = Arc::new(MemoryChainStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let parser = Arc::new(Parser::new(
            config,
            store.clone(),
            queue.clone(),
            Arc::new(ToyUtxoDecoder),
        ));
        Harness { store, queue, parser }
    }

    /// Commit a block at `height` carrying `txs` and return the queued txids.
    async fn commit(
        store: &MemoryChainStore,
        height: u64,
        txs: Vec<crate::peer::RawTransaction>,
    ) -> Vec<String> {
        store.ensure_head(CHAIN, 0).await.unwrap();
        let hash = format!("b{height}");
        let rows = txs
            .iter()
            .map(|t| {
                UnparsedTransaction::new(CHAIN, t.txid.clone(), t.payload.clone(), Some((height, hash.clone())), 0)
            })
            .collect();
        store
            .commit_block(
                ScannedBlock {
                    chain_id: CHAIN.into(),
                    height,
                    block_hash: hash.clone(),
                    parent_hash: height.checked_sub(1).map(|p| format!("b{p}")),
                    timestamp: 0,
                    tx_ids: txs.iter().map(|t| t.txid.clone()).collect(),
                },
                rows,
            )
            .await
            .unwrap()
    }

    fn job(txid: &str) -> JobDescriptor {
        JobDescriptor::new(CHAIN, txid, None)
    }

    #[tokio::test]
    async fn applies_incoming_transaction() {
        let h = harness(ParserConfig::new(CHAIN));
        let addr = watch(h.store.as_ref(), CHAIN, "acc", "1A", 0).await;
        commit(&h.store, 0, vec![utxo_tx("t1", &[], &[("1A", 50_000_000), ("1Z", 5)])]).await;

        let result = h.parser.process(&job("t1")).await;
        assert_eq!(result.status, JobStatus::Applied);
        assert_eq!(result.addresses, vec!["1A".to_string()]);

        let utxos = h.store.unspent_utxos(&addr.address_id).await.unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].amount, Amount(50_000_000));
        assert!(h.store.unparsed(CHAIN, "t1").await.unwrap().is_none());

        let again = h.parser.process(&job("t1")).await;
        assert_eq!(again.status, JobStatus::AlreadyParsed);
    }

    #[tokio::test]
    async fn spend_of_watched_output_links_owner() {
        let h = harness(ParserConfig::new(CHAIN));
        let addr = watch(h.store.as_ref(), CHAIN, "acc", "1A", 0).await;
        commit(&h.store, 0, vec![utxo_tx("t1", &[], &[("1A", 50_000_000)])]).await;
        h.parser.process(&job("t1")).await;

        // Inputs carry no address; the owner is found through the spent output.
        commit(&h.store, 1, vec![utxo_tx("t2", &[("t1", 0)], &[("1Z", 49_990_000)])]).await;
        let result = h.parser.process(&job("t2")).await;
        assert_eq!(result.status, JobStatus::Applied);
        assert_eq!(result.addresses, vec!["1A".to_string()]);

        assert!(h.store.unspent_utxos(&addr.address_id).await.unwrap().is_empty());
        let links = h.store.address_links(&addr.address_id).await.unwrap();
        let out = links.iter().find(|l| l.txid == "t2").unwrap();
        assert_eq!(out.direction, Direction::Out);
        assert_eq!(out.amount, Amount(50_000_000));
    }

    #[tokio::test]
    async fn irrelevant_transaction_is_discarded() {
        let h = harness(ParserConfig::new(CHAIN));
        watch(h.store.as_ref(), CHAIN, "acc", "1A", 0).await;
        commit(&h.store, 0, vec![utxo_tx("t1", &[], &[("1Z", 7)])]).await;

        let result = h.parser.process(&job("t1")).await;
        assert_eq!(result.status, JobStatus::Irrelevant);
        assert!(h.store.unparsed(CHAIN, "t1").await.unwrap().is_none());
        assert_eq!(h.store.transaction_count(CHAIN).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failures_count_up_to_abandonment() {
        let mut config = ParserConfig::new(CHAIN);
        config.max_retry = 2;
        let h = harness(config);
        let mut tx = utxo_tx("t1", &[], &[("1A", 1)]);
        tx.payload["broken"] = serde_json::Value::Bool(true);
        commit(&h.store, 0, vec![tx]).await;

        let first = h.parser.process(&job("t1")).await;
        assert_eq!(first.status, JobStatus::Failed);
        assert_eq!(first.retry_count, 1);
        assert!(first.error.is_some());

        let second = h.parser.process(&job("t1")).await;
        assert_eq!(second.status, JobStatus::Abandoned);
        assert_eq!(second.retry_count, 2);

        // Row stays for inspection; further jobs leave it alone.
        let third = h.parser.process(&job("t1")).await;
        assert_eq!(third.status, JobStatus::Abandoned);
        assert_eq!(third.retry_count, 2);
        assert_eq!(h.store.abandoned_unparsed(CHAIN, 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn handle_acks_and_publishes_callback() {
        let h = harness(ParserConfig::new(CHAIN));
        watch(h.store.as_ref(), CHAIN, "acc", "1A", 0).await;
        let queued = commit(&h.store, 0, vec![utxo_tx("t1", &[], &[("1A", 10)])]).await;
        assert_eq!(queued, vec!["t1".to_string()]);
        let lane = work_lane(CHAIN);
        h.queue
            .publish(&lane, JobDescriptor::new(CHAIN, "t1", Some(0)).to_payload().unwrap())
            .await
            .unwrap();

        let result = h.parser.run_once().await.unwrap().unwrap();
        assert_eq!(result.status, JobStatus::Applied);
        assert_eq!(h.queue.depth(&lane).await.unwrap(), 0);
        assert_eq!(h.queue.inflight(&lane), 0);

        let cb = h
            .queue
            .receive(&callback_lane(CHAIN), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&cb.payload).unwrap();
        assert_eq!(value["status"], "applied");
        assert_eq!(value["txid"], "t1");
    }

    #[tokio::test]
    async fn malformed_job_is_acked_and_reported() {
        let h = harness(ParserConfig::new(CHAIN));
        let lane = work_lane(CHAIN);
        h.queue.publish(&lane, "not json".into()).await.unwrap();

        assert!(h.parser.run_once().await.is_err());
        assert_eq!(h.queue.inflight(&lane), 0);
        assert_eq!(h.queue.depth(&lane).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_rows_are_requeued_after_delay() {
        let mut config = ParserConfig::new(CHAIN);
        config.retry_delay = Duration::ZERO;
        let h = harness(config);
        let mut tx = utxo_tx("t1", &[], &[("1A", 1)]);
        tx.payload["broken"] = serde_json::Value::Bool(true);
        commit(&h.store, 0, vec![tx]).await;
        h.parser.process(&job("t1")).await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(h.parser.requeue_stale().await.unwrap(), 1);
        assert_eq!(h.queue.depth(&work_lane(CHAIN)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sweep_leaves_rows_with_a_queued_job_alone() {
        let mut config = ParserConfig::new(CHAIN);
        config.retry_delay = Duration::ZERO;
        let h = harness(config);
        let txids = commit(
            &h.store,
            0,
            vec![utxo_tx("t1", &[], &[("1A", 1)]), utxo_tx("t2", &[], &[("1A", 2)])],
        )
        .await;
        let lane = work_lane(CHAIN);
        for txid in &txids {
            h.queue
                .publish(&lane, JobDescriptor::new(CHAIN, txid.as_str(), Some(0)).to_payload().unwrap())
                .await
                .unwrap();
        }
        h.store.mark_queued(CHAIN, &txids, 0).await.unwrap();

        assert_eq!(h.parser.requeue_stale().await.unwrap(), 0);
        assert_eq!(h.parser.requeue_stale().await.unwrap(), 0);
        assert_eq!(h.queue.depth(&lane).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_row_is_requeued_once() {
        let mut config = ParserConfig::new(CHAIN);
        config.retry_delay = Duration::ZERO;
        let h = harness(config);
        let mut tx = utxo_tx("t1", &[], &[("1A", 1)]);
        tx.payload["broken"] = serde_json::Value::Bool(true);
        commit(&h.store, 0, vec![tx]).await;
        h.parser.process(&job("t1")).await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(h.parser.requeue_stale().await.unwrap(), 1);
        assert_eq!(h.parser.requeue_stale().await.unwrap(), 0);
        assert_eq!(h.queue.depth(&work_lane(CHAIN)).await.unwrap(), 1);
    }

    /// Rolls the chain back while the parser is between decode and apply.
    struct RollbackDuringDecode {
        store: Arc<MemoryChainStore>,
    }

    impl Decoder for RollbackDuringDecode {
        fn model(&self) -> ChainModel {
            ChainModel::Utxo
        }

        fn native_currency(&self) -> &str {
            "btc"
        }

        fn decode(&self, tx: &UnparsedTransaction) -> Result<DecodedTransaction, LedgerError> {
            let decoded = ToyUtxoDecoder.decode(tx)?;
            futures::executor::block_on(self.store.rollback_to(CHAIN, None))?;
            Ok(decoded)
        }
    }

    #[tokio::test]
    async fn rollback_during_parse_drops_the_effects() {
        let store = Arc::new(MemoryChainStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let parser = Parser::new(
            ParserConfig::new(CHAIN),
            store.clone(),
            queue,
            Arc::new(RollbackDuringDecode { store: store.clone() }),
        );
        let addr = watch(store.as_ref(), CHAIN, "acc", "1A", 0).await;
        commit(&store, 0, vec![utxo_tx("t1", &[], &[("1A", 50_000_000)])]).await;

        let result = parser.process(&job("t1")).await;

        assert_eq!(result.status, JobStatus::Superseded);
        assert_eq!(result.retry_count, 0);
        assert_eq!(store.transaction_count(CHAIN).await.unwrap(), 0);
        assert!(store.unspent_utxos(&addr.address_id).await.unwrap().is_empty());
        assert!(store.unparsed(CHAIN, "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn started_parser_drains_queue() {
        let h = harness(ParserConfig::new(CHAIN));
        let addr = watch(h.store.as_ref(), CHAIN, "acc", "1A", 0).await;
        let txids = commit(
            &h.store,
            0,
            vec![
                utxo_tx("t1", &[], &[("1A", 10)]),
                utxo_tx("t2", &[], &[("1A", 20)]),
            ],
        )
        .await;
        for txid in &txids {
            h.queue
                .publish(&work_lane(CHAIN), JobDescriptor::new(CHAIN, txid.as_str(), Some(0)).to_payload().unwrap())
                .await
                .unwrap();
        }

        assert!(h.parser.start());
        assert!(!h.parser.start());
        for _ in 0..50 {
            if h.store.unspent_utxos(&addr.address_id).await.unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        h.parser.stop().await;

        assert_eq!(h.store.unspent_utxos(&addr.address_id).await.unwrap().len(), 2);
        assert_eq!(h.queue.depth(&work_lane(CHAIN)).await.unwrap(), 0);
    }
}
