//! The per-chain crawler — block sync, reorg rollback, mempool and fee polling.
//!
//! # Cycle
//!
//! ```text
//! run_cycle (single-flight)
//!   ├── read local head H and peer height P
//!   ├── H < P:
//!   │     ├── stored hash at H ≠ peer hash at H → walk back, roll back (ReorgRecovery)
//!   │     └── fetch H+1.. by hash, commit block + unparsed rows, publish parse jobs
//!   └── housekeeping (every cycle)
//!         ├── promote confirmations past `confirmation_depth`
//!         ├── sync hook (account chains: balance refresh)
//!         └── UTXO chains: fee sample + mempool diff
//! ```
//!
//! A failing step ends the cycle; the next scheduled cycle resumes from the
//! persisted head, since every write is an idempotent upsert.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ChainConfig;
use crate::error::LedgerError;
use crate::peer::PeerAdapter;
use crate::queue::{publish_with_timeout, work_lane, JobDescriptor, JobQueue};
use crate::reorg::{self, ReorgEvent};
use crate::store::ChainStore;
use crate::types::{BlockchainHead, ChainModel, PendingSnapshot, ScannedBlock, UnparsedTransaction};

/// Crawler settings for one chain.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub chain_id: String,
    pub start_height: u64,
    pub sync_interval: Duration,
    pub confirmation_depth: u64,
    pub max_rollback_depth: u64,
    pub mempool: bool,
    pub mempool_fetch_limit: usize,
    pub queue_timeout: Duration,
}

impl CrawlerConfig {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            start_height: 0,
            sync_interval: Duration::from_secs(15),
            confirmation_depth: 0,
            max_rollback_depth: 100,
            mempool: false,
            mempool_fetch_limit: 500,
            queue_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ChainConfig> for CrawlerConfig {
    fn from(c: &ChainConfig) -> Self {
        Self {
            chain_id: c.id.clone(),
            start_height: c.start_height,
            sync_interval: c.sync_interval(),
            confirmation_depth: c.confirmation_depth,
            max_rollback_depth: c.max_rollback_depth,
            mempool: c.mempool_enabled(),
            mempool_fetch_limit: c.mempool_fetch_limit,
            queue_timeout: c.queue_timeout(),
        }
    }
}

/// Runtime state of a crawler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrawlerState {
    /// Waiting for the next cycle.
    Idle,
    /// Fetching and committing blocks.
    Syncing,
    /// Rolling back a diverged branch.
    ReorgRecovery,
    /// Confirmations, fee sampling, mempool diff.
    Housekeeping,
    /// Stop requested; the in-flight cycle is draining.
    Stopping,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for CrawlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::ReorgRecovery => write!(f, "reorg-recovery"),
            Self::Housekeeping => write!(f, "housekeeping"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Another cycle was in flight; this one did nothing.
    pub skipped: bool,
    pub local_height: Option<u64>,
    pub peer_height: Option<u64>,
    pub synced_to: Option<u64>,
    pub blocks_committed: u64,
    pub jobs_published: usize,
    pub reorg: Option<ReorgEvent>,
    pub confirmed: u64,
    pub fee: Option<u64>,
    pub mempool_new: usize,
}

/// Chain-specific step run after block sync in every cycle.
#[async_trait]
pub trait SyncHook: Send + Sync {
    async fn after_sync(
        &self,
        chain_id: &str,
        store: &dyn ChainStore,
        report: &CycleReport,
    ) -> Result<(), LedgerError>;
}

/// Recomputes account balances after new blocks or a rollback.
pub struct BalanceRefresh;

#[async_trait]
impl SyncHook for BalanceRefresh {
    async fn after_sync(
        &self,
        chain_id: &str,
        store: &dyn ChainStore,
        report: &CycleReport,
    ) -> Result<(), LedgerError> {
        if report.blocks_committed == 0 && report.reorg.is_none() {
            return Ok(());
        }
        let updated = store.recompute_balances(chain_id).await?;
        tracing::debug!(chain = %chain_id, updated, "Balances refreshed");
        Ok(())
    }
}

enum SyncStep {
    Committed { published: usize },
    ParentMismatch,
    Missing,
}

/// Clears the in-flight flag even if the cycle future is dropped.
struct Flight<'a>(&'a AtomicBool);

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives one chain's synchronization.
pub struct Crawler {
    config: CrawlerConfig,
    peer: Arc<dyn PeerAdapter>,
    store: Arc<dyn ChainStore>,
    queue: Arc<dyn JobQueue>,
    sync_hook: Option<Arc<dyn SyncHook>>,
    running: AtomicBool,
    state: Mutex<CrawlerState>,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Crawler {
    /// Account-model chains get [`BalanceRefresh`] as their sync hook.
    pub fn new(
        config: CrawlerConfig,
        peer: Arc<dyn PeerAdapter>,
        store: Arc<dyn ChainStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let sync_hook: Option<Arc<dyn SyncHook>> = match peer.model() {
            ChainModel::Account => Some(Arc::new(BalanceRefresh)),
            ChainModel::Utxo => None,
        };
        Self {
            config,
            peer,
            store,
            queue,
            sync_hook,
            running: AtomicBool::new(false),
            state: Mutex::new(CrawlerState::Idle),
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    pub fn with_sync_hook(mut self, hook: Arc<dyn SyncHook>) -> Self {
        self.sync_hook = Some(hook);
        self
    }

    pub fn chain_id(&self) -> &str {
        &self.config.chain_id
    }

    pub fn state(&self) -> CrawlerState {
        self.state.lock().map(|s| *s).unwrap_or(CrawlerState::Stopped)
    }

    fn set_state(&self, state: CrawlerState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    fn stop_requested(&self) -> bool {
        self.cancel.lock().map(|c| c.is_cancelled()).unwrap_or(true)
    }

    /// Returns `true` if the periodic task is running.
    pub fn is_started(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Start the periodic task: one cycle now, then one per `sync_interval`.
    ///
    /// Ignored (returns `false`) if already started.
    pub fn start(self: &Arc<Self>) -> bool {
        let Ok(mut task) = self.task.lock() else {
            return false;
        };
        if task.is_some() {
            tracing::debug!(chain = %self.config.chain_id, "Crawler already started");
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

    /// Stop the periodic task, letting an in-flight cycle finish its current block.
    pub async fn stop(&self) {
        let handle = match self.task.lock() {
            Ok(mut t) => t.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return;
        };
        self.set_state(CrawlerState::Stopping);
        if let Ok(c) = self.cancel.lock() {
            c.cancel();
        }
        if let Err(e) = handle.await {
            tracing::error!(chain = %self.config.chain_id, error = %e, "Crawler task failed");
        }
        self.set_state(CrawlerState::Stopped);
        tracing::info!(chain = %self.config.chain_id, "Crawler stopped");
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            chain = %self.config.chain_id,
            interval_ms = self.config.sync_interval.as_millis() as u64,
            "Crawler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.run_cycle().await {
                Ok(report) if report.skipped => {}
                Ok(report) => tracing::info!(
                    chain = %self.config.chain_id,
                    peer = ?report.peer_height,
                    synced_to = ?report.synced_to,
                    blocks = report.blocks_committed,
                    jobs = report.jobs_published,
                    reorg = report.reorg.is_some(),
                    "Cycle complete"
                ),
                Err(e) => tracing::error!(
                    chain = %self.config.chain_id,
                    error = %e,
                    "Cycle aborted"
                ),
            }
        }
    }

    /// Run one cycle. A trigger while another cycle is in flight is a no-op.
    pub async fn run_cycle(&self) -> Result<CycleReport, LedgerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(chain = %self.config.chain_id, "Cycle already in flight");
            return Ok(CycleReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _flight = Flight(&self.running);
        let result = self.cycle().await;
        if self.state() != CrawlerState::Stopping {
            self.set_state(CrawlerState::Idle);
        }
        result
    }

    async fn cycle(&self) -> Result<CycleReport, LedgerError> {
        let chain = self.config.chain_id.as_str();
        let mut report = CycleReport::default();

        let mut head = self
            .store
            .ensure_head(chain, self.config.start_height)
            .await?;
        report.local_height = head.synced_height();
        let peer_height = self.peer.chain_height().await?;
        report.peer_height = Some(peer_height);

        if head.is_behind(peer_height) {
            if let Some(local_hash) = head.block_hash.clone() {
                let peer_hash = self.peer.block_hash(head.height).await?;
                if peer_hash.as_deref() != Some(local_hash.as_str()) {
                    self.set_state(CrawlerState::ReorgRecovery);
                    let detected = LedgerError::ReorgDetected {
                        height: head.height,
                        local: local_hash,
                        peer: peer_hash.unwrap_or_default(),
                    };
                    tracing::warn!(chain, error = %detected, "Local tip diverges from peer");
                    let event = reorg::resolve(
                        self.store.as_ref(),
                        self.peer.as_ref(),
                        chain,
                        head.height,
                        self.config.max_rollback_depth,
                    )
                    .await?;
                    report.reorg = Some(event);
                    head = self
                        .store
                        .head(chain)
                        .await?
                        .ok_or_else(|| LedgerError::Store(format!("head of {chain} vanished")))?;
                }
            }

            self.set_state(CrawlerState::Syncing);
            self.sync_forward(&mut head, peer_height, &mut report).await;
        } else {
            tracing::debug!(chain, local = head.height, peer = peer_height, "Block height is top now");
        }
        report.synced_to = head.synced_height();

        self.set_state(CrawlerState::Housekeeping);
        self.housekeeping(&head, &mut report).await;
        Ok(report)
    }

    // ─── Block sync ─────────────────────────────────────────────────────────

    async fn sync_forward(&self, head: &mut BlockchainHead, target: u64, report: &mut CycleReport) {
        let chain = self.config.chain_id.as_str();
        while head.next_height() <= target {
            if self.stop_requested() {
                tracing::info!(chain, at = head.height, "Stop requested, ending sync");
                break;
            }
            let height = head.next_height();
            match self.sync_block(head, height).await {
                Ok(SyncStep::Committed { published }) => {
                    report.blocks_committed += 1;
                    report.jobs_published += published;
                }
                Ok(SyncStep::ParentMismatch) => {
                    tracing::warn!(chain, height, "Parent hash mismatch, deferring to next cycle");
                    break;
                }
                Ok(SyncStep::Missing) => {
                    tracing::info!(chain, height, "Peer has no block yet");
                    break;
                }
                Err(e) => {
                    tracing::warn!(chain, height, error = %e, "Block sync stopped");
                    break;
                }
            }
        }
    }

    async fn sync_block(&self, head: &mut BlockchainHead, height: u64) -> Result<SyncStep, LedgerError> {
        let chain = self.config.chain_id.as_str();
        let Some(hash) = self.peer.block_hash(height).await? else {
            return Ok(SyncStep::Missing);
        };
        let block = self.peer.block_by_hash(&hash).await?;
        if block.height != height || block.hash != hash {
            return Err(LedgerError::Decode(format!(
                "peer returned block {} ({}) for height {height}",
                block.height, block.hash
            )));
        }
        if let Some(parent) = head.block_hash.as_deref() {
            if !block.extends(parent) {
                return Ok(SyncStep::ParentMismatch);
            }
        }

        let scanned = ScannedBlock {
            chain_id: chain.to_string(),
            height,
            block_hash: hash.clone(),
            parent_hash: block.parent_hash.clone(),
            timestamp: block.timestamp,
            tx_ids: block.tx_ids(),
        };
        let timestamp = block.timestamp;
        let tx_count = block.transactions.len();
        let rows = block
            .transactions
            .into_iter()
            .map(|t| {
                UnparsedTransaction::new(chain, t.txid, t.payload, Some((height, hash.clone())), timestamp)
            })
            .collect();

        let queued = self.store.commit_block(scanned, rows).await?;
        head.height = height;
        head.block_hash = Some(hash);

        let published = self.publish_jobs(&queued, Some(height)).await;
        tracing::debug!(chain, height, txs = tx_count, queued = queued.len(), "Block synced");
        Ok(SyncStep::Committed { published })
    }

    /// Publish parse jobs and flag their rows as queued; failures are left
    /// for the parser's stale sweep.
    async fn publish_jobs(&self, txids: &[String], block_height: Option<u64>) -> usize {
        let chain = self.config.chain_id.as_str();
        let lane = work_lane(chain);
        let mut published = Vec::with_capacity(txids.len());
        for txid in txids {
            let payload = match JobDescriptor::new(chain, txid.as_str(), block_height).to_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(chain, %txid, error = %e, "Job encoding failed");
                    continue;
                }
            };
            match publish_with_timeout(self.queue.as_ref(), &lane, payload, self.config.queue_timeout).await {
                Ok(()) => published.push(txid.clone()),
                Err(e) => tracing::warn!(chain, %txid, error = %e, "Job publish failed"),
            }
        }
        if !published.is_empty() {
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = self.store.mark_queued(chain, &published, now).await {
                // Unflagged rows get one duplicate job from the sweep.
                tracing::warn!(chain, error = %e, "Flagging queued rows failed");
            }
        }
        published.len()
    }

    // ─── Housekeeping ───────────────────────────────────────────────────────

    async fn housekeeping(&self, head: &BlockchainHead, report: &mut CycleReport) {
        let chain = self.config.chain_id.as_str();

        if let Some(tip) = head.synced_height() {
            if tip >= self.config.confirmation_depth {
                match self
                    .store
                    .confirm_transactions(chain, tip - self.config.confirmation_depth)
                    .await
                {
                    Ok(n) => report.confirmed = n,
                    Err(e) => tracing::warn!(chain, error = %e, "Confirmation promotion failed"),
                }
            }
        }

        if let Some(hook) = &self.sync_hook {
            if let Err(e) = hook.after_sync(chain, self.store.as_ref(), report).await {
                tracing::warn!(chain, error = %e, "Sync hook failed");
            }
        }

        if self.peer.model() != ChainModel::Utxo {
            return;
        }
        if let Some(tip) = head.synced_height() {
            match self.sample_fee(tip).await {
                Ok(fee) => report.fee = fee,
                Err(e) => tracing::warn!(chain, error = %e, "Fee sampling failed"),
            }
        }
        if self.config.mempool {
            match self.sync_mempool(report.peer_height.unwrap_or(head.height)).await {
                Ok(new) => report.mempool_new = new,
                Err(e) => tracing::warn!(chain, error = %e, "Mempool sync failed"),
            }
        }
    }

    async fn sample_fee(&self, tip: u64) -> Result<Option<u64>, LedgerError> {
        let fee = self.peer.fee_estimate(tip).await?;
        if let Some(fee) = fee {
            self.store.update_fee(&self.config.chain_id, fee).await?;
        }
        Ok(fee)
    }

    /// Queue mempool transactions that are neither known nor seen last cycle.
    async fn sync_mempool(&self, peer_height: u64) -> Result<usize, LedgerError> {
        let chain = self.config.chain_id.as_str();
        let Some(mempool) = self.peer.mempool_txids().await? else {
            return Ok(0);
        };

        let known = self.store.known_txids(chain, &mempool).await?;
        let previous: HashSet<String> = self
            .store
            .latest_pending_snapshot(chain)
            .await?
            .map(|s| s.tx_ids.into_iter().collect())
            .unwrap_or_default();

        let fresh: Vec<&String> = mempool
            .iter()
            .filter(|t| !known.contains(*t) && !previous.contains(*t))
            .collect();
        // Anything not fetched this cycle stays out of the snapshot so it is retried.
        let mut deferred: HashSet<&str> = fresh
            .iter()
            .skip(self.config.mempool_fetch_limit)
            .map(|t| t.as_str())
            .collect();

        let now = chrono::Utc::now().timestamp();
        let mut queued = 0;
        for txid in fresh.iter().take(self.config.mempool_fetch_limit) {
            match self.peer.transaction(txid).await {
                Ok(Some(raw)) => {
                    let row = UnparsedTransaction::new(chain, raw.txid.clone(), raw.payload, None, now);
                    if self.store.insert_unparsed(row).await? {
                        self.publish_jobs(&[raw.txid], None).await;
                        queued += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(chain, %txid, error = %e, "Pending transaction fetch failed");
                    deferred.insert(txid.as_str());
                }
            }
        }

        let snapshot = PendingSnapshot {
            chain_id: chain.to_string(),
            block_height_asked: peer_height,
            tx_ids: mempool
                .iter()
                .filter(|t| !deferred.contains(t.as_str()))
                .cloned()
                .collect(),
            timestamp: now,
        };
        self.store.save_pending_snapshot(snapshot).await?;

        if queued > 0 {
            tracing::info!(chain, queued, mempool = mempool.len(), "Pending transactions queued");
        }
        Ok(queued)
    }
}
