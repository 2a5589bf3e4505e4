//! Pipeline configuration: one `ChainConfig` per supervised chain.
//!
//! Loaded from a JSON file:
//!
//! ```json
//! {
//!   "database_url": "sqlite:./ledger.db?mode=rwc",
//!   "chains": [
//!     { "id": "80000000", "name": "bitcoin", "family": "bitcoin",
//!       "rpc": { "url": "http://127.0.0.1:8332", "user": "rpc", "pass": "secret" },
//!       "native_currency_id": "btc", "start_height": 840000 }
//!   ]
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::types::ChainModel;

/// Chain family, selecting the peer adapter and decoder at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Bitcoin,
    Evm,
}

impl ChainFamily {
    pub fn model(&self) -> ChainModel {
        match self {
            Self::Bitcoin => ChainModel::Utxo,
            Self::Evm => ChainModel::Account,
        }
    }

    /// Default cycle interval: UTXO chains produce blocks far less often.
    pub fn default_sync_interval_ms(&self) -> u64 {
        match self {
            Self::Bitcoin => 450_000,
            Self::Evm => 15_000,
        }
    }
}

impl std::fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bitcoin => write!(f, "bitcoin"),
            Self::Evm => write!(f, "evm"),
        }
    }
}

/// Peer endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default = "default_rpc_timeout_ms")]
    pub timeout_ms: u64,
}

/// A token contract tracked on an account-model chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub currency_id: String,
    pub contract: String,
}

/// Configuration for one chain's crawler and parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain id, also the lane prefix (e.g. `"80000000"`).
    pub id: String,
    pub name: String,
    pub family: ChainFamily,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub rpc: RpcConfig,
    /// First block to record when the chain has no head yet.
    #[serde(default)]
    pub start_height: u64,
    /// Cycle interval; defaults per family.
    #[serde(default)]
    pub sync_interval_ms: Option<u64>,
    /// Blocks required on top before a transaction's `result` is set.
    #[serde(default)]
    pub confirmation_depth: u64,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// Fixed delay before a failed or unpublished row is queued again.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Parse jobs processed concurrently. 1 keeps a chain strictly sequential.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    #[serde(default = "default_max_rollback_depth")]
    pub max_rollback_depth: u64,
    /// Poll the mempool each cycle; defaults to on for UTXO chains.
    #[serde(default)]
    pub mempool: Option<bool>,
    #[serde(default = "default_mempool_fetch_limit")]
    pub mempool_fetch_limit: usize,
    /// Fetch receipts for execution status and gas used (EVM).
    #[serde(default)]
    pub fetch_receipts: bool,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    /// Unconsumed callback results kept per chain; older ones are dropped
    /// first. 0 keeps everything, for deployments with a callback consumer.
    #[serde(default = "default_callback_retention")]
    pub callback_retention: usize,
    pub native_currency_id: String,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

fn default_true() -> bool {
    true
}
fn default_rpc_timeout_ms() -> u64 {
    30_000
}
fn default_max_retry() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    60
}
fn default_prefetch() -> usize {
    1
}
fn default_max_rollback_depth() -> u64 {
    100
}
fn default_mempool_fetch_limit() -> usize {
    500
}
fn default_queue_timeout_ms() -> u64 {
    5_000
}
fn default_callback_retention() -> usize {
    10_000
}

impl ChainConfig {
    pub fn model(&self) -> ChainModel {
        self.family.model()
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(
            self.sync_interval_ms
                .unwrap_or_else(|| self.family.default_sync_interval_ms()),
        )
    }

    pub fn mempool_enabled(&self) -> bool {
        self.mempool.unwrap_or(self.family == ChainFamily::Bitcoin)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        let fail = |msg: &str| Err(LedgerError::Config(format!("chain {}: {msg}", self.id)));
        if self.id.is_empty() {
            return Err(LedgerError::Config("chain id must not be empty".into()));
        }
        if self.rpc.url.is_empty() {
            return fail("rpc.url must not be empty");
        }
        if self.native_currency_id.is_empty() {
            return fail("native_currency_id must not be empty");
        }
        if self.max_retry == 0 {
            return fail("max_retry must be at least 1");
        }
        if self.prefetch == 0 {
            return fail("prefetch must be at least 1");
        }
        if self.max_rollback_depth == 0 {
            return fail("max_rollback_depth must be at least 1");
        }
        if self.family == ChainFamily::Bitcoin && !self.tokens.is_empty() {
            return fail("token contracts are only supported on evm chains");
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    pub chains: Vec<ChainConfig>,
}

fn default_database_url() -> String {
    "sqlite:./chainledger.db?mode=rwc".into()
}

impl LedgerConfig {
    pub fn from_json(json: &str) -> Result<Self, LedgerError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| LedgerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| LedgerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        let mut seen = std::collections::HashSet::new();
        for chain in &self.chains {
            chain.validate()?;
            if !seen.insert(chain.id.as_str()) {
                return Err(LedgerError::Config(format!("duplicate chain id {}", chain.id)));
            }
        }
        Ok(())
    }

    pub fn enabled_chains(&self) -> impl Iterator<Item = &ChainConfig> {
        self.chains.iter().filter(|c| c.enabled)
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Fluent builder for `ChainConfig`.
///
/// ```rust
/// use chainledger_core::config::{ChainConfigBuilder, ChainFamily};
///
/// let config = ChainConfigBuilder::new("80000060", ChainFamily::Evm)
///     .name("ethereum")
///     .rpc_url("http://127.0.0.1:8545")
///     .native_currency("eth")
///     .confirmation_depth(12)
///     .token("usdt", "0xdac17f958d2ee523a2206206994597c13d831ec7")
///     .build()
///     .unwrap();
/// assert_eq!(config.sync_interval().as_millis(), 15_000);
/// ```
pub struct ChainConfigBuilder {
    config: ChainConfig,
}

impl ChainConfigBuilder {
    pub fn new(id: impl Into<String>, family: ChainFamily) -> Self {
        let id = id.into();
        Self {
            config: ChainConfig {
                name: id.clone(),
                id,
                family,
                enabled: true,
                rpc: RpcConfig {
                    url: String::new(),
                    user: None,
                    pass: None,
                    timeout_ms: default_rpc_timeout_ms(),
                },
                start_height: 0,
                sync_interval_ms: None,
                confirmation_depth: 0,
                max_retry: default_max_retry(),
                retry_delay_secs: default_retry_delay_secs(),
                prefetch: default_prefetch(),
                max_rollback_depth: default_max_rollback_depth(),
                mempool: None,
                mempool_fetch_limit: default_mempool_fetch_limit(),
                fetch_receipts: false,
                queue_timeout_ms: default_queue_timeout_ms(),
                callback_retention: default_callback_retention(),
                native_currency_id: String::new(),
                tokens: Vec::new(),
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.config.rpc.url = url.into();
        self
    }

    pub fn rpc_auth(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.config.rpc.user = Some(user.into());
        self.config.rpc.pass = Some(pass.into());
        self
    }

    pub fn rpc_timeout_ms(mut self, ms: u64) -> Self {
        self.config.rpc.timeout_ms = ms;
        self
    }

    pub fn start_height(mut self, height: u64) -> Self {
        self.config.start_height = height;
        self
    }

    pub fn sync_interval_ms(mut self, ms: u64) -> Self {
        self.config.sync_interval_ms = Some(ms);
        self
    }

    pub fn confirmation_depth(mut self, depth: u64) -> Self {
        self.config.confirmation_depth = depth;
        self
    }

    pub fn max_retry(mut self, max: u32) -> Self {
        self.config.max_retry = max;
        self
    }

    pub fn retry_delay_secs(mut self, secs: u64) -> Self {
        self.config.retry_delay_secs = secs;
        self
    }

    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.config.prefetch = prefetch;
        self
    }

    pub fn max_rollback_depth(mut self, depth: u64) -> Self {
        self.config.max_rollback_depth = depth;
        self
    }

    pub fn mempool(mut self, enabled: bool) -> Self {
        self.config.mempool = Some(enabled);
        self
    }

    pub fn fetch_receipts(mut self, enabled: bool) -> Self {
        self.config.fetch_receipts = enabled;
        self
    }

    pub fn queue_timeout_ms(mut self, ms: u64) -> Self {
        self.config.queue_timeout_ms = ms;
        self
    }

    pub fn native_currency(mut self, currency_id: impl Into<String>) -> Self {
        self.config.native_currency_id = currency_id.into();
        self
    }

    pub fn token(mut self, currency_id: impl Into<String>, contract: impl Into<String>) -> Self {
        self.config.tokens.push(TokenConfig {
            currency_id: currency_id.into(),
            contract: contract.into(),
        });
        self
    }

    pub fn build(self) -> Result<ChainConfig, LedgerError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
