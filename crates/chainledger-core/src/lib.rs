//! chainledger-core — crawl-and-parse pipeline for wallet ledgers.
//!
//! # Architecture
//!
//! ```text
//! Manager ── per enabled chain ──┐
//!                                ├── Crawler  (PeerAdapter → ChainStore, publishes <chain>ParseJob)
//!                                │      └── reorg walk-back, mempool diff, fee sampling
//!                                └── Parser   (<chain>ParseJob → Decoder → plan_effects → ChainStore)
//!                                       └── <chain>ParseJobCallback
//! Storage backends: memory here, SQLite in chainledger-storage.
//! Peers and decoders: chainledger-bitcoin, chainledger-evm.
//! ```

pub mod address;
pub mod amount;
pub mod config;
pub mod crawler;
pub mod decode;
pub mod error;
pub mod manager;
pub mod parser;
pub mod peer;
pub mod queue;
pub mod reorg;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_util;

pub use address::{issue_address, AddressDeriver, DerivedKey};
pub use amount::Amount;
pub use config::{ChainConfig, ChainConfigBuilder, ChainFamily, LedgerConfig};
pub use crawler::{Crawler, CrawlerConfig, CrawlerState, CycleReport, SyncHook};
pub use decode::{DecodedTransaction, Decoder};
pub use error::LedgerError;
pub use manager::{ChainPipeline, Manager, PipelineFactory};
pub use parser::{Parser, ParserConfig};
pub use peer::{PeerAdapter, RawBlock, RawTransaction};
pub use queue::{JobDescriptor, JobQueue, JobResult, JobStatus};
pub use reorg::ReorgEvent;
pub use store::{ChainStore, ParseEffects};
pub use types::{BlockchainHead, ChainModel};
