//! chainledger-storage — SQLite persistence for ChainLedger.
//!
//! - [`sqlite::SqliteStore`]: the [`ChainStore`](chainledger_core::ChainStore)
//!   over one SQLite file, WAL mode, one transaction per multi-row operation
//! - [`queue::SqliteJobQueue`]: durable at-least-once
//!   [`JobQueue`](chainledger_core::queue::JobQueue) lanes, optionally sharing
//!   the store's pool
//!
//! The in-memory counterparts live in `chainledger-core` and are used by tests.

#[cfg(feature = "sqlite")]
pub mod queue;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use queue::SqliteJobQueue;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
