//! The `JobQueue` trait — durable, at-least-once lanes between crawler and parser.
//!
//! Each chain owns two lanes:
//!
//! ```text
//! Crawler ──► <chain_id>ParseJob ──► Parser ──► <chain_id>ParseJobCallback ──► consumers
//! ```
//!
//! A received message stays in flight until it is acknowledged. Messages left
//! in flight by a crashed consumer are returned to the lane by [`JobQueue::recover`],
//! which the parser calls on start. Consumers must therefore be idempotent.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

pub use memory::MemoryJobQueue;

/// Work lane name for a chain.
pub fn work_lane(chain_id: &str) -> String {
    format!("{chain_id}ParseJob")
}

/// Callback lane name for a chain.
pub fn callback_lane(chain_id: &str) -> String {
    format!("{chain_id}ParseJobCallback")
}

/// A message handed to a consumer, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub lane: String,
    pub payload: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Durably append `payload` to `lane`.
    async fn publish(&self, lane: &str, payload: String) -> Result<(), LedgerError>;

    /// Wait up to `timeout` for the next message. `None` if the lane stayed empty.
    async fn receive(
        &self,
        lane: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, LedgerError>;

    /// Remove a delivered message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), LedgerError>;

    /// Return every unacknowledged in-flight message of `lane` to the front.
    async fn recover(&self, lane: &str) -> Result<usize, LedgerError>;

    /// Messages waiting on `lane`, excluding in-flight ones.
    async fn depth(&self, lane: &str) -> Result<usize, LedgerError>;
}

/// Publish with an upper bound on how long the broker may take.
pub async fn publish_with_timeout(
    queue: &dyn JobQueue,
    lane: &str,
    payload: String,
    timeout: Duration,
) -> Result<(), LedgerError> {
    tokio::time::timeout(timeout, queue.publish(lane, payload))
        .await
        .map_err(|_| {
            LedgerError::Queue(format!(
                "publish to {lane} timed out after {}ms",
                timeout.as_millis()
            ))
        })?
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// Work-lane message: parse one unparsed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub chain_id: String,
    pub txid: String,
    pub block_height: Option<u64>,
    pub enqueued_at: i64,
}

impl JobDescriptor {
    pub fn new(chain_id: impl Into<String>, txid: impl Into<String>, block_height: Option<u64>) -> Self {
        Self {
            chain_id: chain_id.into(),
            txid: txid.into(),
            block_height,
            enqueued_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn to_payload(&self) -> Result<String, LedgerError> {
        serde_json::to_string(self).map_err(|e| LedgerError::Queue(e.to_string()))
    }

    pub fn from_payload(payload: &str) -> Result<Self, LedgerError> {
        serde_json::from_str(payload)
            .map_err(|e| LedgerError::Queue(format!("malformed job descriptor: {e}")))
    }
}

/// Outcome of one parse job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Effects were written to the ledger.
    Applied,
    /// Nothing watched was involved; the row was discarded.
    Irrelevant,
    /// The row no longer exists (already parsed or rolled back).
    AlreadyParsed,
    /// The row was rolled back or replaced while it was being parsed; its
    /// effects were dropped.
    Superseded,
    /// Processing failed; the row will be retried.
    Failed,
    /// The row exhausted its retries and is skipped from now on.
    Abandoned,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Irrelevant => write!(f, "irrelevant"),
            Self::AlreadyParsed => write!(f, "already_parsed"),
            Self::Superseded => write!(f, "superseded"),
            Self::Failed => write!(f, "failed"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Callback-lane message. Delivery is at-least-once with no ordering guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub chain_id: String,
    pub txid: String,
    pub status: JobStatus,
    pub retry_count: u32,
    /// Watched addresses whose ledger changed.
    pub addresses: Vec<String>,
    pub block_height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processed_at: i64,
}

impl JobResult {
    pub fn new(job: &JobDescriptor, status: JobStatus) -> Self {
        Self {
            chain_id: job.chain_id.clone(),
            txid: job.txid.clone(),
            status,
            retry_count: 0,
            addresses: Vec::new(),
            block_height: job.block_height,
            error: None,
            processed_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn to_payload(&self) -> Result<String, LedgerError> {
        serde_json::to_string(self).map_err(|e| LedgerError::Queue(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_names() {
        assert_eq!(work_lane("80000000"), "80000000ParseJob");
        assert_eq!(callback_lane("80000060"), "80000060ParseJobCallback");
    }

    #[test]
    fn descriptor_payload() {
        let job = JobDescriptor::new("80000000", "ab12", Some(99));
        let back = JobDescriptor::from_payload(&job.to_payload().unwrap()).unwrap();
        assert_eq!(back, job);
        assert!(JobDescriptor::from_payload("{\"txid\":1}").is_err());
    }

    #[test]
    fn result_serializes_status_in_snake_case() {
        let job = JobDescriptor::new("80000000", "ab12", None);
        let json = JobResult::new(&job, JobStatus::AlreadyParsed).to_payload().unwrap();
        assert!(json.contains("\"status\":\"already_parsed\""));
        assert!(!json.contains("\"error\""));
    }
}
