//! In-memory job queue for tests and single-process pipelines.
//!
//! Not durable across restarts; use `SqliteJobQueue` for that.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::LedgerError;
use crate::queue::{Delivery, JobQueue};

#[derive(Default)]
struct Lane {
    ready: VecDeque<Delivery>,
    inflight: BTreeMap<u64, Delivery>,
}

/// In-memory [`JobQueue`] with per-lane ready and in-flight sets.
#[derive(Default)]
pub struct MemoryJobQueue {
    lanes: Mutex<HashMap<String, Lane>>,
    next_id: AtomicU64,
    notify: Notify,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently delivered but not acknowledged.
    pub fn inflight(&self, lane: &str) -> usize {
        self.lanes
            .lock()
            .map(|l| l.get(lane).map(|l| l.inflight.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    fn try_take(&self, lane: &str) -> Result<Option<Delivery>, LedgerError> {
        let mut lanes = self.lanes()?;
        let Some(state) = lanes.get_mut(lane) else {
            return Ok(None);
        };
        Ok(state.ready.pop_front().map(|mut d| {
            d.delivery_count += 1;
            state.inflight.insert(d.id, d.clone());
            d
        }))
    }

    fn lanes(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Lane>>, LedgerError> {
        self.lanes
            .lock()
            .map_err(|_| LedgerError::Queue("memory queue poisoned".into()))
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn publish(&self, lane: &str, payload: String) -> Result<(), LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.lanes()?
            .entry(lane.to_string())
            .or_default()
            .ready
            .push_back(Delivery {
                id,
                lane: lane.to_string(),
                payload,
                delivery_count: 0,
            });
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        lane: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, LedgerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking, so a publish in between is not missed.
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_take(lane)? {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), LedgerError> {
        let mut lanes = self.lanes()?;
        if let Some(state) = lanes.get_mut(&delivery.lane) {
            if state.inflight.remove(&delivery.id).is_none() {
                // Acked after a recover: drop the requeued copy.
                state.ready.retain(|d| d.id != delivery.id);
            }
        }
        Ok(())
    }

    async fn recover(&self, lane: &str) -> Result<usize, LedgerError> {
        let recovered = {
            let mut lanes = self.lanes()?;
            let Some(state) = lanes.get_mut(lane) else {
                return Ok(0);
            };
            let inflight = std::mem::take(&mut state.inflight);
            let count = inflight.len();
            for (_, d) in inflight.into_iter().rev() {
                state.ready.push_front(d);
            }
            count
        };
        if recovered > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn depth(&self, lane: &str) -> Result<usize, LedgerError> {
        Ok(self.lanes()?.get(lane).map(|l| l.ready.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const LANE: &str = "80000000ParseJob";

    #[tokio::test]
    async fn fifo_delivery_and_ack() {
        let q = MemoryJobQueue::new();
        q.publish(LANE, "a".into()).await.unwrap();
        q.publish(LANE, "b".into()).await.unwrap();

        let d1 = q.receive(LANE, Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(d1.payload, "a");
        assert_eq!(d1.delivery_count, 1);
        assert_eq!(q.inflight(LANE), 1);

        q.ack(&d1).await.unwrap();
        assert_eq!(q.inflight(LANE), 0);
        assert_eq!(q.depth(LANE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_lane_times_out() {
        let q = MemoryJobQueue::new();
        let got = q.receive(LANE, Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered_after_recover() {
        let q = MemoryJobQueue::new();
        q.publish(LANE, "a".into()).await.unwrap();
        q.publish(LANE, "b".into()).await.unwrap();
        let _lost = q.receive(LANE, Duration::from_millis(10)).await.unwrap().unwrap();

        assert_eq!(q.recover(LANE).await.unwrap(), 1);
        let again = q.receive(LANE, Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.payload, "a");
        assert!(again.is_redelivery());
    }

    #[tokio::test]
    async fn receive_wakes_on_publish() {
        let q = Arc::new(MemoryJobQueue::new());
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.receive(LANE, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.publish(LANE, "late".into()).await.unwrap();
        let got = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(got.payload, "late");
    }

    #[tokio::test]
    async fn lanes_are_independent() {
        let q = MemoryJobQueue::new();
        q.publish("80000060ParseJob", "eth".into()).await.unwrap();
        assert!(q.receive(LANE, Duration::from_millis(10)).await.unwrap().is_none());
        assert_eq!(q.depth("80000060ParseJob").await.unwrap(), 1);
    }
}
