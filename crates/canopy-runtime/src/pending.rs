//! Correlation of request envelopes with their responses.
//!
//! Each bus endpoint owns one `PendingResponses` table. Waiters carry an
//! optional deadline held in a heap; a housekeeping task polls the heap
//! head once per second and fails elapsed waiters. Responses arriving
//! after a timeout are dropped silently.

use crate::error::{ActorError, Result};
use canopy_protocol::Envelope;
use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct PendingResponses {
    waiters: DashMap<u64, oneshot::Sender<Result<Envelope>>>,
    deadlines: Mutex<BinaryHeap<Reverse<(Instant, u64)>>>,
}

impl PendingResponses {
    pub fn new() -> Arc<Self> {
        let this = Arc::new(Self {
            waiters: DashMap::new(),
            deadlines: Mutex::new(BinaryHeap::new()),
        });
        spawn_expiry_task(Arc::downgrade(&this));
        this
    }

    /// Register a waiter. The receiver resolves with the correlated
    /// envelope, a timeout, or a transport error.
    pub fn register(
        &self,
        id: u64,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<Result<Envelope>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        if let Some(timeout) = timeout {
            if let Ok(mut heap) = self.deadlines.lock() {
                heap.push(Reverse((Instant::now() + timeout, id)));
            }
        }
        rx
    }

    /// Complete a waiter. Returns false when no waiter exists (already
    /// timed out, or the envelope was unsolicited).
    pub fn complete(&self, id: u64, envelope: Envelope) -> bool {
        match self.waiters.remove(&id) {
            Some((_, tx)) => tx.send(Ok(envelope)).is_ok(),
            None => false,
        }
    }

    /// Drop a waiter without completing it (e.g. its send failed).
    pub fn forget(&self, id: u64) {
        self.waiters.remove(&id);
    }

    /// Fail every outstanding waiter with a transport error.
    pub fn fail_all(&self, message: &str) {
        let ids: Vec<u64> = self.waiters.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.waiters.remove(&id) {
                let _ = tx.send(Err(ActorError::Transport(message.to_string())));
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.waiters.len()
    }

    fn expire(&self, now: Instant) {
        let mut elapsed = Vec::new();
        if let Ok(mut heap) = self.deadlines.lock() {
            while let Some(Reverse((deadline, id))) = heap.peek().copied() {
                if deadline > now {
                    break;
                }
                heap.pop();
                elapsed.push(id);
            }
        }
        for id in elapsed {
            if let Some((_, tx)) = self.waiters.remove(&id) {
                let _ = tx.send(Err(ActorError::Timeout));
            }
        }
    }
}

fn spawn_expiry_task(table: Weak<PendingResponses>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(table) = table.upgrade() else { break };
            table.expire(Instant::now());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_protocol::{ActorId, EnvelopePayload};

    fn response(id: u64) -> Envelope {
        Envelope::new(id, ActorId::generate(), EnvelopePayload::ActorDestroyed)
    }

    #[tokio::test]
    async fn test_complete_resolves_waiter() {
        let table = PendingResponses::new();
        let rx = table.register(1, None);

        assert!(table.complete(1, response(1)));
        let env = rx.await.unwrap().unwrap();
        assert_eq!(env.id, 1);
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_late_response_is_dropped() {
        let table = PendingResponses::new();
        assert!(!table.complete(99, response(99)));
    }

    #[tokio::test]
    async fn test_timeout_fires() {
        let table = PendingResponses::new();
        let rx = table.register(2, Some(Duration::from_millis(20)));

        // The poll loop runs once per second; give it one full cycle.
        let result = tokio::time::timeout(Duration::from_secs(3), rx)
            .await
            .expect("expiry task never fired")
            .unwrap();
        assert!(matches!(result, Err(ActorError::Timeout)));

        // A response arriving after the timeout is ignored.
        assert!(!table.complete(2, response(2)));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let table = PendingResponses::new();
        let rx1 = table.register(1, None);
        let rx2 = table.register(2, None);

        table.fail_all("peer exited");

        for rx in [rx1, rx2] {
            let result = rx.await.unwrap();
            assert!(matches!(result, Err(ActorError::Transport(_))));
        }
    }
}
