use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

/// Why a wait on a pending request ended without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// No slot registered under the id, or another waiter already took it.
    Unknown,
    /// The deadline passed first.
    Timeout,
}

struct Slot<T> {
    tx: Option<oneshot::Sender<T>>,
    rx: Option<oneshot::Receiver<T>>,
}

/// Message id to one-shot response slot.
///
/// A slot is created before the request leaves, filled at most once by the
/// response handler, and removed when the waiter finishes (success or
/// timeout). Late or duplicate deliveries are dropped.
pub struct PendingRequests<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }
}

impl<T: Send> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot for `id`. Re-registering replaces any previous slot.
    pub fn insert(&self, id: &str) {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.to_string(), Slot { tx: Some(tx), rx: Some(rx) });
    }

    /// Drop the slot for `id` without waiting.
    pub fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Fill the slot for `id`. Returns false if there is no open slot, in
    /// which case the value is discarded.
    pub fn deliver(&self, id: &str, value: T) -> bool {
        let tx = {
            let mut slots = self.lock();
            let Some(slot) = slots.get_mut(id) else {
                tracing::debug!(message_id = id, "No pending request for response");
                return false;
            };
            let Some(tx) = slot.tx.take() else {
                tracing::debug!(message_id = id, "Duplicate response dropped");
                return false;
            };
            if slot.rx.is_none() && tx.is_closed() {
                slots.remove(id);
                return false;
            }
            tx
        };
        tx.send(value).is_ok()
    }

    /// Wait for the slot of `id` to be filled, logging on every `poll` tick,
    /// until `timeout` passes. The slot is removed either way.
    pub async fn wait(&self, id: &str, poll: Duration, timeout: Duration) -> Result<T, WaitError> {
        let rx = {
            let mut slots = self.lock();
            match slots.get_mut(id).and_then(|s| s.rx.take()) {
                Some(rx) => rx,
                None => return Err(WaitError::Unknown),
            }
        };

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        tokio::pin!(rx);
        let mut ticker = tokio::time::interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                res = &mut rx => break res.map_err(|_| WaitError::Unknown),
                _ = ticker.tick() => {
                    tracing::debug!(message_id = id, "Waiting for relayed response");
                }
                _ = &mut deadline => break Err(WaitError::Timeout),
            }
        };

        self.lock().remove(id);
        result
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const POLL: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn delivered_value_reaches_waiter_once() {
        let pending = Arc::new(PendingRequests::<u32>::new());
        pending.insert("m1");

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.wait("m1", POLL, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pending.deliver("m1", 7));
        assert!(!pending.deliver("m1", 8));

        assert_eq!(waiter.await.unwrap(), Ok(7));
        assert!(!pending.contains("m1"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn delivery_before_wait_is_kept() {
        let pending = PendingRequests::<&'static str>::new();
        pending.insert("m1");
        assert!(pending.deliver("m1", "early"));
        assert_eq!(pending.wait("m1", POLL, Duration::from_secs(1)).await, Ok("early"));
    }

    #[tokio::test]
    async fn unknown_id_is_dropped() {
        let pending = PendingRequests::<u32>::new();
        assert!(!pending.deliver("nope", 1));
        assert_eq!(pending.wait("nope", POLL, POLL).await, Err(WaitError::Unknown));
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_slot() {
        let pending = PendingRequests::<u32>::new();
        pending.insert("m1");
        let res = pending.wait("m1", Duration::from_secs(3), Duration::from_secs(10)).await;
        assert_eq!(res, Err(WaitError::Timeout));
        assert!(!pending.contains("m1"));

        // A late response after the timeout is discarded.
        assert!(!pending.deliver("m1", 5));
    }

    #[tokio::test]
    async fn second_waiter_is_rejected() {
        let pending = Arc::new(PendingRequests::<u32>::new());
        pending.insert("m1");
        let first = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.wait("m1", POLL, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pending.wait("m1", POLL, POLL).await, Err(WaitError::Unknown));
        pending.deliver("m1", 3);
        assert_eq!(first.await.unwrap(), Ok(3));
    }
}
