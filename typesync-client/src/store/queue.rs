//! Durable task queue
//!
//! A list of payloads persisted under one key, each tagged with the time it was
//! queued and a deadline after which it is discarded unprocessed. Used for
//! deferred entitlement writes and actions requested before sign-in.

use super::secure::SecureStore;
use crate::ClientResult;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use typesync_core::SharedClock;
use tracing::{debug, info};

/// One queued payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask<T> {
    pub id: String,
    pub payload: T,
    pub queued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T> QueuedTask<T> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// TTL-bound queue persisted in the secure store
pub struct DurableQueue<T> {
    store: SecureStore,
    key: &'static str,
    ttl: Duration,
    clock: SharedClock,
    _payload: PhantomData<fn() -> T>,
}

impl<T> DurableQueue<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn new(store: SecureStore, key: &'static str, ttl: Duration, clock: SharedClock) -> Self {
        Self {
            store,
            key,
            ttl,
            clock,
            _payload: PhantomData,
        }
    }

    /// Append a payload; returns the task id
    pub fn enqueue(&self, payload: T) -> ClientResult<String> {
        let now = self.clock.now();
        let task = QueuedTask {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            queued_at: now,
            expires_at: now + self.ttl,
        };
        let id = task.id.clone();

        let mut tasks = self.load();
        tasks.push(task);
        self.store.put(self.key, &tasks, None)?;

        debug!(queue = self.key, task_id = %id, "Task queued");
        Ok(id)
    }

    /// Unexpired tasks, oldest first, without removing them
    pub fn pending(&self) -> Vec<QueuedTask<T>> {
        let now = self.clock.now();
        self.load()
            .into_iter()
            .filter(|task| !task.is_expired(now))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every task and return the unexpired ones
    pub fn drain(&self) -> Vec<QueuedTask<T>> {
        let now = self.clock.now();
        let tasks = self.load();
        if tasks.is_empty() {
            return tasks;
        }
        self.store.remove(self.key);

        let total = tasks.len();
        let live: Vec<_> = tasks
            .into_iter()
            .filter(|task| !task.is_expired(now))
            .collect();
        if live.len() < total {
            info!(
                queue = self.key,
                discarded = total - live.len(),
                "Discarded expired queued tasks"
            );
        }
        live
    }

    /// Put drained tasks back, keeping their original deadlines
    pub fn restore(&self, returned: Vec<QueuedTask<T>>) -> ClientResult<()> {
        if returned.is_empty() {
            return Ok(());
        }
        let mut tasks = self.load();
        tasks.extend(returned);
        self.store.put(self.key, &tasks, None)
    }

    pub fn clear(&self) {
        self.store.remove(self.key);
    }

    fn load(&self) -> Vec<QueuedTask<T>> {
        self.store
            .get::<Vec<QueuedTask<T>>>(self.key)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TabId;
    use crate::store::SharedStore;
    use std::sync::Arc;
    use typesync_core::ManualClock;

    fn queue(clock: &ManualClock, ttl: Duration) -> DurableQueue<String> {
        let shared = SharedStore::in_memory();
        let store = SecureStore::new(shared.handle(TabId::new()), Arc::new(clock.clone()));
        DurableQueue::new(store, "test.queue", ttl, Arc::new(clock.clone()))
    }

    #[test]
    fn test_drain_discards_expired_tasks() {
        let clock = ManualClock::default();
        let queue = queue(&clock, Duration::hours(24));

        queue.enqueue("old".to_string()).unwrap();
        clock.advance(Duration::hours(23));
        queue.enqueue("fresh".to_string()).unwrap();
        clock.advance(Duration::hours(2));

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, "fresh");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_restore_keeps_original_deadline() {
        let clock = ManualClock::default();
        let queue = queue(&clock, Duration::minutes(10));

        queue.enqueue("retry-me".to_string()).unwrap();
        let drained = queue.drain();
        let deadline = drained[0].expires_at;
        queue.restore(drained).unwrap();

        assert_eq!(queue.pending()[0].expires_at, deadline);

        clock.advance(Duration::minutes(11));
        assert!(queue.drain().is_empty());
    }
}
