//! In-process transient store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::TransientStore;
use crate::Result;

#[derive(Default)]
struct ListSlot {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

/// Transient store kept in process memory.
///
/// Blocking pops park on a [`Notify`] instead of polling. Contents are lost on
/// restart; the recovery sweep rebuilds the queue from the durable store.
#[derive(Default)]
pub struct MemoryStore {
    hashes: DashMap<String, HashMap<String, String>>,
    lists: DashMap<String, Arc<ListSlot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, name: &str) -> Arc<ListSlot> {
        self.lists
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ListSlot::default()))
            .clone()
    }
}

#[async_trait]
impl TransientStore for MemoryStore {
    async fn hset(&self, key: &str, fields: Vec<(String, String)>) -> Result<()> {
        self.hashes.entry(key.to_string()).or_default().extend(fields);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .hashes
            .get(key)
            .map(|hash| hash.clone())
            .unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.hashes.remove(key).is_some())
    }

    async fn lpush(&self, list: &str, value: String) -> Result<usize> {
        let slot = self.list(list);
        let len = {
            let mut items = slot.items.lock();
            items.push_front(value);
            items.len()
        };
        slot.notify.notify_one();
        Ok(len)
    }

    async fn brpop(&self, list: &str, timeout: Duration) -> Result<Option<String>> {
        let slot = self.list(list);
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking, so a push between the check
            // and the wait is not missed.
            let notified = slot.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (popped, remaining) = {
                let mut items = slot.items.lock();
                let popped = items.pop_back();
                (popped, items.len())
            };

            if let Some(value) = popped {
                // Pass the wakeup on so another waiter drains what is left.
                if remaining > 0 {
                    slot.notify.notify_one();
                }
                return Ok(Some(value));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn llen(&self, list: &str) -> Result<usize> {
        Ok(self
            .lists
            .get(list)
            .map(|slot| slot.items.lock().len())
            .unwrap_or(0))
    }
}
