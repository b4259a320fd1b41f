//! Registry of active relays.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::{StreamInfo, StreamStatus};
use crate::media::RelaySpec;

/// Mutable part of a stream entry.
#[derive(Debug, Clone)]
pub(crate) struct SlotState {
    pub status: StreamStatus,
    pub reconnect_attempt: u32,
    pub error: Option<String>,
}

/// One active relay.
///
/// Every status change goes through `state`, and the lock is held until the
/// change has reached the transient store, so a `Stopped` written by a stop
/// request is never overwritten by the monitor.
pub(crate) struct StreamSlot {
    pub spec: RelaySpec,
    pub preview_url: String,
    pub started_at: DateTime<Utc>,
    pub state: tokio::sync::Mutex<SlotState>,
    /// Cancelled once a stop has been requested.
    pub stop: CancellationToken,
    pub monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl StreamSlot {
    pub fn new(spec: RelaySpec, preview_url: String, stop: CancellationToken) -> Self {
        Self {
            spec,
            preview_url,
            started_at: Utc::now(),
            state: tokio::sync::Mutex::new(SlotState {
                status: StreamStatus::Live,
                reconnect_attempt: 0,
                error: None,
            }),
            stop,
            monitor: parking_lot::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.stream_id
    }

    /// Build the externally visible view from a locked state.
    pub fn info(&self, state: &SlotState) -> StreamInfo {
        StreamInfo {
            stream_id: self.spec.stream_id.clone(),
            source_url: self.spec.source_url.clone(),
            relay_url: self.spec.relay_url.clone(),
            preview_url: self.preview_url.clone(),
            has_audio: self.spec.has_audio,
            status: state.status,
            reconnect_attempt: state.reconnect_attempt,
            error: state.error.clone(),
            started_at: self.started_at,
        }
    }

    pub async fn snapshot(&self) -> StreamInfo {
        let state = self.state.lock().await;
        self.info(&state)
    }
}

#[derive(Default)]
pub(crate) struct StreamRegistry {
    entries: DashMap<String, Arc<StreamSlot>>,
}

impl StreamRegistry {
    pub fn contains(&self, stream_id: &str) -> bool {
        self.entries.contains_key(stream_id)
    }

    /// Whether `slot` itself (not just a slot with the same id) is registered.
    pub fn holds(&self, slot: &Arc<StreamSlot>) -> bool {
        self.entries
            .get(slot.id())
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), slot))
    }

    pub fn get(&self, stream_id: &str) -> Option<Arc<StreamSlot>> {
        self.entries.get(stream_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert unless the id is already taken.
    pub fn try_insert(&self, slot: Arc<StreamSlot>) -> bool {
        match self.entries.entry(slot.id().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                true
            }
        }
    }

    /// Remove `slot`, leaving a newer entry under the same id untouched.
    pub fn remove(&self, slot: &Arc<StreamSlot>) -> bool {
        self.entries
            .remove_if(slot.id(), |_, current| Arc::ptr_eq(current, slot))
            .is_some()
    }

    /// Registered slots ordered by id.
    pub fn slots(&self) -> Vec<Arc<StreamSlot>> {
        let mut slots: Vec<_> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        slots.sort_by(|a, b| a.id().cmp(b.id()));
        slots
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: &str) -> Arc<StreamSlot> {
        Arc::new(StreamSlot::new(
            RelaySpec {
                stream_id: id.to_string(),
                source_url: "rtsp://cam/1".to_string(),
                relay_url: format!("rtmp://relay/live/{id}"),
                has_audio: false,
            },
            format!("http://preview/{id}/index.m3u8"),
            CancellationToken::new(),
        ))
    }

    #[test]
    fn test_try_insert_rejects_duplicate_id() {
        let registry = StreamRegistry::default();
        assert!(registry.try_insert(slot("a")));
        assert!(!registry.try_insert(slot("a")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_only_matching_slot() {
        let registry = StreamRegistry::default();
        let old = slot("a");
        assert!(registry.try_insert(Arc::clone(&old)));
        assert!(registry.remove(&old));

        let new = slot("a");
        assert!(registry.try_insert(Arc::clone(&new)));
        assert!(!registry.remove(&old));
        assert!(registry.holds(&new));
        assert!(!registry.holds(&old));
    }

    #[test]
    fn test_slots_sorted() {
        let registry = StreamRegistry::default();
        for id in ["c", "a", "b"] {
            registry.try_insert(slot(id));
        }
        let ids: Vec<String> = registry.slots().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_snapshot_starts_live() {
        let info = slot("a").snapshot().await;
        assert_eq!(info.status, StreamStatus::Live);
        assert_eq!(info.reconnect_attempt, 0);
        assert!(info.error.is_none());
    }
}
