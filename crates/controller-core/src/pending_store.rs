//! Deduplicates pending-interaction notifications across the periodic and
//! on-demand polling paths.

use crate::error::StateError;
use crate::file_lock::JsonStateFile;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// A notification target: either a bare chat or a `(chat, topic)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyTarget {
    Chat(i64),
    Topic(i64, i32),
}

/// Persistent `request_id -> {targets already notified}` map.
///
/// Persisting this (rather than keeping it purely in memory) means a daemon
/// restart does not re-notify targets for a permission/question the agent
/// still has pending.
pub struct PendingStore {
    store: JsonStateFile<HashMap<String, HashSet<NotifyTarget>>>,
}

impl PendingStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = state_dir.into().join("pending_state.json");
        let store = JsonStateFile::new(path.clone()).map_err(|e| StateError::Io {
            path,
            source: e,
        })?;
        Ok(Self { store })
    }

    /// Returns true if `target` has not yet been notified for `request_id`,
    /// and records it as notified if so (test-and-set, atomic under the
    /// exclusive lock).
    pub fn mark_notified_if_new(
        &self,
        request_id: &str,
        target: NotifyTarget,
    ) -> Result<bool, StateError> {
        self.store.with_exclusive(|map| {
            let targets = map.entry(request_id.to_string()).or_default();
            targets.insert(target)
        })
    }

    pub fn clear(&self, request_id: &str) -> Result<(), StateError> {
        self.store.with_exclusive(|map| {
            map.remove(request_id);
        })
    }

    pub fn notified_targets(&self, request_id: &str) -> Result<HashSet<NotifyTarget>, StateError> {
        Ok(self
            .store
            .read()?
            .get(request_id)
            .cloned()
            .unwrap_or_default())
    }

    /// Sweep-time reconciliation: drops tracked `request_id`s absent from
    /// `still_pending` for a given instance's sweep, bounding growth against
    /// agents that recycle request ids without ever answering them through us.
    pub fn reconcile(&self, still_pending: &HashSet<String>) -> Result<(), StateError> {
        self.store.with_exclusive(|map| {
            map.retain(|request_id, _| still_pending.contains(request_id));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_notification_for_target_returns_true() {
        let dir = TempDir::new().unwrap();
        let store = PendingStore::new(dir.path()).unwrap();
        assert!(store
            .mark_notified_if_new("r1", NotifyTarget::Chat(1))
            .unwrap());
    }

    #[test]
    fn duplicate_notification_for_same_target_returns_false() {
        let dir = TempDir::new().unwrap();
        let store = PendingStore::new(dir.path()).unwrap();
        store.mark_notified_if_new("r1", NotifyTarget::Chat(1)).unwrap();
        assert!(!store
            .mark_notified_if_new("r1", NotifyTarget::Chat(1))
            .unwrap());
    }

    #[test]
    fn different_targets_are_independently_tracked() {
        let dir = TempDir::new().unwrap();
        let store = PendingStore::new(dir.path()).unwrap();
        assert!(store
            .mark_notified_if_new("r1", NotifyTarget::Chat(1))
            .unwrap());
        assert!(store
            .mark_notified_if_new("r1", NotifyTarget::Chat(2))
            .unwrap());
    }

    #[test]
    fn clear_allows_renotification() {
        let dir = TempDir::new().unwrap();
        let store = PendingStore::new(dir.path()).unwrap();
        store.mark_notified_if_new("r1", NotifyTarget::Chat(1)).unwrap();
        store.clear("r1").unwrap();
        assert!(store
            .mark_notified_if_new("r1", NotifyTarget::Chat(1))
            .unwrap());
    }

    #[test]
    fn reconcile_drops_resolved_request_ids() {
        let dir = TempDir::new().unwrap();
        let store = PendingStore::new(dir.path()).unwrap();
        store.mark_notified_if_new("r1", NotifyTarget::Chat(1)).unwrap();
        store.mark_notified_if_new("r2", NotifyTarget::Chat(1)).unwrap();

        let still_pending: HashSet<String> = ["r2".to_string()].into_iter().collect();
        store.reconcile(&still_pending).unwrap();

        assert!(store.notified_targets("r1").unwrap().is_empty());
        assert!(!store.notified_targets("r2").unwrap().is_empty());
    }
}
