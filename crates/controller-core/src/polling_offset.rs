//! The Telegram long-poll offset, persisted after each batch so a restart
//! never reprocesses already-consumed updates.

use crate::error::StateError;
use crate::file_lock::JsonStateFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OffsetDocument {
    offset: i64,
    updated_at: DateTime<Utc>,
}

impl Default for OffsetDocument {
    fn default() -> Self {
        Self {
            offset: 0,
            updated_at: Utc::now(),
        }
    }
}

pub struct PollingOffsetStore {
    store: JsonStateFile<OffsetDocument>,
}

impl PollingOffsetStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = state_dir.into().join("polling_offset.json");
        let store = JsonStateFile::new(path.clone()).map_err(|e| StateError::Io {
            path,
            source: e,
        })?;
        Ok(Self { store })
    }

    pub fn load(&self) -> Result<i64, StateError> {
        Ok(self.store.read()?.offset)
    }

    /// Advances the persisted offset. A no-op (but not an error) if `offset`
    /// would decrease it, preserving the monotonicity invariant even if a
    /// stale batch result is saved out of order.
    pub fn advance(&self, offset: i64) -> Result<(), StateError> {
        self.store.with_exclusive(|doc| {
            if offset > doc.offset {
                doc.offset = offset;
                doc.updated_at = Utc::now();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_store_starts_at_zero() {
        let dir = TempDir::new().unwrap();
        let store = PollingOffsetStore::new(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), 0);
    }

    #[test]
    fn advance_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let store = PollingOffsetStore::new(dir.path()).unwrap();
        store.advance(42).unwrap();
        let reloaded = PollingOffsetStore::new(dir.path()).unwrap();
        assert_eq!(reloaded.load().unwrap(), 42);
    }

    #[test]
    fn advance_never_decreases_offset() {
        let dir = TempDir::new().unwrap();
        let store = PollingOffsetStore::new(dir.path()).unwrap();
        store.advance(100).unwrap();
        store.advance(50).unwrap();
        assert_eq!(store.load().unwrap(), 100);
    }
}
