//! Persists `instances.json` as a `request_id`-style map keyed by instance
//! id, so a transition callback can upsert one entry without reloading and
//! re-serialising the whole table.

use controller_core::{AgentInstance, JsonStateFile, StateError};
use std::collections::HashMap;
use std::path::PathBuf;

pub struct InstanceStore {
    store: JsonStateFile<HashMap<String, AgentInstance>>,
}

impl InstanceStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = state_dir.into().join("instances.json");
        let store = JsonStateFile::new(path.clone()).map_err(|e| StateError::Io { path, source: e })?;
        Ok(Self { store })
    }

    pub fn load_all(&self) -> Result<Vec<AgentInstance>, StateError> {
        Ok(self.store.read()?.into_values().collect())
    }

    pub fn upsert(&self, instance: &AgentInstance) -> Result<(), StateError> {
        self.store.with_exclusive(|map| {
            map.insert(instance.id.clone(), instance.clone());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use controller_core::InstanceState;
    use tempfile::TempDir;

    fn sample(id: &str) -> AgentInstance {
        AgentInstance {
            id: id.to_string(),
            directory: PathBuf::from("/tmp/proj"),
            port: 4100,
            state: InstanceState::Running,
            pid: Some(1234),
            started_at: None,
            last_health_check: None,
            consecutive_health_failures: 0,
            provider_id: "deepseek".to_string(),
            model_id: "deepseek-reasoner".to_string(),
            name: None,
            restart_count: 0,
            last_error: None,
            browser_opened: false,
            instance_type: None,
        }
    }

    #[test]
    fn upsert_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path()).unwrap();
        store.upsert(&sample("abc")).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "abc");
    }

    #[test]
    fn repeated_upsert_of_same_id_does_not_duplicate() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path()).unwrap();
        store.upsert(&sample("abc")).unwrap();
        let mut updated = sample("abc");
        updated.state = InstanceState::Stopped;
        store.upsert(&updated).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, InstanceState::Stopped);
    }

    #[test]
    fn empty_store_loads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path()).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
