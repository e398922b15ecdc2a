//! Persistent mapping of Telegram conversation contexts to agent instances,
//! remembered sessions, and model preferences.

use crate::error::StateError;
use crate::file_lock::JsonStateFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// A context key: either a bare chat, or a `(chat, topic)` pair. Topic keys
/// take precedence over chat keys when a message carries a `topic_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    Chat(i64),
    Topic(i64, i32),
}

impl ContextKey {
    pub fn new(chat_id: i64, topic_id: Option<i32>) -> Self {
        match topic_id {
            Some(t) => Self::Topic(chat_id, t),
            None => Self::Chat(chat_id),
        }
    }

    fn as_string(self) -> String {
        match self {
            Self::Chat(id) => format!("chat:{id}"),
            Self::Topic(chat, topic) => format!("topic:{chat}:{topic}"),
        }
    }

    pub fn chat_id(self) -> i64 {
        match self {
            Self::Chat(id) | Self::Topic(id, _) => id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatContext {
    pub current_instance_id: Option<String>,
    pub session_id: Option<String>,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RouterState {
    contexts: HashMap<String, ChatContext>,
    default_instance_id: Option<String>,
    instance_sessions: HashMap<String, String>,
    /// Serialized as `"chat:topic"` since JSON object keys must be strings.
    topic_instances: HashMap<String, String>,
    forum_chats: HashSet<i64>,
}

fn topic_key(chat_id: i64, topic_id: i32) -> String {
    format!("{chat_id}:{topic_id}")
}

/// Persistent, write-through router for conversation-context bindings.
pub struct SessionRouter {
    store: JsonStateFile<RouterState>,
}

impl SessionRouter {
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = state_dir.into().join("router_state.json");
        let store = JsonStateFile::new(path.clone()).map_err(|e| StateError::Io {
            path,
            source: e,
        })?;
        Ok(Self { store })
    }

    pub fn mark_chat_as_forum(&self, chat_id: i64) -> Result<(), StateError> {
        self.store.with_exclusive(|s| {
            s.forum_chats.insert(chat_id);
        })
    }

    pub fn is_forum_chat(&self, chat_id: i64) -> Result<bool, StateError> {
        Ok(self.store.read()?.forum_chats.contains(&chat_id))
    }

    /// Returns the current instance id for a context, consulting the topic
    /// binding first (it shadows the chat-level context on read).
    pub fn get_current_instance_id(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
    ) -> Result<Option<String>, StateError> {
        let state = self.store.read()?;
        if let Some(topic) = topic_id
            && let Some(id) = state.topic_instances.get(&topic_key(chat_id, topic))
        {
            return Ok(Some(id.clone()));
        }
        let key = ContextKey::new(chat_id, topic_id).as_string();
        Ok(state
            .contexts
            .get(&key)
            .and_then(|c| c.current_instance_id.clone()))
    }

    /// Binds a context to an instance. If `session_id` is `None`, restores
    /// the instance's remembered session (if any); otherwise records the
    /// given session as both the context's and the instance's remembered one.
    pub fn set_current_instance(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
        instance_id: &str,
        session_id: Option<&str>,
    ) -> Result<(), StateError> {
        self.store.with_exclusive(|s| {
            let key = ContextKey::new(chat_id, topic_id).as_string();
            let ctx = s.contexts.entry(key).or_default();
            ctx.current_instance_id = Some(instance_id.to_string());
            ctx.last_activity = Utc::now();

            ctx.session_id = match session_id {
                Some(sid) => {
                    s.instance_sessions
                        .insert(instance_id.to_string(), sid.to_string());
                    Some(sid.to_string())
                }
                None => s.instance_sessions.get(instance_id).cloned(),
            };

            if let Some(topic) = topic_id {
                s.topic_instances
                    .insert(topic_key(chat_id, topic), instance_id.to_string());
            }
        })
    }

    /// Clears a context's binding; if it is a topic context, also removes
    /// the durable topic→instance mapping.
    pub fn clear_current_instance(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
    ) -> Result<(), StateError> {
        self.store.with_exclusive(|s| {
            let key = ContextKey::new(chat_id, topic_id).as_string();
            if let Some(ctx) = s.contexts.get_mut(&key) {
                ctx.current_instance_id = None;
                ctx.session_id = None;
            }
            if let Some(topic) = topic_id {
                s.topic_instances.remove(&topic_key(chat_id, topic));
            }
        })
    }

    pub fn set_session_id(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
        session_id: Option<&str>,
    ) -> Result<(), StateError> {
        self.store.with_exclusive(|s| {
            let key = ContextKey::new(chat_id, topic_id).as_string();
            let ctx = s.contexts.entry(key).or_default();
            ctx.session_id = session_id.map(str::to_string);
        })
    }

    pub fn get_session_id(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
    ) -> Result<Option<String>, StateError> {
        let key = ContextKey::new(chat_id, topic_id).as_string();
        Ok(self
            .store
            .read()?
            .contexts
            .get(&key)
            .and_then(|c| c.session_id.clone()))
    }

    pub fn set_model_preference(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
        provider_id: &str,
        model_id: &str,
    ) -> Result<(), StateError> {
        self.store.with_exclusive(|s| {
            let key = ContextKey::new(chat_id, topic_id).as_string();
            let ctx = s.contexts.entry(key).or_default();
            ctx.provider_id = Some(provider_id.to_string());
            ctx.model_id = Some(model_id.to_string());
        })
    }

    pub fn get_model_preference(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
    ) -> Result<Option<(String, String)>, StateError> {
        let key = ContextKey::new(chat_id, topic_id).as_string();
        let state = self.store.read()?;
        Ok(state.contexts.get(&key).and_then(|c| {
            match (&c.provider_id, &c.model_id) {
                (Some(p), Some(m)) => Some((p.clone(), m.clone())),
                _ => None,
            }
        }))
    }

    /// All `chat_id`s whose *chat-level* context points at `instance_id`.
    pub fn get_chats_for_instance(&self, instance_id: &str) -> Result<Vec<i64>, StateError> {
        let state = self.store.read()?;
        Ok(state
            .contexts
            .iter()
            .filter_map(|(key, ctx)| {
                if ctx.current_instance_id.as_deref() == Some(instance_id) && key.starts_with("chat:")
                {
                    key.strip_prefix("chat:").and_then(|s| s.parse().ok())
                } else {
                    None
                }
            })
            .collect())
    }

    /// All `(chat_id, topic_id)` pairs bound to `instance_id`.
    pub fn get_topics_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<(i64, i32)>, StateError> {
        let state = self.store.read()?;
        Ok(state
            .topic_instances
            .iter()
            .filter_map(|(key, id)| {
                if id != instance_id {
                    return None;
                }
                let (chat, topic) = key.split_once(':')?;
                Some((chat.parse().ok()?, topic.parse().ok()?))
            })
            .collect())
    }

    pub fn get_topics_for_chat(&self, chat_id: i64) -> Result<Vec<(i32, String)>, StateError> {
        let state = self.store.read()?;
        let prefix = format!("{chat_id}:");
        Ok(state
            .topic_instances
            .iter()
            .filter_map(|(key, id)| {
                key.strip_prefix(&prefix)
                    .and_then(|t| t.parse::<i32>().ok())
                    .map(|t| (t, id.clone()))
            })
            .collect())
    }

    pub fn set_default_instance(&self, instance_id: &str) -> Result<(), StateError> {
        self.store.with_exclusive(|s| {
            s.default_instance_id = Some(instance_id.to_string());
        })
    }

    pub fn default_instance(&self) -> Result<Option<String>, StateError> {
        Ok(self.store.read()?.default_instance_id)
    }

    /// Scrubs every reference to `instance_id`: contexts, topic bindings,
    /// and the remembered session. Returns how many contexts were affected.
    pub fn remove_instance_references(&self, instance_id: &str) -> Result<usize, StateError> {
        self.store.with_exclusive(|s| {
            let mut affected = 0;
            for ctx in s.contexts.values_mut() {
                if ctx.current_instance_id.as_deref() == Some(instance_id) {
                    ctx.current_instance_id = None;
                    ctx.session_id = None;
                    affected += 1;
                }
            }
            s.topic_instances.retain(|_, id| id != instance_id);
            s.instance_sessions.remove(instance_id);
            if s.default_instance_id.as_deref() == Some(instance_id) {
                s.default_instance_id = None;
            }
            affected
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn router() -> (SessionRouter, TempDir) {
        let dir = TempDir::new().unwrap();
        (SessionRouter::new(dir.path()).unwrap(), dir)
    }

    #[test]
    fn chat_level_binding_round_trips() {
        let (r, _dir) = router();
        r.set_current_instance(1, None, "inst-a", Some("sess-1")).unwrap();
        assert_eq!(
            r.get_current_instance_id(1, None).unwrap(),
            Some("inst-a".to_string())
        );
        assert_eq!(
            r.get_session_id(1, None).unwrap(),
            Some("sess-1".to_string())
        );
    }

    #[test]
    fn topic_binding_shadows_chat_binding_on_read() {
        let (r, _dir) = router();
        r.set_current_instance(1, None, "inst-chat", None).unwrap();
        r.set_current_instance(1, Some(7), "inst-topic", None).unwrap();

        assert_eq!(
            r.get_current_instance_id(1, Some(7)).unwrap(),
            Some("inst-topic".to_string())
        );
        // Chat-level binding, read without a topic id, is unaffected.
        assert_eq!(
            r.get_current_instance_id(1, None).unwrap(),
            Some("inst-chat".to_string())
        );
    }

    #[test]
    fn clearing_topic_context_removes_durable_binding() {
        let (r, _dir) = router();
        r.set_current_instance(1, Some(7), "inst-a", None).unwrap();
        r.clear_current_instance(1, Some(7)).unwrap();
        assert_eq!(r.get_current_instance_id(1, Some(7)).unwrap(), None);
        assert!(r.get_topics_for_instance("inst-a").unwrap().is_empty());
    }

    #[test]
    fn rebinding_without_explicit_session_restores_remembered_session() {
        let (r, _dir) = router();
        r.set_current_instance(1, None, "inst-a", Some("sess-1")).unwrap();
        r.clear_current_instance(1, None).unwrap();
        r.set_current_instance(2, None, "inst-a", None).unwrap();
        assert_eq!(
            r.get_session_id(2, None).unwrap(),
            Some("sess-1".to_string())
        );
    }

    #[test]
    fn remove_instance_references_scrubs_everything() {
        let (r, _dir) = router();
        r.set_current_instance(1, None, "inst-a", Some("sess-1")).unwrap();
        r.set_current_instance(1, Some(7), "inst-a", None).unwrap();
        r.set_default_instance("inst-a").unwrap();

        let affected = r.remove_instance_references("inst-a").unwrap();
        assert!(affected >= 1);
        assert_eq!(r.get_current_instance_id(1, None).unwrap(), None);
        assert_eq!(r.get_current_instance_id(1, Some(7)).unwrap(), None);
        assert_eq!(r.default_instance().unwrap(), None);
    }

    #[test]
    fn state_persists_across_router_instances() {
        let dir = TempDir::new().unwrap();
        {
            let r = SessionRouter::new(dir.path()).unwrap();
            r.set_current_instance(1, Some(7), "inst-a", None).unwrap();
        }
        let r2 = SessionRouter::new(dir.path()).unwrap();
        assert_eq!(
            r2.get_current_instance_id(1, Some(7)).unwrap(),
            Some("inst-a".to_string())
        );
    }
}
