//! Tagged-variant inline-keyboard callback data.
//!
//! Telegram's `callback_data` is a single opaque byte string capped at 64
//! bytes. Rather than pattern-matching prefixes ad hoc at every call site,
//! every button the controller emits carries a [`CallbackAction`] encoded
//! once at the boundary; [`CallbackAction::decode`] is the single inverse.

use sha2::{Digest, Sha256};

const MAX_CALLBACK_DATA_BYTES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    InstancePick { instance_id: String },
    InstanceKill { instance_id: String },
    SessionPick { session_id: String },
    ModelPick { provider: String, model: String },
    ModelPickHash { hash: String },
    SessionDelete { session_id: String },
    PermissionAnswer { request_id: String, choice: PermissionChoice },
    QuestionAnswer { request_id: String, option_index: usize },
    ThreadInstancePick { topic_id: i32, id_prefix: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionChoice {
    Once,
    Always,
    Reject,
}

impl PermissionChoice {
    fn tag(self) -> &'static str {
        match self {
            Self::Once => "y",
            Self::Always => "a",
            Self::Reject => "n",
        }
    }

    /// The verb the agent's permission-reply endpoint expects.
    pub fn agent_reply(self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Always => "always",
            Self::Reject => "reject",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "y" => Some(Self::Once),
            "a" => Some(Self::Always),
            "n" => Some(Self::Reject),
            _ => None,
        }
    }
}

impl CallbackAction {
    pub fn encode(&self) -> String {
        let encoded = match self {
            Self::InstancePick { instance_id } => format!("instance:{instance_id}"),
            Self::InstanceKill { instance_id } => format!("kill:{instance_id}"),
            Self::SessionPick { session_id } => format!("session:{session_id}"),
            Self::ModelPick { provider, model } => format!("setmodel:{provider}:{model}"),
            Self::ModelPickHash { hash } => format!("sm:{hash}"),
            Self::SessionDelete { session_id } => format!("delete:{session_id}"),
            Self::PermissionAnswer { request_id, choice } => {
                format!("perm:{}:{request_id}", choice.tag())
            }
            Self::QuestionAnswer { request_id, option_index } => {
                format!("q:{request_id}:{option_index}")
            }
            Self::ThreadInstancePick { topic_id, id_prefix } => {
                format!("thread_inst:{topic_id}:{id_prefix}")
            }
        };
        debug_assert!(
            encoded.len() <= MAX_CALLBACK_DATA_BYTES,
            "callback_data exceeds Telegram's 64-byte limit: {encoded}"
        );
        encoded
    }

    pub fn decode(data: &str) -> Option<Self> {
        let (prefix, rest) = data.split_once(':')?;
        match prefix {
            "instance" => Some(Self::InstancePick {
                instance_id: rest.to_string(),
            }),
            "kill" => Some(Self::InstanceKill {
                instance_id: rest.to_string(),
            }),
            "session" => Some(Self::SessionPick {
                session_id: rest.to_string(),
            }),
            "setmodel" => {
                let (provider, model) = rest.split_once(':')?;
                Some(Self::ModelPick {
                    provider: provider.to_string(),
                    model: model.to_string(),
                })
            }
            "sm" => Some(Self::ModelPickHash {
                hash: rest.to_string(),
            }),
            "delete" => Some(Self::SessionDelete {
                session_id: rest.to_string(),
            }),
            "perm" => {
                let (tag, request_id) = rest.split_once(':')?;
                Some(Self::PermissionAnswer {
                    request_id: request_id.to_string(),
                    choice: PermissionChoice::from_tag(tag)?,
                })
            }
            "q" => {
                let (request_id, idx) = rest.rsplit_once(':')?;
                Some(Self::QuestionAnswer {
                    request_id: request_id.to_string(),
                    option_index: idx.parse().ok()?,
                })
            }
            "thread_inst" => {
                let (topic_id, id_prefix) = rest.split_once(':')?;
                Some(Self::ThreadInstancePick {
                    topic_id: topic_id.parse().ok()?,
                    id_prefix: id_prefix.to_string(),
                })
            }
            _ => None,
        }
    }
}

/// Maps `(provider, model)` pairs to short `sm:<hash>` callback data so the
/// model picker fits inside Telegram's 64-byte `callback_data` budget even
/// for long provider/model identifiers. The hash is an 8-hex-digit prefix of
/// a SHA-256 digest; callers keep a side table from hash back to the pair for
/// the lifetime of one picker message.
pub fn hash_model_pick(provider: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(b"/");
    hasher.update(model.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_pick_round_trips() {
        let action = CallbackAction::InstancePick {
            instance_id: "abc123".into(),
        };
        let decoded = CallbackAction::decode(&action.encode()).unwrap();
        assert_eq!(decoded, action);
    }

    #[test]
    fn permission_answer_round_trips_for_every_choice() {
        for choice in [
            PermissionChoice::Once,
            PermissionChoice::Always,
            PermissionChoice::Reject,
        ] {
            let action = CallbackAction::PermissionAnswer {
                request_id: "req-42".into(),
                choice,
            };
            assert_eq!(CallbackAction::decode(&action.encode()).unwrap(), action);
        }
    }

    #[test]
    fn question_answer_round_trips() {
        let action = CallbackAction::QuestionAnswer {
            request_id: "req-7".into(),
            option_index: 3,
        };
        assert_eq!(CallbackAction::decode(&action.encode()).unwrap(), action);
    }

    #[test]
    fn thread_instance_pick_round_trips() {
        let action = CallbackAction::ThreadInstancePick {
            topic_id: 12,
            id_prefix: "abcd1234".into(),
        };
        assert_eq!(CallbackAction::decode(&action.encode()).unwrap(), action);
    }

    #[test]
    fn model_pick_hash_is_stable_and_short() {
        let h1 = hash_model_pick("anthropic", "claude-sonnet-4-5-super-long-model-name");
        let h2 = hash_model_pick("anthropic", "claude-sonnet-4-5-super-long-model-name");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 8);
        let action = CallbackAction::ModelPickHash { hash: h1 };
        assert!(action.encode().len() <= MAX_CALLBACK_DATA_BYTES);
    }

    #[test]
    fn unknown_prefix_decodes_to_none() {
        assert_eq!(CallbackAction::decode("bogus:xyz"), None);
    }

    #[test]
    fn long_request_id_permission_answer_fits_budget() {
        let long_id = "r".repeat(40);
        let action = CallbackAction::PermissionAnswer {
            request_id: long_id,
            choice: PermissionChoice::Always,
        };
        assert!(action.encode().len() <= MAX_CALLBACK_DATA_BYTES);
    }
}
