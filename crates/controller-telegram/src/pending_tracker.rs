//! Polls every live instance for pending permissions/questions and notifies
//! bound chats exactly once per target, via both a periodic sweep and an
//! on-demand check fired right after a message is forwarded.

use crate::telegram_client::{Keyboard, KeyboardButton, TelegramClient};
use controller_agent::{AgentClient, ProcessManager, SessionStatus};
use controller_core::{CallbackAction, NotifyTarget, PendingStore, PermissionChoice, SessionRouter};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const PER_CALL_TIMEOUT: Duration = Duration::from_secs(4);
const FOLLOW_UP_POLL_INTERVAL: Duration = Duration::from_secs(4);
const FOLLOW_UP_POLL_MAX_ROUNDS: usize = 150; // ~10 minutes, matching the agent send timeout

pub struct PendingTracker {
    router: Arc<SessionRouter>,
    processes: Arc<ProcessManager>,
    telegram: Arc<TelegramClient>,
    pending_store: Arc<PendingStore>,
}

impl PendingTracker {
    pub fn new(
        router: Arc<SessionRouter>,
        processes: Arc<ProcessManager>,
        telegram: Arc<TelegramClient>,
        pending_store: Arc<PendingStore>,
    ) -> Self {
        Self {
            router,
            processes,
            telegram,
            pending_store,
        }
    }

    /// One pass of the periodic sweep: every live instance, every target.
    pub async fn sweep_all(&self) {
        let instances = self.processes.list().await;
        for instance in instances.into_iter().filter(|i| i.is_alive()) {
            self.sweep_instance(&instance.id, instance.port, None).await;
        }
    }

    /// On-demand check for one instance, scoped to a single target (the
    /// chat/topic that just sent a message), per spec §4.8.
    pub async fn check_one(&self, instance_id: &str, chat_id: i64, topic_id: Option<i32>) {
        let Some(instance) = self.processes.get(instance_id).await else {
            return;
        };
        let only_target = Some(match topic_id {
            Some(t) => NotifyTarget::Topic(chat_id, t),
            None => NotifyTarget::Chat(chat_id),
        });
        self.sweep_instance(instance_id, instance.port, only_target).await;
    }

    async fn sweep_instance(&self, instance_id: &str, port: u16, only_target: Option<NotifyTarget>) {
        let client = AgentClient::with_timeout(port, PER_CALL_TIMEOUT);
        let Ok(permissions) = client.list_pending_permissions().await else {
            return;
        };
        let Ok(questions) = client.list_pending_questions().await else {
            return;
        };

        let targets = match self.targets_for(instance_id, only_target) {
            Ok(t) => t,
            Err(_) => return,
        };

        for permission in &permissions {
            let keyboard = vec![vec![
                button("Allow", CallbackAction::PermissionAnswer {
                    request_id: permission.id.clone(),
                    choice: PermissionChoice::Once,
                }),
                button("Always", CallbackAction::PermissionAnswer {
                    request_id: permission.id.clone(),
                    choice: PermissionChoice::Always,
                }),
                button("Reject", CallbackAction::PermissionAnswer {
                    request_id: permission.id.clone(),
                    choice: PermissionChoice::Reject,
                }),
            ]];
            let text = format!("Permission requested: `{}`", permission.permission);
            self.notify_new_targets(&permission.id, &targets, &text, &keyboard)
                .await;
        }

        for question in &questions {
            let keyboard: Keyboard = question
                .options
                .iter()
                .enumerate()
                .map(|(idx, option)| {
                    vec![button(option, CallbackAction::QuestionAnswer {
                        request_id: question.id.clone(),
                        option_index: idx,
                    })]
                })
                .collect();
            self.notify_new_targets(&question.id, &targets, &question.prompt, &keyboard)
                .await;
        }

        if only_target.is_none() {
            let still_pending: HashSet<String> = permissions
                .iter()
                .map(|p| p.id.clone())
                .chain(questions.iter().map(|q| q.id.clone()))
                .collect();
            let _ = self.pending_store.reconcile(&still_pending);
        }
    }

    async fn notify_new_targets(
        &self,
        request_id: &str,
        targets: &[NotifyTarget],
        text: &str,
        keyboard: &Keyboard,
    ) {
        for target in targets {
            let is_new = self
                .pending_store
                .mark_notified_if_new(request_id, *target)
                .unwrap_or(false);
            if !is_new {
                continue;
            }
            let (chat_id, topic_id) = match target {
                NotifyTarget::Chat(c) => (*c, None),
                NotifyTarget::Topic(c, t) => (*c, Some(*t)),
            };
            let _ = self
                .telegram
                .send_message_with_keyboard(chat_id, topic_id, text, keyboard)
                .await;
        }
    }

    /// Targets bound to `instance_id`: topic bindings plus chat-level
    /// bindings, excluding any chat that already has a topic binding to this
    /// instance (to avoid double-notifying the same chat).
    fn targets_for(
        &self,
        instance_id: &str,
        only_target: Option<NotifyTarget>,
    ) -> Result<Vec<NotifyTarget>, controller_core::RouterError> {
        if let Some(target) = only_target {
            return Ok(vec![target]);
        }
        let topics = self.router.get_topics_for_instance(instance_id)?;
        let chats_with_topics: HashSet<i64> = topics.iter().map(|(c, _)| *c).collect();
        let mut targets: Vec<NotifyTarget> = topics
            .into_iter()
            .map(|(c, t)| NotifyTarget::Topic(c, t))
            .collect();
        for chat_id in self.router.get_chats_for_instance(instance_id)? {
            if !chats_with_topics.contains(&chat_id) {
                targets.push(NotifyTarget::Chat(chat_id));
            }
        }
        Ok(targets)
    }

    pub fn clear_request(&self, request_id: &str) {
        let _ = self.pending_store.clear(request_id);
    }

    /// Best-effort task: after a permission/question answer, the agent
    /// typically resumes generating. Polls `session_status` until idle (or
    /// another question appears), then forwards newly-appeared assistant
    /// text to the same chat/topic.
    pub fn spawn_follow_up_poll(
        self: &Arc<Self>,
        instance_id: String,
        chat_id: i64,
        topic_id: Option<i32>,
    ) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tracker.follow_up_poll(&instance_id, chat_id, topic_id).await;
        });
    }

    async fn follow_up_poll(&self, instance_id: &str, chat_id: i64, topic_id: Option<i32>) {
        let Some(instance) = self.processes.get(instance_id).await else {
            return;
        };
        let Ok(Some(session_id)) = self.router.get_session_id(chat_id, topic_id) else {
            return;
        };
        let client = AgentClient::with_timeout(instance.port, PER_CALL_TIMEOUT);
        let before = client
            .list_messages(&session_id, 50)
            .await
            .map(|parts| parts.len())
            .unwrap_or(0);

        for _ in 0..FOLLOW_UP_POLL_MAX_ROUNDS {
            let _ = self.telegram.send_chat_action_typing(chat_id, topic_id).await;
            sleep(FOLLOW_UP_POLL_INTERVAL).await;

            self.check_one(instance_id, chat_id, topic_id).await;

            let Ok(status) = client.session_status().await else {
                continue;
            };
            match status.get(&session_id) {
                Some(SessionStatus::Question) => {
                    // Hand back to the pending tracker's own notification path.
                    self.check_one(instance_id, chat_id, topic_id).await;
                    return;
                }
                Some(SessionStatus::Idle) => {
                    if let Ok(parts) = client.list_messages(&session_id, 50).await
                        && parts.len() > before
                    {
                        let new_text = parts[before..]
                            .iter()
                            .filter_map(|p| p.text.as_deref())
                            .collect::<Vec<_>>()
                            .join("\n");
                        if !new_text.is_empty() {
                            let _ = match topic_id {
                                Some(topic) => {
                                    self.telegram
                                        .send_message_to_topic(chat_id, topic, &new_text)
                                        .await
                                }
                                None => self.telegram.send_message(chat_id, &new_text).await,
                            };
                        }
                    }
                    return;
                }
                _ => continue,
            }
        }
    }
}

fn button(label: &str, action: CallbackAction) -> KeyboardButton {
    KeyboardButton {
        text: label.to_string(),
        callback_data: action.encode(),
    }
}
