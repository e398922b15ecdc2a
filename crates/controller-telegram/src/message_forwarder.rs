//! Routes a plain (non-command) text message to the chat's bound agent.

use crate::pending_tracker::PendingTracker;
use crate::telegram_client::{Keyboard, KeyboardButton, TelegramClient};
use controller_agent::{AgentClient, AgentError, ProcessManager};
use controller_core::{CallbackAction, ControllerConfig, SessionRouter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const TYPING_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(4);

pub struct MessageForwarder {
    router: Arc<SessionRouter>,
    processes: Arc<ProcessManager>,
    telegram: Arc<TelegramClient>,
    pending: Arc<PendingTracker>,
    config: Arc<ControllerConfig>,
}

impl MessageForwarder {
    pub fn new(
        router: Arc<SessionRouter>,
        processes: Arc<ProcessManager>,
        telegram: Arc<TelegramClient>,
        pending: Arc<PendingTracker>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            router,
            processes,
            telegram,
            pending,
            config,
        }
    }

    fn agent_client(&self, port: u16) -> AgentClient {
        AgentClient::with_timeout(port, Duration::from_secs(self.config.agent_request_timeout_secs))
    }

    pub async fn forward(&self, chat_id: i64, topic_id: Option<i32>, text: &str, username: Option<&str>) {
        let Ok(bound) = self.router.get_current_instance_id(chat_id, topic_id) else {
            self.send(chat_id, topic_id, "Internal error resolving this chat's binding.")
                .await;
            return;
        };

        let Some(instance_id) = bound else {
            self.prompt_for_binding(chat_id, topic_id).await;
            return;
        };

        let Some(mut instance) = self.processes.get(&instance_id).await else {
            self.prompt_for_binding(chat_id, topic_id).await;
            return;
        };

        if !instance.is_alive() {
            self.send(
                chat_id,
                topic_id,
                &format!("`{}` is not running; attempting restart…", instance.display_name()),
            )
            .await;
            match self.processes.restart(&instance_id).await {
                Ok(restarted) => instance = restarted,
                Err(e) => {
                    self.send(chat_id, topic_id, &format!("Restart failed: {e}")).await;
                    return;
                }
            }
        }

        if self.config.auto_open_browser && !instance.browser_opened {
            let _ = open::that(instance.url());
            self.processes.mark_browser_opened(&instance_id).await;
        }

        let session_id = match self.router.get_session_id(chat_id, topic_id) {
            Ok(Some(id)) => id,
            _ => {
                let client = self.agent_client(instance.port);
                match client.create_session(None, None).await {
                    Ok(session) => {
                        let _ = self.router.set_session_id(chat_id, topic_id, Some(&session.id));
                        session.id
                    }
                    Err(e) => {
                        self.send(chat_id, topic_id, &format!("Failed to start a session: {e}"))
                            .await;
                        return;
                    }
                }
            }
        };

        let prefixed = format!("[Telegram from @{}]: {}", username.unwrap_or("Unknown"), text);
        self.send_with_keepalive(chat_id, topic_id, &instance_id, instance.port, &session_id, &prefixed)
            .await;
    }

    async fn send_with_keepalive(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
        instance_id: &str,
        port: u16,
        session_id: &str,
        text: &str,
    ) {
        let Some(instance) = self.processes.get(instance_id).await else {
            return;
        };
        let client = self.agent_client(port);
        let mut send_fut = Box::pin(client.send_message(
            session_id,
            text,
            &instance.provider_id,
            &instance.model_id,
        ));

        let result = loop {
            tokio::select! {
                result = &mut send_fut => break result,
                () = sleep(TYPING_KEEPALIVE_INTERVAL) => {
                    let _ = self.telegram.send_chat_action_typing(chat_id, topic_id).await;
                    self.pending.check_one(instance_id, chat_id, topic_id).await;
                }
            }
        };

        match result {
            Ok(reply) => {
                let body = if reply.text.is_empty() {
                    "(empty response)".to_string()
                } else {
                    reply.text
                };
                self.send(chat_id, topic_id, &body).await;
                if let Some(err) = reply.error {
                    self.send(chat_id, topic_id, &format!("Agent reported an error: {err}")).await;
                }
            }
            Err(AgentError::Gone(_)) => {
                let _ = self.router.set_session_id(chat_id, topic_id, None);
                self.send(
                    chat_id,
                    topic_id,
                    "That session is gone; it will be recreated on your next message.",
                )
                .await;
            }
            Err(e) => {
                self.send(chat_id, topic_id, &format!("Agent error: {e}")).await;
            }
        }

        self.pending.check_one(instance_id, chat_id, topic_id).await;
    }

    async fn prompt_for_binding(&self, chat_id: i64, topic_id: Option<i32>) {
        let Some(topic) = topic_id else {
            self.send(
                chat_id,
                None,
                "No instance bound. Use /open <path> to start one, or /list to pick an existing one.",
            )
            .await;
            return;
        };

        let instances = self.processes.list().await;
        let live: Vec<_> = instances.into_iter().filter(|i| i.is_alive()).collect();
        if live.is_empty() {
            self.send(
                chat_id,
                Some(topic),
                "No instance bound to this thread, and no live instances exist. Send /open <path> to start one.",
            )
            .await;
            return;
        }

        let keyboard: Keyboard = live
            .iter()
            .map(|i| {
                vec![KeyboardButton {
                    text: i.display_name(),
                    callback_data: CallbackAction::ThreadInstancePick {
                        topic_id: topic,
                        id_prefix: i.short_id().to_string(),
                    }
                    .encode(),
                }]
            })
            .collect();

        let _ = self
            .telegram
            .send_message_with_keyboard(
                chat_id,
                Some(topic),
                "No instance bound to this thread. Pick one, or send /open <path> to start a new one.",
                &keyboard,
            )
            .await;
    }

    async fn send(&self, chat_id: i64, topic_id: Option<i32>, text: &str) {
        let result = match topic_id {
            Some(topic) => self.telegram.send_message_to_topic(chat_id, topic, text).await,
            None => self.telegram.send_message(chat_id, text).await,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, chat_id, "failed to deliver message");
        }
    }
}
