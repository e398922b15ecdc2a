//! Dispatches decoded `CallbackAction`s from inline-keyboard button presses.

use crate::command_dispatcher::favourite_model_hash_table;
use crate::pending_tracker::PendingTracker;
use crate::telegram_client::TelegramClient;
use controller_agent::{AgentClient, ProcessManager};
use controller_core::{CallbackAction, ControllerConfig, PermissionChoice, SessionRouter};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error(transparent)]
    Router(#[from] controller_core::RouterError),
    #[error("agent error: {0}")]
    Agent(#[from] controller_agent::AgentError),
    #[error("process error: {0}")]
    Process(#[from] controller_agent::ProcessError),
    #[error("state error: {0}")]
    State(#[from] controller_core::StateError),
}

pub struct CallbackHandler {
    router: Arc<SessionRouter>,
    processes: Arc<ProcessManager>,
    telegram: Arc<TelegramClient>,
    pending: Arc<PendingTracker>,
    config: Arc<ControllerConfig>,
}

impl CallbackHandler {
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
        AgentClient::with_timeout(port, std::time::Duration::from_secs(self.config.agent_request_timeout_secs))
    }

    pub async fn handle(
        &self,
        callback_id: &str,
        data: &str,
        chat_id: i64,
        topic_id: Option<i32>,
        message_id: i32,
    ) -> Result<(), CallbackError> {
        let Some(action) = CallbackAction::decode(data) else {
            let _ = self.telegram.answer_callback_query(callback_id, None).await;
            return Ok(());
        };

        let outcome = self.apply(action, chat_id, topic_id).await?;
        let _ = self
            .telegram
            .answer_callback_query(callback_id, outcome.toast.as_deref())
            .await;
        if let Some(text) = outcome.edit_to {
            let _ = self
                .telegram
                .edit_message_text(chat_id, message_id, &text, None)
                .await;
        }
        Ok(())
    }

    async fn apply(
        &self,
        action: CallbackAction,
        chat_id: i64,
        topic_id: Option<i32>,
    ) -> Result<CallbackOutcome, CallbackError> {
        match action {
            CallbackAction::InstancePick { instance_id } => {
                match self.processes.get(&instance_id).await {
                    Some(instance) => {
                        self.router
                            .set_current_instance(chat_id, topic_id, &instance_id, None)?;
                        Ok(CallbackOutcome::edit(format!(
                            "Bound to `{}`.",
                            instance.display_name()
                        )))
                    }
                    None => Ok(CallbackOutcome::toast_only("That instance no longer exists.")),
                }
            }
            CallbackAction::InstanceKill { instance_id } => {
                self.processes.stop(&instance_id).await?;
                self.router.remove_instance_references(&instance_id)?;
                Ok(CallbackOutcome::edit("Instance stopped.".to_string()))
            }
            CallbackAction::SessionPick { session_id } => {
                self.router
                    .set_session_id(chat_id, topic_id, Some(&session_id))?;
                Ok(CallbackOutcome::edit(format!(
                    "Switched to session `{session_id}`."
                )))
            }
            CallbackAction::ModelPick { provider, model } => {
                self.router
                    .set_model_preference(chat_id, topic_id, &provider, &model)?;
                Ok(CallbackOutcome::edit(format!("Model set to {provider}/{model}.")))
            }
            CallbackAction::ModelPickHash { hash } => {
                let table = favourite_model_hash_table(&self.config.favourite_models);
                match table.get(&hash) {
                    Some((provider, model)) => {
                        self.router
                            .set_model_preference(chat_id, topic_id, provider, model)?;
                        Ok(CallbackOutcome::edit(format!("Model set to {provider}/{model}.")))
                    }
                    None => Ok(CallbackOutcome::toast_only("That model picker has expired.")),
                }
            }
            CallbackAction::SessionDelete { session_id } => {
                if let Some(instance_id) = self.router.get_current_instance_id(chat_id, topic_id)?
                    && let Some(instance) = self.processes.get(&instance_id).await
                {
                    let client = self.agent_client(instance.port);
                    client.delete_session(&session_id).await?;
                }
                Ok(CallbackOutcome::edit("Session deleted.".to_string()))
            }
            CallbackAction::PermissionAnswer { request_id, choice } => {
                self.answer_permission(chat_id, topic_id, &request_id, choice)
                    .await
            }
            CallbackAction::QuestionAnswer {
                request_id,
                option_index,
            } => {
                self.answer_question(chat_id, topic_id, &request_id, option_index)
                    .await
            }
            CallbackAction::ThreadInstancePick {
                topic_id: target_topic,
                id_prefix,
            } => self.pick_thread_instance(chat_id, target_topic, &id_prefix).await,
        }
    }

    async fn answer_permission(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
        request_id: &str,
        choice: PermissionChoice,
    ) -> Result<CallbackOutcome, CallbackError> {
        let Some(instance_id) = self.router.get_current_instance_id(chat_id, topic_id)? else {
            return Ok(CallbackOutcome::toast_only("No instance bound."));
        };
        let Some(instance) = self.processes.get(&instance_id).await else {
            return Ok(CallbackOutcome::toast_only("Instance no longer exists."));
        };
        let client = self.agent_client(instance.port);
        client.reply_permission(request_id, choice.agent_reply()).await?;
        self.pending.clear_request(request_id);
        self.pending
            .spawn_follow_up_poll(instance_id, chat_id, topic_id);
        Ok(CallbackOutcome::edit("Permission answered.".to_string()))
    }

    async fn answer_question(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
        request_id: &str,
        option_index: usize,
    ) -> Result<CallbackOutcome, CallbackError> {
        let Some(instance_id) = self.router.get_current_instance_id(chat_id, topic_id)? else {
            return Ok(CallbackOutcome::toast_only("No instance bound."));
        };
        let Some(instance) = self.processes.get(&instance_id).await else {
            return Ok(CallbackOutcome::toast_only("Instance no longer exists."));
        };
        let client = self.agent_client(instance.port);
        let questions = client.list_pending_questions().await?;
        let label = questions
            .iter()
            .find(|q| q.id == request_id)
            .and_then(|q| q.options.get(option_index))
            .cloned()
            .unwrap_or_default();
        client
            .respond_question(request_id, vec![vec![format!("[[{label}]]")]])
            .await?;
        self.pending.clear_request(request_id);
        self.pending
            .spawn_follow_up_poll(instance_id, chat_id, topic_id);
        Ok(CallbackOutcome::edit("Question answered.".to_string()))
    }

    async fn pick_thread_instance(
        &self,
        chat_id: i64,
        topic_id: i32,
        id_prefix: &str,
    ) -> Result<CallbackOutcome, CallbackError> {
        let candidate = self
            .processes
            .list()
            .await
            .into_iter()
            .find(|i| i.id.starts_with(id_prefix));
        let Some(mut instance) = candidate else {
            return Ok(CallbackOutcome::toast_only("That instance no longer exists."));
        };
        if !instance.is_alive() {
            instance = self.processes.restart(&instance.id).await?;
        }
        self.router
            .set_current_instance(chat_id, Some(topic_id), &instance.id, None)?;
        let _ = self
            .telegram
            .edit_forum_topic(chat_id, topic_id, &instance.display_name())
            .await;
        Ok(CallbackOutcome::edit(format!(
            "Bound to `{}`.",
            instance.display_name()
        )))
    }
}

struct CallbackOutcome {
    toast: Option<String>,
    edit_to: Option<String>,
}

impl CallbackOutcome {
    fn edit(text: String) -> Self {
        Self {
            toast: None,
            edit_to: Some(text),
        }
    }

    fn toast_only(text: &str) -> Self {
        Self {
            toast: Some(text.to_string()),
            edit_to: None,
        }
    }
}
