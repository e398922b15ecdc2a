//! Parses `/cmd args` and dispatches controller-scope commands directly;
//! routes the known instance-scope command set to the bound instance's
//! agent; everything else falls through as a plain prompt.

use crate::telegram_client::{Keyboard, KeyboardButton};
use controller_agent::{AgentClient, FactoryRegistry, ProcessManager};
use controller_core::{CallbackAction, ControllerConfig, SessionRouter};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Slash commands that are routed to the bound instance's agent rather than
/// handled locally. The agent's own command surface is wider than the HTTP
/// API this client models; commands with no dedicated local handler below
/// are forwarded to the agent as a plain prompt carrying the original text.
const INSTANCE_SCOPE_COMMANDS: &[&str] = &[
    "/sessions", "/session", "/models", "/agents", "/config", "/files", "/read", "/find",
    "/prompt", "/shell", "/diff", "/todo", "/fork", "/abort", "/delete", "/share", "/unshare",
    "/revert", "/unrevert", "/summarize", "/info", "/messages", "/init", "/pending", "/health",
    "/vcs", "/lsp", "/formatter", "/mcp", "/dispose", "/commands", "/directory", "/project",
];

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Reply {
        text: String,
        keyboard: Option<Keyboard>,
    },
    /// Rename the current topic (best-effort) in addition to a reply.
    ReplyAndRenameTopic {
        text: String,
        topic_id: i32,
        new_name: String,
    },
    /// Not a recognised command at all: caller should forward the raw text
    /// as a prompt via `MessageForwarder`.
    NotACommand,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Router(#[from] controller_core::RouterError),
    #[error("agent error: {0}")]
    Agent(#[from] controller_agent::AgentError),
    #[error("process error: {0}")]
    Process(#[from] controller_agent::ProcessError),
    #[error("state error: {0}")]
    State(#[from] controller_core::StateError),
}

pub struct CommandDispatcher {
    router: Arc<SessionRouter>,
    processes: Arc<ProcessManager>,
    config: Arc<ControllerConfig>,
}

struct ParsedCommand<'a> {
    name: &'a str,
    args: &'a str,
}

fn parse(text: &str) -> Option<ParsedCommand<'_>> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }
    let (name, args) = text.split_once(' ').unwrap_or((text, ""));
    // Strip a `@botname` suffix, which Telegram appends in group chats.
    let name = name.split('@').next().unwrap_or(name);
    Some(ParsedCommand {
        name,
        args: args.trim(),
    })
}

impl CommandDispatcher {
    pub fn new(
        router: Arc<SessionRouter>,
        processes: Arc<ProcessManager>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            router,
            processes,
            config,
        }
    }

    fn agent_client(&self, port: u16) -> AgentClient {
        AgentClient::with_timeout(port, std::time::Duration::from_secs(self.config.agent_request_timeout_secs))
    }

    fn health_check_path_for(&self, instance: &controller_core::AgentInstance) -> &str {
        self.processes
            .factories()
            .get(instance.instance_type.as_deref())
            .map_or("/global/health", controller_agent::InstanceFactory::health_check_path)
    }

    pub async fn dispatch(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
        text: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(cmd) = parse(text) else {
            return Ok(DispatchOutcome::NotACommand);
        };

        match cmd.name {
            "/open" => self.cmd_open(chat_id, topic_id, cmd.args).await,
            "/list" | "/projects" | "/instances" => self.cmd_list(chat_id, topic_id).await,
            "/switch" => self.cmd_switch(chat_id, topic_id, cmd.args).await,
            "/current" => self.cmd_current(chat_id, topic_id).await,
            "/close" => self.cmd_close(chat_id, topic_id).await,
            "/kill" => self.cmd_kill(cmd.args).await,
            "/restart" => self.cmd_restart(cmd.args).await,
            "/status" => self.cmd_status().await,
            "/threads" => self.cmd_threads(chat_id).await,
            "/help" => Ok(reply(HELP_TEXT)),
            name if INSTANCE_SCOPE_COMMANDS.contains(&name) => {
                self.cmd_instance_scope(chat_id, topic_id, name, cmd.args)
                    .await
            }
            _ => Ok(DispatchOutcome::NotACommand),
        }
    }

    async fn cmd_open(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
        args: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let (path_arg, instance_type) = parse_open_args(args);
        let directory = match resolve_directory(path_arg) {
            Some(p) => p,
            None => return Ok(reply("Path does not exist or is not a directory.")),
        };

        if let Some(requested) = &instance_type
            && !self.processes.factories().has_type(requested)
        {
            return Ok(reply(&format!(
                "Unknown instance type '{requested}'. Known types: {}",
                self.processes.factories().list_types().join(", ")
            )));
        }

        let name = controller_core::project_namer::detect_project_name(&directory);
        let factory = self
            .processes
            .factories()
            .get(instance_type.as_deref())
            .expect("validated above or default always registered");
        let (factory_provider, factory_model) = factory.default_provider_model();
        let provider = if self.config.default_provider.is_empty() {
            factory_provider.to_string()
        } else {
            self.config.default_provider.clone()
        };
        let model = if self.config.default_model.is_empty() {
            factory_model.to_string()
        } else {
            self.config.default_model.clone()
        };

        let instance = self
            .processes
            .spawn(directory, Some(name.clone()), provider, model, instance_type)
            .await?;

        self.router
            .set_current_instance(chat_id, topic_id, &instance.id, None)?;

        if let Some(topic) = topic_id {
            return Ok(DispatchOutcome::ReplyAndRenameTopic {
                text: format!("Opened `{}` ({}).", instance.display_name(), instance.state),
                topic_id: topic,
                new_name: instance.display_name(),
            });
        }
        Ok(reply(&format!(
            "Opened `{}` ({}).",
            instance.display_name(),
            instance.state
        )))
    }

    async fn cmd_list(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let mut instances = self.processes.list().await;
        // Reconcile: drop instances that no longer answer health(), per §4.9.
        let mut live = Vec::new();
        for instance in instances.drain(..) {
            if !instance.is_alive() {
                continue;
            }
            let client = self.agent_client(instance.port);
            let health_check_path = self.health_check_path_for(&instance);
            if client.health(health_check_path).await.is_ok() {
                live.push(instance);
            }
        }

        if live.is_empty() {
            return Ok(reply("No live instances. Use /open <path> to start one."));
        }

        let current = self.router.get_current_instance_id(chat_id, topic_id)?;
        let keyboard: Keyboard = live
            .iter()
            .map(|instance| {
                let marker = if Some(&instance.id) == current.as_ref() {
                    "* "
                } else {
                    ""
                };
                vec![KeyboardButton {
                    text: format!("{marker}{}", instance.display_name()),
                    callback_data: CallbackAction::InstancePick {
                        instance_id: instance.id.clone(),
                    }
                    .encode(),
                }]
            })
            .collect();

        Ok(DispatchOutcome::Reply {
            text: "Live instances:".to_string(),
            keyboard: Some(keyboard),
        })
    }

    async fn cmd_switch(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
        args: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        if args.is_empty() {
            return self.cmd_list(chat_id, topic_id).await;
        }
        match self.find_by_prefix(args).await {
            Some(instance) => {
                self.router
                    .set_current_instance(chat_id, topic_id, &instance.id, None)?;
                Ok(reply(&format!("Switched to `{}`.", instance.display_name())))
            }
            None => Ok(reply(&format!("No instance matching `{args}`."))),
        }
    }

    async fn cmd_current(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
    ) -> Result<DispatchOutcome, DispatchError> {
        match self.router.get_current_instance_id(chat_id, topic_id)? {
            Some(id) => match self.processes.get(&id).await {
                Some(instance) => Ok(reply(&format!(
                    "`{}` — {} — {}",
                    instance.display_name(),
                    instance.state,
                    instance.directory.display()
                ))),
                None => Ok(reply("Bound instance no longer exists.")),
            },
            None => Ok(reply("No instance bound to this context.")),
        }
    }

    async fn cmd_close(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(id) = self.router.get_current_instance_id(chat_id, topic_id)? else {
            return Ok(reply("No instance bound to this context."));
        };
        self.processes.stop(&id).await?;
        self.router.clear_current_instance(chat_id, topic_id)?;
        Ok(reply("Instance stopped and unbound."))
    }

    async fn cmd_kill(&self, args: &str) -> Result<DispatchOutcome, DispatchError> {
        if args.is_empty() {
            let running: Keyboard = self
                .processes
                .list()
                .await
                .into_iter()
                .filter(|i| i.is_alive())
                .map(|i| {
                    vec![KeyboardButton {
                        text: i.display_name(),
                        callback_data: CallbackAction::InstanceKill { instance_id: i.id }.encode(),
                    }]
                })
                .collect();
            if running.is_empty() {
                return Ok(reply("No running instances."));
            }
            return Ok(DispatchOutcome::Reply {
                text: "Kill which instance?".to_string(),
                keyboard: Some(running),
            });
        }
        match self.find_by_prefix(args).await {
            Some(instance) => {
                self.processes.stop(&instance.id).await?;
                self.router.remove_instance_references(&instance.id)?;
                Ok(reply(&format!("Killed `{}`.", instance.display_name())))
            }
            None => Ok(reply(&format!("No instance matching `{args}`."))),
        }
    }

    async fn cmd_restart(&self, args: &str) -> Result<DispatchOutcome, DispatchError> {
        if args.is_empty() {
            return Ok(reply("Usage: /restart <id>"));
        }
        match self.find_by_prefix(args).await {
            Some(instance) => {
                let restarted = self.processes.restart(&instance.id).await?;
                Ok(reply(&format!(
                    "Restarted `{}` ({}).",
                    restarted.display_name(),
                    restarted.state
                )))
            }
            None => Ok(reply(&format!("No instance matching `{args}`."))),
        }
    }

    async fn cmd_status(&self) -> Result<DispatchOutcome, DispatchError> {
        let instances = self.processes.list().await;
        if instances.is_empty() {
            return Ok(reply("No instances."));
        }
        let mut lines = vec!["Instances:".to_string()];
        for instance in instances {
            let uptime = instance
                .uptime()
                .map(|d| format!("{}s", d.num_seconds()))
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "- `{}` {} uptime={uptime} port={}",
                instance.display_name(),
                instance.state,
                instance.port
            ));
        }
        Ok(reply(&lines.join("\n")))
    }

    async fn cmd_threads(&self, chat_id: i64) -> Result<DispatchOutcome, DispatchError> {
        let topics = self.router.get_topics_for_chat(chat_id)?;
        if topics.is_empty() {
            return Ok(reply("No thread bindings in this chat."));
        }
        let mut lines = vec!["Thread bindings:".to_string()];
        for (topic_id, instance_id) in topics {
            let name = match self.processes.get(&instance_id).await {
                Some(instance) => instance.display_name(),
                None => instance_id,
            };
            lines.push(format!("- topic {topic_id} -> `{name}`"));
        }
        Ok(reply(&lines.join("\n")))
    }

    async fn cmd_instance_scope(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
        name: &str,
        args: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(instance_id) = self.router.get_current_instance_id(chat_id, topic_id)? else {
            return Ok(reply("No instance bound; use /open or /switch first."));
        };
        let Some(instance) = self.processes.get(&instance_id).await else {
            return Ok(reply("Bound instance no longer exists."));
        };
        let client = self.agent_client(instance.port);

        match name {
            "/sessions" => {
                let sessions = client.list_sessions().await?;
                if sessions.is_empty() {
                    return Ok(reply("No sessions."));
                }
                let keyboard: Keyboard = sessions
                    .iter()
                    .map(|s| {
                        vec![KeyboardButton {
                            text: s.title.clone().unwrap_or_else(|| s.id.clone()),
                            callback_data: CallbackAction::SessionPick {
                                session_id: s.id.clone(),
                            }
                            .encode(),
                        }]
                    })
                    .collect();
                Ok(DispatchOutcome::Reply {
                    text: "Sessions:".to_string(),
                    keyboard: Some(keyboard),
                })
            }
            "/models" => Ok(self.model_picker_reply()),
            "/health" => match client.health(self.health_check_path_for(&instance)).await {
                Ok(()) => Ok(reply("Agent is healthy.")),
                Err(e) => Ok(reply(&format!("Agent health check failed: {e}"))),
            },
            "/pending" => {
                let perms = client.list_pending_permissions().await?;
                let questions = client.list_pending_questions().await?;
                Ok(reply(&format!(
                    "{} pending permission(s), {} pending question(s).",
                    perms.len(),
                    questions.len()
                )))
            }
            "/messages" => {
                let Some(session_id) = self.router.get_session_id(chat_id, topic_id)? else {
                    return Ok(reply("No active session."));
                };
                let parts = client.list_messages(&session_id, 20).await?;
                let text = parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("\n---\n");
                Ok(reply(if text.is_empty() { "No messages." } else { &text }))
            }
            "/delete" => {
                if let Some(session_id) = self.router.get_session_id(chat_id, topic_id)? {
                    client.delete_session(&session_id).await?;
                    self.router.set_session_id(chat_id, topic_id, None)?;
                    Ok(reply("Session deleted."))
                } else {
                    Ok(reply("No active session to delete."))
                }
            }
            "/info" => Ok(reply(&format!(
                "`{}` {} {} provider={} model={}",
                instance.display_name(),
                instance.state,
                instance.directory.display(),
                instance.provider_id,
                instance.model_id
            ))),
            _ => {
                // No dedicated local handler: the agent interprets its own
                // command surface, so pass the raw text through as a prompt.
                let session_id = match self.router.get_session_id(chat_id, topic_id)? {
                    Some(id) => id,
                    None => {
                        let session = client.create_session(None, None).await?;
                        self.router
                            .set_session_id(chat_id, topic_id, Some(&session.id))?;
                        session.id
                    }
                };
                let prompt = format!("{name} {args}").trim().to_string();
                let reply_text = client
                    .send_message(&session_id, &prompt, &instance.provider_id, &instance.model_id)
                    .await?;
                Ok(reply(if reply_text.text.is_empty() {
                    "(empty response)"
                } else {
                    &reply_text.text
                }))
            }
        }
    }

    fn model_picker_reply(&self) -> DispatchOutcome {
        let keyboard: Keyboard = self
            .config
            .favourite_models
            .iter()
            .map(|(provider, model)| {
                let hash = controller_core::callback_data::hash_model_pick(provider, model);
                vec![KeyboardButton {
                    text: format!("{provider}/{model}"),
                    callback_data: CallbackAction::ModelPickHash { hash }.encode(),
                }]
            })
            .collect();
        DispatchOutcome::Reply {
            text: "Pick a model:".to_string(),
            keyboard: Some(keyboard),
        }
    }

    async fn find_by_prefix(&self, prefix: &str) -> Option<controller_core::AgentInstance> {
        self.processes
            .list()
            .await
            .into_iter()
            .find(|i| i.id.starts_with(prefix))
    }
}

/// A bidirectional map from `sm:<hash>` back to `(provider, model)`, built
/// fresh from the favourite-models config whenever a picker is rendered so
/// a callback answered minutes later can still resolve the pair.
pub fn favourite_model_hash_table(
    favourites: &[(String, String)],
) -> HashMap<String, (String, String)> {
    favourites
        .iter()
        .map(|(p, m)| {
            (
                controller_core::callback_data::hash_model_pick(p, m),
                (p.clone(), m.clone()),
            )
        })
        .collect()
}

fn parse_open_args(args: &str) -> (&str, Option<String>) {
    if let Some(idx) = args.find("--type") {
        let path = args[..idx].trim();
        let rest = args[idx + "--type".len()..].trim();
        let instance_type = rest.split_whitespace().next().map(str::to_string);
        (path, instance_type)
    } else {
        (args.trim(), None)
    }
}

fn resolve_directory(path: &str) -> Option<PathBuf> {
    if path.is_empty() {
        return None;
    }
    let p = PathBuf::from(path);
    if p.is_dir() {
        Some(p.canonicalize().unwrap_or(p))
    } else {
        None
    }
}

fn reply(text: &str) -> DispatchOutcome {
    DispatchOutcome::Reply {
        text: text.to_string(),
        keyboard: None,
    }
}

const HELP_TEXT: &str = "\
/open <path> [--type T] — start or bind an agent for a project
/list, /projects, /instances — show live instances
/switch [id] — bind this chat/thread to an instance
/current — show the current binding
/close — stop and unbind the current instance
/kill [id] — stop an instance
/restart <id> — restart an instance
/status — table of all instances
/threads — thread bindings in this chat
/help — this text";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_command() {
        let parsed = parse("/open /tmp/proj").unwrap();
        assert_eq!(parsed.name, "/open");
        assert_eq!(parsed.args, "/tmp/proj");
    }

    #[test]
    fn strips_botname_suffix() {
        let parsed = parse("/status@mybot").unwrap();
        assert_eq!(parsed.name, "/status");
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert!(parse("hello there").is_none());
    }

    #[test]
    fn parse_open_args_splits_type_flag() {
        let (path, ty) = parse_open_args("/tmp/proj --type quantcode");
        assert_eq!(path, "/tmp/proj");
        assert_eq!(ty, Some("quantcode".to_string()));
    }

    #[test]
    fn parse_open_args_without_type() {
        let (path, ty) = parse_open_args("/tmp/proj");
        assert_eq!(path, "/tmp/proj");
        assert_eq!(ty, None);
    }

    #[test]
    fn hash_table_round_trips_favourites() {
        let favourites = vec![("anthropic".to_string(), "claude-sonnet-4-5".to_string())];
        let table = favourite_model_hash_table(&favourites);
        let hash = controller_core::callback_data::hash_model_pick("anthropic", "claude-sonnet-4-5");
        assert_eq!(table.get(&hash).unwrap().0, "anthropic");
    }
}
