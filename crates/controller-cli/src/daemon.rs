//! Wires every component together and drives the long-poll update loop.

use crate::instance_store::InstanceStore;
use controller_agent::ProcessManager;
use controller_core::{ControllerConfig, PendingStore, PidRegistry, PollingOffsetStore, SessionRouter};
use controller_telegram::{
    CallbackHandler, CommandDispatcher, ControllerUpdate, DispatchOutcome, MessageForwarder,
    PendingTracker, TelegramClient,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    State(#[from] controller_core::StateError),
    #[error("failed to create state directory {path}: {source}")]
    StateDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Polls the shutdown flag on a short interval; used as one arm of a
/// `tokio::select!` racing an in-flight long-poll or background sleep.
async fn wait_for_shutdown(shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn install_signal_handlers(shutdown: Arc<AtomicBool>) {
    let ctrl_c_flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c_flag.store(true, Ordering::Relaxed);
    });

    #[cfg(unix)]
    {
        let term_flag = Arc::clone(&shutdown);
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    term_flag.store(true, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    term_flag.store(true, Ordering::Relaxed);
                }
            }
        });
    }
}

pub async fn run(config: ControllerConfig) -> Result<(), DaemonError> {
    std::fs::create_dir_all(&config.state_dir).map_err(|e| DaemonError::StateDir {
        path: config.state_dir.clone(),
        source: e,
    })?;

    let instance_store = Arc::new(InstanceStore::new(&config.state_dir)?);
    let loaded_instances = instance_store.load_all()?;

    let managed_pids: HashSet<u32> = loaded_instances
        .iter()
        .filter(|i| i.state.is_alive())
        .filter_map(|i| i.pid)
        .collect();
    let pids = PidRegistry::new(config.state_dir.join("pids"));
    let orphans_cleaned = pids.cleanup_orphans(&managed_pids);
    if orphans_cleaned > 0 {
        tracing::warn!(count = orphans_cleaned, "terminated orphaned agent processes from a previous run");
    }

    let persist_store = Arc::clone(&instance_store);
    let processes = Arc::new(
        ProcessManager::new(
            &config.state_dir,
            config.port_range,
            config.auto_restart,
            config.max_restart_count,
            config.max_health_failures,
            config.startup_timeout_secs,
            config.graceful_stop_timeout_secs,
            config.agent_request_timeout_secs,
        )
        .with_transition_callback(Arc::new(move |instance| {
            if let Err(e) = persist_store.upsert(instance) {
                tracing::warn!(error = %e, instance_id = %instance.id, "failed to persist instance state");
            }
        })),
    );
    processes.restore(loaded_instances).await;

    let router = Arc::new(SessionRouter::new(&config.state_dir)?);
    let pending_store = Arc::new(PendingStore::new(&config.state_dir)?);
    let offsets = PollingOffsetStore::new(&config.state_dir)?;
    let telegram = Arc::new(TelegramClient::new(&config.bot_token));
    let config = Arc::new(config);

    let pending_tracker = Arc::new(PendingTracker::new(
        Arc::clone(&router),
        Arc::clone(&processes),
        Arc::clone(&telegram),
        Arc::clone(&pending_store),
    ));
    let dispatcher = CommandDispatcher::new(Arc::clone(&router), Arc::clone(&processes), Arc::clone(&config));
    let callbacks = CallbackHandler::new(
        Arc::clone(&router),
        Arc::clone(&processes),
        Arc::clone(&telegram),
        Arc::clone(&pending_tracker),
        Arc::clone(&config),
    );
    let forwarder = MessageForwarder::new(
        Arc::clone(&router),
        Arc::clone(&processes),
        Arc::clone(&telegram),
        Arc::clone(&pending_tracker),
        Arc::clone(&config),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handlers(Arc::clone(&shutdown)).await;

    {
        let processes = Arc::clone(&processes);
        let shutdown = Arc::clone(&shutdown);
        let interval = Duration::from_secs(config.health_check_interval_secs);
        tokio::spawn(async move {
            while !shutdown.load(Ordering::Relaxed) {
                tokio::time::sleep(interval).await;
                processes.health_sweep().await;
            }
        });
    }

    {
        let pending_tracker = Arc::clone(&pending_tracker);
        let shutdown = Arc::clone(&shutdown);
        let interval = Duration::from_secs(config.pending_sweep_interval_secs);
        tokio::spawn(async move {
            while !shutdown.load(Ordering::Relaxed) {
                tokio::time::sleep(interval).await;
                pending_tracker.sweep_all().await;
            }
        });
    }

    tracing::info!(state_dir = %config.state_dir.display(), "controller daemon starting");

    let mut offset = offsets.load()?;
    'poll: while !shutdown.load(Ordering::Relaxed) {
        let updates = tokio::select! {
            () = wait_for_shutdown(&shutdown) => break 'poll,
            result = telegram.get_updates(offset, 50, 30) => result,
        };

        let (updates, next_offset) = match updates {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, "getUpdates failed, retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };
        offset = next_offset;
        offsets.advance(next_offset)?;

        for update in updates {
            handle_update(&config, &router, &dispatcher, &callbacks, &forwarder, &telegram, update).await;
        }
    }

    tracing::info!("shutdown signal received, stopping live instances");
    shutdown_instances(&processes, config.graceful_stop_timeout_secs).await;

    Ok(())
}

fn chat_is_allowed(config: &ControllerConfig, chat_id: i64) -> bool {
    match &config.allowed_chat_ids {
        Some(allowed) => allowed.contains(&chat_id),
        None => true,
    }
}

async fn handle_update(
    config: &ControllerConfig,
    router: &SessionRouter,
    dispatcher: &CommandDispatcher,
    callbacks: &CallbackHandler,
    forwarder: &MessageForwarder,
    telegram: &TelegramClient,
    update: ControllerUpdate,
) {
    match update {
        ControllerUpdate::Message {
            chat_id,
            topic_id,
            is_forum,
            text,
            from_user_id: _,
            username,
        } => {
            if !chat_is_allowed(config, chat_id) {
                tracing::warn!(chat_id, "rejected message from an unauthorized chat");
                return;
            }
            if is_forum {
                let _ = router.mark_chat_as_forum(chat_id);
            }
            match dispatcher.dispatch(chat_id, topic_id, &text).await {
                Ok(DispatchOutcome::Reply { text: reply, keyboard }) => {
                    let result = match keyboard {
                        Some(kb) => telegram.send_message_with_keyboard(chat_id, topic_id, &reply, &kb).await,
                        None => match topic_id {
                            Some(t) => telegram.send_message_to_topic(chat_id, t, &reply).await,
                            None => telegram.send_message(chat_id, &reply).await,
                        },
                    };
                    if let Err(e) = result {
                        tracing::warn!(error = %e, chat_id, "failed to deliver command reply");
                    }
                }
                Ok(DispatchOutcome::ReplyAndRenameTopic { text: reply, topic_id, new_name }) => {
                    let _ = telegram.edit_forum_topic(chat_id, topic_id, &new_name).await;
                    if let Err(e) = telegram.send_message_to_topic(chat_id, topic_id, &reply).await {
                        tracing::warn!(error = %e, chat_id, "failed to deliver command reply");
                    }
                }
                Ok(DispatchOutcome::NotACommand) => {
                    forwarder.forward(chat_id, topic_id, &text, username.as_deref()).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, chat_id, "command dispatch failed");
                    let _ = telegram.send_message(chat_id, &format!("Error: {e}")).await;
                }
            }
        }
        ControllerUpdate::CallbackQuery { callback_id, data, chat_id, topic_id, message_id } => {
            if !chat_is_allowed(config, chat_id) {
                tracing::warn!(chat_id, "rejected callback from an unauthorized chat");
                return;
            }
            if let Err(e) = callbacks.handle(&callback_id, &data, chat_id, topic_id, message_id).await {
                tracing::warn!(error = %e, chat_id, "callback handling failed");
            }
        }
    }
}

/// Stops every live instance in parallel, bounding each stop by
/// `timeout_secs` so one wedged agent can't hold up the whole shutdown.
async fn shutdown_instances(processes: &Arc<ProcessManager>, timeout_secs: u64) {
    let instances = processes.list().await;
    let live: Vec<String> = instances.into_iter().filter(|i| i.is_alive()).map(|i| i.id).collect();
    if live.is_empty() {
        return;
    }

    let timeout = Duration::from_secs(timeout_secs);
    let stops = live.into_iter().map(|id| {
        let processes = Arc::clone(processes);
        async move {
            if tokio::time::timeout(timeout, processes.stop(&id)).await.is_err() {
                tracing::warn!(instance_id = %id, "instance did not stop within the shutdown timeout");
            }
        }
    });
    futures::future::join_all(stops).await;
}
