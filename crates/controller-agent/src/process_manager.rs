//! Owns the `AgentInstance` table and drives every lifecycle transition:
//! spawn, stop, restart, and the periodic health-check sweep.
//!
//! Non-serialisable process handles live in a side table here, keyed by
//! instance id, rather than on `AgentInstance` itself.

use crate::agent_client::AgentClient;
use crate::instance_factory::{FactoryRegistry, InstanceFactory};
use controller_core::{AgentInstance, InstanceState, PidRegistry, PortRegistry, StateError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Port(#[from] controller_core::PortError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("instance {0} is not running")]
    NotRunning(String),

    #[error("instance {0} did not become healthy within the startup timeout")]
    StartupTimeout(String),
}

/// A callback fired on every state transition so interested components
/// (the pending tracker, chats bound to the instance) can react without the
/// process manager needing to know about Telegram at all.
pub type TransitionCallback = Arc<dyn Fn(&AgentInstance) + Send + Sync>;

struct ManagedProcess {
    child: Child,
}

/// Spawns, monitors, restarts, and reaps agent subprocesses.
pub struct ProcessManager {
    instances: Mutex<HashMap<String, AgentInstance>>,
    processes: Mutex<HashMap<String, ManagedProcess>>,
    ports: Mutex<PortRegistry>,
    pids: PidRegistry,
    logs_dir: PathBuf,
    factories: FactoryRegistry,
    on_transition: Option<TransitionCallback>,
    auto_restart: bool,
    max_restart_count: u32,
    max_health_failures: u32,
    startup_timeout: Duration,
    graceful_stop_timeout: Duration,
    agent_request_timeout: Duration,
}

impl ProcessManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_dir: impl AsRef<Path>,
        port_range: (u16, u16),
        auto_restart: bool,
        max_restart_count: u32,
        max_health_failures: u32,
        startup_timeout_secs: u64,
        graceful_stop_timeout_secs: u64,
        agent_request_timeout_secs: u64,
    ) -> Self {
        let state_dir = state_dir.as_ref();
        Self {
            instances: Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
            ports: Mutex::new(PortRegistry::new(port_range.0, port_range.1)),
            pids: PidRegistry::new(state_dir.join("pids")),
            logs_dir: state_dir.join("logs"),
            factories: FactoryRegistry::with_builtins(),
            on_transition: None,
            auto_restart,
            max_restart_count,
            max_health_failures,
            startup_timeout: Duration::from_secs(startup_timeout_secs),
            graceful_stop_timeout: Duration::from_secs(graceful_stop_timeout_secs),
            agent_request_timeout: Duration::from_secs(agent_request_timeout_secs),
        }
    }

    pub fn with_transition_callback(mut self, callback: TransitionCallback) -> Self {
        self.on_transition = Some(callback);
        self
    }

    async fn notify(&self, instance: &AgentInstance) {
        if let Some(callback) = &self.on_transition {
            callback(instance);
        }
    }

    /// Returns the live instance for `directory` if one already exists.
    pub async fn find_by_directory(&self, directory: &Path) -> Option<AgentInstance> {
        let instances = self.instances.lock().await;
        instances
            .values()
            .find(|i| i.directory == directory && i.state.is_alive())
            .cloned()
    }

    pub async fn get(&self, instance_id: &str) -> Option<AgentInstance> {
        self.instances.lock().await.get(instance_id).cloned()
    }

    pub async fn list(&self) -> Vec<AgentInstance> {
        self.instances.lock().await.values().cloned().collect()
    }

    /// Spawns an agent for `directory`, or returns the existing live
    /// instance if one is already bound to it.
    pub async fn spawn(
        &self,
        directory: PathBuf,
        name: Option<String>,
        provider_id: String,
        model_id: String,
        instance_type: Option<String>,
    ) -> Result<AgentInstance, ProcessError> {
        if let Some(existing) = self.find_by_directory(&directory).await {
            return Ok(existing);
        }

        let factory = self
            .factories
            .get(instance_type.as_deref())
            .unwrap_or_else(|| self.factories.get(None).expect("opencode is always registered"));

        let port = self.ports.lock().await.allocate()?;
        let id = controller_core::generate_instance_id();
        let spawn_command = factory.spawn_command(&directory, port);

        std::fs::create_dir_all(&self.logs_dir).map_err(ProcessError::Spawn)?;
        let stdout_path = self.logs_dir.join(format!("{id}_stdout.log"));
        let stderr_path = self.logs_dir.join(format!("{id}_stderr.log"));
        let stdout_file = open_log_file(&stdout_path, &id).map_err(ProcessError::Spawn)?;
        let stderr_file = open_log_file(&stderr_path, &id).map_err(ProcessError::Spawn)?;

        let mut command = Command::new(&spawn_command.program);
        command
            .args(&spawn_command.args)
            .current_dir(&directory)
            .envs(spawn_command.env.iter().cloned())
            .stdout(stdout_file)
            .stderr(stderr_file);
        detach_from_signal_group(&mut command);

        let child = command.spawn().map_err(|e| {
            tracing::warn!(error = %e, directory = %directory.display(), "agent spawn failed");
            ProcessError::Spawn(e)
        })?;
        let pid = child.id().unwrap_or(0);

        let mut instance = AgentInstance {
            id: id.clone(),
            directory,
            port,
            state: InstanceState::Starting,
            pid: Some(pid),
            started_at: Some(chrono::Utc::now()),
            last_health_check: None,
            consecutive_health_failures: 0,
            provider_id,
            model_id,
            name,
            restart_count: 0,
            last_error: None,
            browser_opened: false,
            instance_type: instance_type.clone(),
        };

        self.pids
            .write_pid(&id, pid)
            .map_err(ProcessError::Spawn)?;
        self.processes
            .lock()
            .await
            .insert(id.clone(), ManagedProcess { child });
        self.instances.lock().await.insert(id.clone(), instance.clone());

        let client = AgentClient::with_timeout(port, self.agent_request_timeout);
        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        loop {
            if self.child_has_exited(&id).await {
                instance.state = InstanceState::Crashed;
                instance.last_error = Some("agent process exited during startup".to_string());
                self.release(&id, port).await;
                self.instances.lock().await.insert(id.clone(), instance.clone());
                self.notify(&instance).await;
                return Ok(instance);
            }
            if client.health(factory.health_check_path()).await.is_ok() {
                instance.state = InstanceState::Running;
                instance.last_health_check = Some(chrono::Utc::now());
                self.instances.lock().await.insert(id.clone(), instance.clone());
                self.notify(&instance).await;
                return Ok(instance);
            }
            if tokio::time::Instant::now() >= deadline {
                instance.state = InstanceState::Crashed;
                instance.last_error = Some("startup health check timed out".to_string());
                self.release(&id, port).await;
                self.instances.lock().await.insert(id.clone(), instance.clone());
                self.notify(&instance).await;
                return Err(ProcessError::StartupTimeout(id));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    async fn child_has_exited(&self, instance_id: &str) -> bool {
        let mut processes = self.processes.lock().await;
        match processes.get_mut(instance_id) {
            Some(managed) => matches!(managed.child.try_wait(), Ok(Some(_))),
            None => true,
        }
    }

    async fn release(&self, instance_id: &str, port: u16) {
        self.ports.lock().await.release(port);
        self.pids.remove_pid(instance_id);
        self.processes.lock().await.remove(instance_id);
    }

    /// Stops a running instance: graceful termination, bounded wait, then
    /// force-kill.
    pub async fn stop(&self, instance_id: &str) -> Result<(), ProcessError> {
        let mut instance = self
            .get(instance_id)
            .await
            .ok_or_else(|| ProcessError::NotRunning(instance_id.to_string()))?;

        instance.state = InstanceState::Stopping;
        self.instances
            .lock()
            .await
            .insert(instance_id.to_string(), instance.clone());
        self.notify(&instance).await;

        {
            let mut processes = self.processes.lock().await;
            if let Some(managed) = processes.get_mut(instance_id) {
                terminate_gracefully(&mut managed.child, self.graceful_stop_timeout).await;
            }
        }

        instance.state = InstanceState::Stopped;
        instance.pid = None;
        self.release(instance_id, instance.port).await;
        self.instances
            .lock()
            .await
            .insert(instance_id.to_string(), instance.clone());
        self.notify(&instance).await;
        Ok(())
    }

    /// Stops (if alive) then spawns again, reusing directory/name/provider/model.
    pub async fn restart(&self, instance_id: &str) -> Result<AgentInstance, ProcessError> {
        let previous = self
            .get(instance_id)
            .await
            .ok_or_else(|| ProcessError::NotRunning(instance_id.to_string()))?;

        if previous.state.is_alive() {
            self.stop(instance_id).await?;
        }
        self.instances.lock().await.remove(instance_id);

        let restart_count = previous.restart_count + 1;
        let mut spawned = self
            .spawn(
                previous.directory,
                previous.name,
                previous.provider_id,
                previous.model_id,
                previous.instance_type,
            )
            .await?;
        spawned.restart_count = restart_count;
        self.instances
            .lock()
            .await
            .insert(spawned.id.clone(), spawned.clone());
        Ok(spawned)
    }

    /// Removes an instance's bookkeeping entirely (after it has already
    /// reached a terminal state).
    pub async fn remove(&self, instance_id: &str) {
        self.instances.lock().await.remove(instance_id);
        self.processes.lock().await.remove(instance_id);
        self.pids.remove_pid(instance_id);
    }

    /// One pass of the health-check sweep: for every non-terminal instance,
    /// check whether the process exited, else probe `health()`, updating
    /// state and failure counters. Callers drive the 10-second cadence.
    pub async fn health_sweep(&self) {
        let ids: Vec<String> = {
            let instances = self.instances.lock().await;
            instances
                .values()
                .filter(|i| !i.state.is_terminal())
                .map(|i| i.id.clone())
                .collect()
        };

        for id in ids {
            self.health_check_one(&id).await;
        }
    }

    async fn health_check_one(&self, instance_id: &str) {
        let Some(mut instance) = self.get(instance_id).await else {
            return;
        };

        if self.child_has_exited(instance_id).await {
            instance.state = InstanceState::Crashed;
            instance.last_error = Some("agent process exited".to_string());
            self.release(instance_id, instance.port).await;
            self.instances
                .lock()
                .await
                .insert(instance_id.to_string(), instance.clone());
            self.notify(&instance).await;

            if self.auto_restart && instance.restart_count < self.max_restart_count {
                tracing::warn!(instance_id, "agent crashed, scheduling restart");
                let _ = self.restart(instance_id).await;
            }
            return;
        }

        let health_check_path = self
            .factories
            .get(instance.instance_type.as_deref())
            .map_or("/global/health", InstanceFactory::health_check_path);
        let client = AgentClient::with_timeout(instance.port, self.agent_request_timeout);
        instance.last_health_check = Some(chrono::Utc::now());
        match client.health(health_check_path).await {
            Ok(()) => {
                instance.consecutive_health_failures = 0;
                if instance.state == InstanceState::Unreachable {
                    instance.state = InstanceState::Running;
                }
            }
            Err(_) => {
                instance.consecutive_health_failures += 1;
                if instance.consecutive_health_failures >= self.max_health_failures {
                    instance.state = InstanceState::Unreachable;
                }
            }
        }
        self.instances
            .lock()
            .await
            .insert(instance_id.to_string(), instance.clone());
        self.notify(&instance).await;
    }

    pub fn factories(&self) -> &FactoryRegistry {
        &self.factories
    }

    /// Marks an instance's web UI as already opened for this run, so the
    /// forwarder's one-shot browser-open stays idempotent.
    pub async fn mark_browser_opened(&self, instance_id: &str) {
        if let Some(instance) = self.instances.lock().await.get_mut(instance_id) {
            instance.browser_opened = true;
        }
    }

    /// Restores `used` ports from a reloaded `instances.json` so a fresh
    /// `PortRegistry` doesn't hand out a port an already-live instance owns.
    pub async fn restore(&self, instances: Vec<AgentInstance>) {
        let mut ports = self.ports.lock().await;
        let mut table = self.instances.lock().await;
        for instance in instances {
            if instance.state.is_alive() {
                ports.mark_used(instance.port);
            }
            table.insert(instance.id.clone(), instance);
        }
    }
}

fn open_log_file(path: &Path, instance_id: &str) -> std::io::Result<std::fs::File> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "=== spawn {instance_id} at {} ===", chrono::Utc::now())?;
    Ok(file)
}

#[cfg(unix)]
fn detach_from_signal_group(command: &mut Command) {
    command.process_group(0);
}

#[cfg(not(unix))]
fn detach_from_signal_group(_command: &mut Command) {}

async fn terminate_gracefully(child: &mut Child, timeout: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    if waited.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_manager(dir: &Path, port_range: (u16, u16)) -> ProcessManager {
        ProcessManager::new(dir, port_range, true, 3, 3, 30, 10, 600)
    }

    #[tokio::test]
    async fn spawn_of_nonexistent_program_surfaces_spawn_error() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(dir.path(), (30900, 30910));
        let result = manager
            .spawn(
                dir.path().to_path_buf(),
                None,
                "deepseek".to_string(),
                "deepseek-reasoner".to_string(),
                Some("nonexistent-instance-type-xyz".to_string()),
            )
            .await;
        // Falls back to the default factory (opencode), which also isn't on
        // PATH in a test environment, so spawning the subprocess itself fails.
        assert!(matches!(result, Err(ProcessError::Spawn(_))));
    }

    #[tokio::test]
    async fn restore_marks_alive_instance_ports_as_used() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(dir.path(), (30950, 30960));
        let instance = AgentInstance {
            id: "abc".to_string(),
            directory: dir.path().to_path_buf(),
            port: 30951,
            state: InstanceState::Running,
            pid: Some(1),
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
        };
        manager.restore(vec![instance]).await;
        assert!(manager.ports.lock().await.is_used(30951));
        assert!(manager.get("abc").await.is_some());
    }
}
