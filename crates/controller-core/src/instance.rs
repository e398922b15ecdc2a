//! The managed agent subprocess and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle states of an [`AgentInstance`].
///
/// ```text
///           spawn
///    (none) ────► STARTING
///                    │ health OK within T_startup
///                    ▼
///                 RUNNING ──health fails N times──► UNREACHABLE
///                    │                                   │
///                    │ process exits unexpectedly        │ health OK
///                    ▼                                   ▼
///                 CRASHED ◄─────process exits──────── RUNNING
///                    │
///                    │ restart (count < K)
///                    ▼
///                 STARTING
/// ```
/// `stop` moves RUNNING→STOPPING→STOPPED. STOPPED and CRASHED are terminal
/// from the controller's point of view; both release the port and PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Running,
    Unreachable,
    Stopping,
    Stopped,
    Crashed,
}

impl InstanceState {
    /// Instances in these states own a live port/PID and should be health-checked.
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Unreachable)
    }

    /// Terminal states release their port and PID registration.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Unreachable => "unreachable",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// A managed agent subprocess: its port, PID, lifecycle state, and the
/// routing metadata used to display and dedupe it.
///
/// `process_handle` deliberately has no field here — per the factory-registry
/// design note, non-serialisable process handles live in a side table owned
/// by the process manager, not on this persistable struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: String,
    pub directory: PathBuf,
    pub port: u16,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_health_failures: u32,
    pub provider_id: String,
    pub model_id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub restart_count: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub browser_opened: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
}

impl AgentInstance {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.directory
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| self.directory.display().to_string())
        })
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }

    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.started_at.map(|t| Utc::now() - t)
    }
}

/// Generates a short opaque instance id, e.g. `a1b2c3d4e5f6`.
pub fn generate_instance_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:012x}", nanos & 0xffff_ffff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AgentInstance {
        AgentInstance {
            id: "abcdef123456".into(),
            directory: PathBuf::from("/tmp/proj"),
            port: 4097,
            state: InstanceState::Running,
            pid: Some(1234),
            started_at: Some(Utc::now()),
            last_health_check: None,
            consecutive_health_failures: 0,
            provider_id: "deepseek".into(),
            model_id: "deepseek-reasoner".into(),
            name: None,
            restart_count: 0,
            last_error: None,
            browser_opened: false,
            instance_type: None,
        }
    }

    #[test]
    fn display_name_falls_back_to_directory_basename() {
        let inst = sample();
        assert_eq!(inst.display_name(), "proj");
    }

    #[test]
    fn display_name_prefers_explicit_name() {
        let mut inst = sample();
        inst.name = Some("my-project".into());
        assert_eq!(inst.display_name(), "my-project");
    }

    #[test]
    fn short_id_truncates_to_eight_chars() {
        let inst = sample();
        assert_eq!(inst.short_id(), "abcdef12");
    }

    #[test]
    fn state_alive_and_terminal_partition_correctly() {
        for s in [
            InstanceState::Starting,
            InstanceState::Running,
            InstanceState::Unreachable,
        ] {
            assert!(s.is_alive());
            assert!(!s.is_terminal());
        }
        for s in [InstanceState::Stopped, InstanceState::Crashed] {
            assert!(!s.is_alive());
            assert!(s.is_terminal());
        }
        assert!(!InstanceState::Stopping.is_alive());
        assert!(!InstanceState::Stopping.is_terminal());
    }

    #[test]
    fn instances_round_trip_through_json() {
        let inst = sample();
        let json = serde_json::to_string(&inst).unwrap();
        let back: AgentInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, inst.id);
        assert_eq!(back.port, inst.port);
        assert_eq!(back.state, inst.state);
    }

    #[test]
    fn instance_type_omitted_when_none() {
        let inst = sample();
        let json = serde_json::to_string(&inst).unwrap();
        assert!(!json.contains("instance_type"));
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = generate_instance_id();
        let b = generate_instance_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 12);
    }
}
