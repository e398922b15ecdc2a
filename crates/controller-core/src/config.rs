//! Layered configuration: compiled-in defaults → YAML file → environment →
//! CLI flags (merged by the CLI crate, which owns flag parsing).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn default_state_dir() -> PathBuf {
    dirs_home()
        .map(|home| home.join(".local/share/telegram_controller"))
        .unwrap_or_else(|| PathBuf::from("./telegram_controller_state"))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-reasoner".to_string()
}

fn default_port_range() -> (u16, u16) {
    (4097, 4200)
}

const fn default_health_check_interval_secs() -> u64 {
    10
}

const fn default_max_health_failures() -> u32 {
    3
}

const fn default_max_restart_count() -> u32 {
    3
}

const fn default_startup_timeout_secs() -> u64 {
    30
}

const fn default_graceful_stop_timeout_secs() -> u64 {
    10
}

const fn default_pending_sweep_interval_secs() -> u64 {
    10
}

const fn default_agent_request_timeout_secs() -> u64 {
    600
}

const fn default_true() -> bool {
    true
}

/// Per-instance-type overrides registered via config, layered on top of the
/// static factory registry (see `controller-agent::instance_factory`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceTypeConfig {
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Never logged or Debug-printed in full; see the custom `Debug` impl below.
    #[serde(default)]
    pub bot_token: String,

    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default = "default_model")]
    pub default_model: String,

    /// `(provider, model)` pairs offered by the model picker.
    #[serde(default)]
    pub favourite_models: Vec<(String, String)>,

    #[serde(default = "default_port_range")]
    pub port_range: (u16, u16),

    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_true")]
    pub auto_open_browser: bool,

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_max_health_failures")]
    pub max_health_failures: u32,
    #[serde(default = "default_max_restart_count")]
    pub max_restart_count: u32,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_graceful_stop_timeout_secs")]
    pub graceful_stop_timeout_secs: u64,
    #[serde(default = "default_pending_sweep_interval_secs")]
    pub pending_sweep_interval_secs: u64,
    #[serde(default = "default_agent_request_timeout_secs")]
    pub agent_request_timeout_secs: u64,

    #[serde(default)]
    pub instance_types: HashMap<String, InstanceTypeConfig>,

    #[serde(default)]
    pub allowed_chat_ids: Option<Vec<i64>>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            bot_token: String::new(),
            default_provider: default_provider(),
            default_model: default_model(),
            favourite_models: Vec::new(),
            port_range: default_port_range(),
            auto_restart: true,
            auto_open_browser: true,
            health_check_interval_secs: default_health_check_interval_secs(),
            max_health_failures: default_max_health_failures(),
            max_restart_count: default_max_restart_count(),
            startup_timeout_secs: default_startup_timeout_secs(),
            graceful_stop_timeout_secs: default_graceful_stop_timeout_secs(),
            pending_sweep_interval_secs: default_pending_sweep_interval_secs(),
            agent_request_timeout_secs: default_agent_request_timeout_secs(),
            instance_types: HashMap::new(),
            allowed_chat_ids: None,
        }
    }
}

impl std::fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("state_dir", &self.state_dir)
            .field("bot_token", &"<redacted>")
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("favourite_models", &self.favourite_models)
            .field("port_range", &self.port_range)
            .field("auto_restart", &self.auto_restart)
            .field("auto_open_browser", &self.auto_open_browser)
            .field("health_check_interval_secs", &self.health_check_interval_secs)
            .field("max_health_failures", &self.max_health_failures)
            .field("max_restart_count", &self.max_restart_count)
            .field("startup_timeout_secs", &self.startup_timeout_secs)
            .field("graceful_stop_timeout_secs", &self.graceful_stop_timeout_secs)
            .field("pending_sweep_interval_secs", &self.pending_sweep_interval_secs)
            .field("agent_request_timeout_secs", &self.agent_request_timeout_secs)
            .field("instance_types", &self.instance_types)
            .field("allowed_chat_ids", &self.allowed_chat_ids)
            .finish()
    }
}

impl ControllerConfig {
    /// Loads defaults, then overlays a YAML file (if present), then
    /// environment variables. CLI flags are applied by the caller afterward
    /// since they need `clap`'s parsed struct, which this crate does not
    /// depend on.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };

        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            config.bot_token = token;
        }
        if let Ok(models) = std::env::var("TELEGRAM_FAVOURITE_MODELS") {
            config.favourite_models = parse_favourite_models(&models);
        }
        if let Ok(dir) = std::env::var("TELEGRAM_CONTROLLER_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Ok(provider) = std::env::var("TELEGRAM_CONTROLLER_PROVIDER") {
            config.default_provider = provider;
        }
        if let Ok(model) = std::env::var("TELEGRAM_CONTROLLER_MODEL") {
            config.default_model = model;
        }
        if let Ok(range) = std::env::var("TELEGRAM_CONTROLLER_PORT_RANGE") {
            config.port_range = parse_port_range(&range).ok_or(ConfigError::InvalidValue {
                field: "TELEGRAM_CONTROLLER_PORT_RANGE",
                message: format!("expected LO:HI, got {range}"),
            })?;
        }
        if let Ok(flag) = std::env::var("TELEGRAM_CONTROLLER_AUTO_OPEN_BROWSER") {
            config.auto_open_browser = parse_bool_env(&flag);
        }
        if let Ok(flag) = std::env::var("TELEGRAM_CONTROLLER_AUTO_RESTART") {
            config.auto_restart = parse_bool_env(&flag);
        }

        if config.bot_token.is_empty() {
            return Err(ConfigError::MissingEnv("TELEGRAM_BOT_TOKEN"));
        }

        Ok(config)
    }

    fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

fn parse_favourite_models(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let pair = pair.trim();
            pair.split_once('/')
                .map(|(p, m)| (p.trim().to_string(), m.trim().to_string()))
        })
        .collect()
}

fn parse_port_range(raw: &str) -> Option<(u16, u16)> {
    let (lo, hi) = raw.split_once(':')?;
    Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?))
}

fn parse_bool_env(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sensible() {
        let config = ControllerConfig::default();
        assert_eq!(config.port_range, (4097, 4200));
        assert_eq!(config.max_health_failures, 3);
        assert!(config.auto_restart);
        assert!(config.auto_open_browser);
    }

    #[test]
    fn debug_impl_redacts_bot_token() {
        let mut config = ControllerConfig::default();
        config.bot_token = "super-secret-token".to_string();
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("super-secret-token"));
        assert!(debug_output.contains("<redacted>"));
    }

    #[test]
    #[allow(unsafe_code)]
    fn load_fails_without_bot_token() {
        // SAFETY: tests run single-threaded within this process by default
        // in practice, but to be defensive we only read/clear a var scoped
        // to this test's own prefix and restore it afterward.
        unsafe {
            std::env::remove_var("TELEGRAM_BOT_TOKEN");
        }
        let result = ControllerConfig::load(None);
        assert!(matches!(result, Err(ConfigError::MissingEnv(_))));
    }

    #[test]
    #[allow(unsafe_code)]
    fn yaml_file_overlays_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "default_provider: anthropic\nport_range: [5000, 5010]\n").unwrap();

        unsafe {
            std::env::set_var("TELEGRAM_BOT_TOKEN", "test-token");
        }
        let config = ControllerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.default_provider, "anthropic");
        assert_eq!(config.port_range, (5000, 5010));
        unsafe {
            std::env::remove_var("TELEGRAM_BOT_TOKEN");
        }
    }

    #[test]
    fn parses_favourite_models_list() {
        let models = parse_favourite_models("anthropic/claude-sonnet-4, openai/gpt-4o");
        assert_eq!(
            models,
            vec![
                ("anthropic".to_string(), "claude-sonnet-4".to_string()),
                ("openai".to_string(), "gpt-4o".to_string()),
            ]
        );
    }

    #[test]
    fn parses_port_range_env_format() {
        assert_eq!(parse_port_range("5000:5010"), Some((5000, 5010)));
        assert_eq!(parse_port_range("not-a-range"), None);
    }
}
