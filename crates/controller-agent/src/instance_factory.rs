//! Pluggable spawn-command/health-check strategies, keyed by an instance
//! type tag (`"opencode"` by default). Composition over inheritance: a
//! factory is a small trait object the registry looks up by tag, not a class
//! hierarchy with shared base behaviour.

use std::collections::HashMap;
use std::path::Path;

/// The command line and environment needed to start one agent subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Spawn-command building and health-check strategy for one instance type.
///
/// Mirrors the shape of a CLI backend dispatch table: a tag string selects a
/// concrete strategy, and the strategy itself is stateless data plus a
/// handful of pure functions, not an object with a `create()`/`stop()`
/// lifecycle of its own — lifecycle is `ProcessManager`'s job.
pub trait InstanceFactory: Send + Sync {
    /// The tag this factory registers under, e.g. `"opencode"`.
    fn instance_type(&self) -> &str;

    /// Builds the command used to spawn the agent, bound to `port` and
    /// rooted at `directory`.
    fn spawn_command(&self, directory: &Path, port: u16) -> SpawnCommand;

    /// Path appended to the instance's base URL for a liveness probe.
    fn health_check_path(&self) -> &str {
        "/global/health"
    }

    /// Default provider/model to use when the caller didn't specify one.
    fn default_provider_model(&self) -> (&str, &str);
}

/// The default factory: spawns `opencode serve --port P --hostname 127.0.0.1`.
pub struct OpencodeFactory;

impl InstanceFactory for OpencodeFactory {
    fn instance_type(&self) -> &str {
        "opencode"
    }

    fn spawn_command(&self, directory: &Path, port: u16) -> SpawnCommand {
        SpawnCommand {
            program: "opencode".to_string(),
            args: vec![
                "serve".to_string(),
                "--port".to_string(),
                port.to_string(),
                "--hostname".to_string(),
                "127.0.0.1".to_string(),
            ],
            env: vec![(
                "OPENCODE_WORKDIR".to_string(),
                directory.display().to_string(),
            )],
        }
    }

    fn default_provider_model(&self) -> (&str, &str) {
        ("deepseek", "deepseek-reasoner")
    }
}

/// A second built-in instance type, analogous to the Python original's
/// `quantcode` factory: same HTTP contract, different binary name.
pub struct QuantcodeFactory;

impl InstanceFactory for QuantcodeFactory {
    fn instance_type(&self) -> &str {
        "quantcode"
    }

    fn spawn_command(&self, directory: &Path, port: u16) -> SpawnCommand {
        SpawnCommand {
            program: "quantcode".to_string(),
            args: vec![
                "serve".to_string(),
                "--port".to_string(),
                port.to_string(),
                "--hostname".to_string(),
                "127.0.0.1".to_string(),
            ],
            env: vec![(
                "QUANTCODE_WORKDIR".to_string(),
                directory.display().to_string(),
            )],
        }
    }

    fn default_provider_model(&self) -> (&str, &str) {
        ("deepseek", "deepseek-reasoner")
    }
}

/// Registry of instance-type tag -> factory. Built-ins are registered at
/// construction; callers may register additional factories (e.g. a custom
/// command configured via `ControllerConfig::instance_types`).
pub struct FactoryRegistry {
    factories: HashMap<String, Box<dyn InstanceFactory>>,
    default_type: String,
}

impl FactoryRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
            default_type: "opencode".to_string(),
        };
        registry.register(Box::new(OpencodeFactory));
        registry.register(Box::new(QuantcodeFactory));
        registry
    }

    pub fn register(&mut self, factory: Box<dyn InstanceFactory>) {
        self.factories
            .insert(factory.instance_type().to_string(), factory);
    }

    pub fn get(&self, instance_type: Option<&str>) -> Option<&dyn InstanceFactory> {
        let tag = instance_type.unwrap_or(&self.default_type);
        self.factories.get(tag).map(std::convert::AsRef::as_ref)
    }

    pub fn has_type(&self, instance_type: &str) -> bool {
        self.factories.contains_key(instance_type)
    }

    pub fn list_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn default_type(&self) -> &str {
        &self.default_type
    }
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn builtins_include_opencode_and_quantcode() {
        let registry = FactoryRegistry::with_builtins();
        assert!(registry.has_type("opencode"));
        assert!(registry.has_type("quantcode"));
        assert_eq!(registry.list_types(), vec!["opencode", "quantcode"]);
    }

    #[test]
    fn none_falls_back_to_default_type() {
        let registry = FactoryRegistry::with_builtins();
        let factory = registry.get(None).unwrap();
        assert_eq!(factory.instance_type(), "opencode");
    }

    #[test]
    fn unknown_type_returns_none() {
        let registry = FactoryRegistry::with_builtins();
        assert!(registry.get(Some("nonexistent")).is_none());
    }

    #[test]
    fn opencode_spawn_command_binds_requested_port() {
        let registry = FactoryRegistry::with_builtins();
        let factory = registry.get(Some("opencode")).unwrap();
        let cmd = factory.spawn_command(&PathBuf::from("/tmp/proj"), 4100);
        assert_eq!(cmd.program, "opencode");
        assert_eq!(
            cmd.args,
            vec!["serve", "--port", "4100", "--hostname", "127.0.0.1"]
        );
    }

    #[test]
    fn custom_factory_can_be_registered() {
        struct CustomFactory;
        impl InstanceFactory for CustomFactory {
            fn instance_type(&self) -> &str {
                "custom"
            }
            fn spawn_command(&self, _directory: &Path, port: u16) -> SpawnCommand {
                SpawnCommand {
                    program: "custom-agent".to_string(),
                    args: vec!["--port".to_string(), port.to_string()],
                    env: vec![],
                }
            }
            fn default_provider_model(&self) -> (&str, &str) {
                ("anthropic", "claude-sonnet-4-5")
            }
        }

        let mut registry = FactoryRegistry::with_builtins();
        registry.register(Box::new(CustomFactory));
        assert!(registry.has_type("custom"));
        assert_eq!(registry.get(Some("custom")).unwrap().instance_type(), "custom");
    }
}
