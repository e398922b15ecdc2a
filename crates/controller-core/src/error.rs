use std::path::PathBuf;

/// Errors raised while reading, writing, or locking a state file under the
/// state directory (`instances.json`, `router_state.json`, etc).
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("file locking is unsupported on this platform")]
    UnsupportedPlatform,

    #[error("lock on {path} is held by another process")]
    WouldBlock { path: PathBuf },
}

/// Errors raised by [`crate::port_registry::PortRegistry`].
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("no ports available in range [{lo}, {hi})")]
    NoPortsAvailable { lo: u16, hi: u16 },
}

/// Errors raised by [`crate::session_router::SessionRouter`].
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("no context bound for key {0}")]
    NoContext(String),
}

/// Errors raised while loading layered configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Top-level error type unifying every component boundary, used wherever a
/// task needs to return a single error type across an `await` point.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Other(String),
}

impl From<RouterError> for ControllerError {
    fn from(value: RouterError) -> Self {
        match value {
            RouterError::State(e) => ControllerError::State(e),
            RouterError::NoContext(key) => ControllerError::Other(format!(
                "no context bound for key {key}"
            )),
        }
    }
}
