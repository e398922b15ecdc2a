//! Shared state, persistence, and domain types for the Telegram agent
//! controller: instance bookkeeping, port/pid allocation, session routing,
//! pending-notification dedup, callback-data encoding, and configuration.
//!
//! This crate owns no network or process I/O; it is the part of the system
//! that can be fully exercised by filesystem-only tests.

pub mod callback_data;
pub mod config;
pub mod error;
pub mod file_lock;
pub mod instance;
pub mod pending_store;
pub mod pid_registry;
pub mod polling_offset;
pub mod port_registry;
pub mod project_namer;
pub mod session_router;

pub use callback_data::{CallbackAction, PermissionChoice};
pub use config::ControllerConfig;
pub use error::{ConfigError, ControllerError, PortError, RouterError, StateError};
pub use file_lock::{FileLock, JsonStateFile, LockGuard};
pub use instance::{generate_instance_id, AgentInstance, InstanceState};
pub use pending_store::{NotifyTarget, PendingStore};
pub use pid_registry::PidRegistry;
pub use polling_offset::PollingOffsetStore;
pub use port_registry::PortRegistry;
pub use session_router::{ChatContext, ContextKey, SessionRouter};
