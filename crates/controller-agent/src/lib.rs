//! Agent subprocess lifecycle and HTTP client: spawning, health checks,
//! restarts, and the typed client for the agent's session/message API.

pub mod agent_client;
pub mod instance_factory;
pub mod process_manager;

pub use agent_client::{AgentClient, AgentError, AgentReply, PendingPermission, PendingQuestion, ResponsePart, Session, SessionStatus};
pub use instance_factory::{FactoryRegistry, InstanceFactory, OpencodeFactory, QuantcodeFactory, SpawnCommand};
pub use process_manager::{ProcessError, ProcessManager, TransitionCallback};
