//! Telegram bot surface: update decoding, command/callback dispatch, pending
//! notification polling, and message forwarding to agent instances.

pub mod callback_handler;
pub mod command_dispatcher;
pub mod message_forwarder;
pub mod pending_tracker;
pub mod telegram_client;

pub use callback_handler::{CallbackError, CallbackHandler};
pub use command_dispatcher::{CommandDispatcher, DispatchError, DispatchOutcome};
pub use message_forwarder::MessageForwarder;
pub use pending_tracker::PendingTracker;
pub use telegram_client::{ControllerUpdate, Keyboard, KeyboardButton, TelegramClient, TelegramClientError};
