//! Editor-embeddable bridge to a locally-spawned AI agent server: process
//! supervision, secret-keyed HTTP access, streaming chat, and local-first
//! session state.

pub mod cli;
pub mod events;
pub mod processor;
pub mod rehydrate;
pub mod sessions;
pub mod stream;

pub use agent_bridge_client::{types, ApiClient, ChatRequest};
pub use agent_bridge_error::{BridgeError, ErrorKind, ErrorReport};
pub use agent_bridge_server_manager::{ServerManager, ServerManagerConfig, ServerStatus};
pub use agent_bridge_settings::{BridgeSettings, ProviderSettings};

pub use events::{ChatEvent, FinishReason, SessionEvent};
pub use processor::{ChatProcessor, OutgoingTurn};
pub use sessions::SessionManager;
