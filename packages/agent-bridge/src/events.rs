//! Events published by the chat and session layers. Consumers (an editor
//! frontend, the CLI) subscribe to broadcast channels and render these.

use agent_bridge_client::types::{Message, SessionMetadata};
use agent_bridge_error::ErrorReport;
use serde::Serialize;

/// Emitted over the lifetime of one chat turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Incremental full state of the assistant message; each event replaces
    /// the previous state for the same message id.
    MessageReceived { message: Message },
    /// The turn ended. `message` is the final assistant state when the
    /// stream delivered one.
    Finish {
        message: Option<Message>,
        reason: FinishReason,
    },
    Error { report: ErrorReport },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The stream ran to completion.
    Complete,
    /// The server cut the turn short.
    Stopped,
    /// The user cancelled the turn.
    Aborted,
}

impl FinishReason {
    /// Maps the reason string carried by a finish frame. Unknown or missing
    /// reasons count as a normal completion.
    pub fn from_wire(reason: Option<&str>) -> Self {
        match reason {
            Some("stopped") | Some("stop_requested") => Self::Stopped,
            Some("aborted") | Some("abort") => Self::Aborted,
            _ => Self::Complete,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Created { session: SessionMetadata },
    Loaded { session_id: String },
    Switched { session_id: String },
    CatalogChanged { sessions: Vec<SessionMetadata> },
    Error { report: ErrorReport },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_reasons_map_to_finish_reasons() {
        assert_eq!(FinishReason::from_wire(None), FinishReason::Complete);
        assert_eq!(FinishReason::from_wire(Some("stop")), FinishReason::Complete);
        assert_eq!(
            FinishReason::from_wire(Some("stopped")),
            FinishReason::Stopped
        );
        assert_eq!(
            FinishReason::from_wire(Some("aborted")),
            FinishReason::Aborted
        );
    }
}
