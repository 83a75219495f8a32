//! Drives one chat turn end to end: formats the outgoing message, appends it
//! to the active session before anything touches the network, streams the
//! response, and publishes [`ChatEvent`]s as the assistant message evolves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use agent_bridge_client::types::{CodeContextContent, ContentPart, Message, Role};
use agent_bridge_client::{ApiClient, ChatRequest};
use agent_bridge_error::{BridgeError, ErrorReport};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{ChatEvent, FinishReason};
use crate::sessions::SessionManager;
use crate::stream::{detect_mode, parse_frame, SseAccumulator, StreamFrame, StreamMode};

/// User input for one turn.
#[derive(Debug, Clone, Default)]
pub struct OutgoingTurn {
    pub text: String,
    /// Selections summarized as one reference line each. A reference whose
    /// selected text is blank is skipped.
    pub code_references: Vec<CodeContextContent>,
    /// Code quoted verbatim at the top of the message. Takes priority over
    /// the references, which are then discarded.
    pub prepended_code: Option<CodeContextContent>,
    /// Overrides the generated id of the outgoing user message.
    pub message_id: Option<String>,
}

impl OutgoingTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    fn prepended(&self) -> Option<&CodeContextContent> {
        self.prepended_code
            .as_ref()
            .filter(|code| !code.selected_text.trim().is_empty())
    }

    fn valid_references(&self) -> impl Iterator<Item = &CodeContextContent> {
        self.code_references
            .iter()
            .filter(|reference| !reference.selected_text.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
            && self.prepended().is_none()
            && self.valid_references().next().is_none()
    }
}

#[derive(Clone)]
pub struct ChatProcessor {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: SessionManager,
    busy: AtomicBool,
    should_stop: AtomicBool,
    cancel: StdMutex<Option<CancellationToken>>,
    events: broadcast::Sender<ChatEvent>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ChatProcessor {
    pub fn new(sessions: SessionManager) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                sessions,
                busy: AtomicBool::new(false),
                should_stop: AtomicBool::new(false),
                cancel: StdMutex::new(None),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.events.subscribe()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Aborts the in-flight turn, if any. The partially-streamed assistant
    /// message is kept and re-stamped so it stays in order.
    pub fn stop_generation(&self) {
        self.inner.should_stop.store(true, Ordering::SeqCst);
        if let Ok(guard) = self.inner.cancel.lock() {
            if let Some(token) = guard.as_ref() {
                token.cancel();
            }
        }
    }

    /// Runs one chat turn. Rejects overlapping turns; an empty turn is a
    /// no-op.
    pub async fn send_message(
        &self,
        client: &ApiClient,
        turn: OutgoingTurn,
    ) -> Result<(), BridgeError> {
        if turn.is_empty() {
            debug!("ignoring empty chat turn");
            return Ok(());
        }
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BridgeError::TurnInProgress);
        }
        let _busy = BusyGuard(&self.inner.busy);
        self.inner.should_stop.store(false, Ordering::SeqCst);

        let sessions = &self.inner.sessions;
        if sessions.active_session_id().await.is_none() {
            let cwd = std::env::current_dir()
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_default();
            sessions.create_session(&cwd, "").await;
        }

        let formatted = format_outgoing(&turn);
        let message_id = turn
            .message_id
            .clone()
            .unwrap_or_else(|| format!("user-{}", chrono::Utc::now().timestamp_millis()));
        let user_message = Message::user(message_id, vec![ContentPart::text(formatted)]);
        // Appended before the request so the turn is visible even if the
        // network fails.
        sessions.append_message(user_message).await;

        let (history, session_id, working_dir) = {
            let active = sessions.active_session().await;
            match active {
                Some(session) => {
                    let dir = if session.metadata.working_dir.is_empty() {
                        None
                    } else {
                        Some(std::path::PathBuf::from(&session.metadata.working_dir))
                    };
                    (session.messages, Some(session.session_id), dir)
                }
                None => (Vec::new(), None, None),
            }
        };

        let token = CancellationToken::new();
        if let Ok(mut guard) = self.inner.cancel.lock() {
            *guard = Some(token.clone());
        }

        let result = self
            .run_turn(client, history, session_id, working_dir, token)
            .await;

        if let Ok(mut guard) = self.inner.cancel.lock() {
            *guard = None;
        }

        match result {
            Ok(()) => {
                // The first completed turn makes the server aware of an
                // optimistic session; refreshing clears its local flag.
                sessions.refresh(client).await;
                Ok(())
            }
            Err(err) => {
                // A failed turn surfaces as an error event plus the returned
                // error; no finish event follows.
                self.emit(ChatEvent::Error {
                    report: ErrorReport::from(&err),
                });
                Err(err)
            }
        }
    }

    async fn run_turn(
        &self,
        client: &ApiClient,
        history: Vec<Message>,
        session_id: Option<String>,
        working_dir: Option<std::path::PathBuf>,
        token: CancellationToken,
    ) -> Result<(), BridgeError> {
        let response = client
            .stream_chat_response(ChatRequest {
                messages: &history,
                session_id,
                working_dir,
            })
            .await?;

        let mut body = response.bytes_stream();
        let mut mode: Option<StreamMode> = None;
        let mut accumulator = SseAccumulator::new();
        let mut plaintext = String::new();
        let plaintext_id = format!("assistant-{}", chrono::Utc::now().timestamp_millis());
        let mut last_message: Option<Message> = None;

        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => {
                    return self.finish_interrupted(FinishReason::Aborted).await;
                }
                chunk = body.next() => chunk,
            };
            // Cooperative stop observed between chunks.
            if self.inner.should_stop.load(Ordering::SeqCst) {
                return self.finish_interrupted(FinishReason::Stopped).await;
            }
            let Some(chunk) = chunk else {
                break;
            };
            let bytes = chunk.map_err(|err| BridgeError::stream(err.to_string()))?;
            let text = String::from_utf8_lossy(&bytes);
            if text.is_empty() {
                continue;
            }
            // Latch the stream's shape on the first non-empty chunk.
            let mode = *mode.get_or_insert_with(|| detect_mode(&text));

            match mode {
                StreamMode::EventStream => {
                    for payload in accumulator.push(&text) {
                        match self.handle_frame(&payload, &mut last_message).await {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Finished(reason) => {
                                return self.finish(last_message, reason).await;
                            }
                            FrameOutcome::Failed(message) => {
                                return Err(BridgeError::stream(message));
                            }
                        }
                    }
                }
                StreamMode::Plaintext => {
                    plaintext.push_str(&text);
                    let message = Message {
                        id: plaintext_id.clone(),
                        role: Role::Assistant,
                        created: chrono::Utc::now().timestamp(),
                        content: vec![ContentPart::text(plaintext.clone())],
                    };
                    last_message = Some(message.clone());
                    self.inner.sessions.upsert_message(message.clone()).await;
                    self.emit(ChatEvent::MessageReceived { message });
                }
            }
        }

        // Stream ended without an explicit Finish frame.
        if mode == Some(StreamMode::EventStream) {
            if let Some(payload) = accumulator.finish() {
                match self.handle_frame(&payload, &mut last_message).await {
                    FrameOutcome::Continue => {}
                    FrameOutcome::Finished(reason) => {
                        return self.finish(last_message, reason).await;
                    }
                    FrameOutcome::Failed(message) => {
                        return Err(BridgeError::stream(message));
                    }
                }
            }
        }
        self.finish(last_message, FinishReason::Complete).await
    }

    async fn handle_frame(
        &self,
        payload: &str,
        last_message: &mut Option<Message>,
    ) -> FrameOutcome {
        let frame = match parse_frame(payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "skipping malformed stream frame");
                return FrameOutcome::Continue;
            }
        };
        match frame {
            StreamFrame::Message(mut message) => {
                // Local re-stamp keeps ordering immune to server clock skew.
                message.created = chrono::Utc::now().timestamp();
                *last_message = Some(message.clone());
                self.inner.sessions.upsert_message(message.clone()).await;
                self.emit(ChatEvent::MessageReceived { message });
                FrameOutcome::Continue
            }
            StreamFrame::Finish { message, reason } => {
                if let Some(mut message) = message {
                    message.created = chrono::Utc::now().timestamp();
                    *last_message = Some(message.clone());
                    self.inner.sessions.upsert_message(message).await;
                }
                debug!(reason = ?reason, "stream finished");
                FrameOutcome::Finished(FinishReason::from_wire(reason.as_deref()))
            }
            StreamFrame::Error { message } => FrameOutcome::Failed(message),
            StreamFrame::Done => FrameOutcome::Continue,
        }
    }

    async fn finish(
        &self,
        message: Option<Message>,
        reason: FinishReason,
    ) -> Result<(), BridgeError> {
        self.emit(ChatEvent::Finish { message, reason });
        Ok(())
    }

    async fn finish_interrupted(&self, reason: FinishReason) -> Result<(), BridgeError> {
        // Keep the partial assistant message but re-stamp it so it stays in
        // chronological order; the interruption event itself carries no
        // message.
        self.inner.sessions.restamp_last_assistant().await;
        self.emit(ChatEvent::Finish {
            message: None,
            reason,
        });
        Ok(())
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.inner.events.send(event);
    }
}

enum FrameOutcome {
    Continue,
    Finished(FinishReason),
    Failed(String),
}

/// Flattens a turn into the text the server stores. Prepended code becomes a
/// leading fenced block with its origin commented on the first line, and the
/// references are dropped; otherwise each reference with a selection becomes
/// a one-line summary above the prompt.
pub fn format_outgoing(turn: &OutgoingTurn) -> String {
    let mut out = String::new();
    if let Some(code) = turn.prepended() {
        out.push_str(&format!("```{}\n", code.language_id));
        if !code.file_path.is_empty() {
            out.push_str(&format!(
                "// {}:{}-{}\n",
                code.file_path, code.start_line, code.end_line
            ));
        }
        out.push_str(&format!("{}\n```\n\n", code.selected_text));
    } else {
        for reference in turn.valid_references() {
            out.push_str(&format!(
                "From `{}`:{}-{}\n",
                reference.file_path, reference.start_line, reference.end_line
            ));
        }
    }
    out.push_str(turn.text.trim_end());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rehydrate::rehydrate_text;

    fn context(selected: &str) -> CodeContextContent {
        CodeContextContent {
            id: "ctx".to_string(),
            file_path: "src/lib.rs".to_string(),
            file_name: "lib.rs".to_string(),
            language_id: "rust".to_string(),
            start_line: 3,
            end_line: 7,
            selected_text: selected.to_string(),
        }
    }

    #[test]
    fn prepended_code_becomes_a_leading_fenced_block() {
        let turn = OutgoingTurn {
            text: "what does this do?".to_string(),
            code_references: vec![context("ignored selection")],
            prepended_code: Some(context("fn f() {}")),
            message_id: None,
        };
        let formatted = format_outgoing(&turn);
        assert_eq!(
            formatted,
            "```rust\n// src/lib.rs:3-7\nfn f() {}\n```\n\nwhat does this do?"
        );
        // Prepended code wins; the reference contributes nothing.
        assert!(!formatted.contains("From `"));
    }

    #[test]
    fn references_with_a_selection_become_summary_lines() {
        let turn = OutgoingTurn {
            text: "see above".to_string(),
            code_references: vec![context("fn f() {}"), context("  \n")],
            prepended_code: None,
            message_id: None,
        };
        // The blank selection is skipped.
        assert_eq!(format_outgoing(&turn), "From `src/lib.rs`:3-7\nsee above");
    }

    #[test]
    fn formatted_blocks_survive_a_history_round_trip() {
        let turn = OutgoingTurn {
            text: "explain".to_string(),
            code_references: Vec::new(),
            prepended_code: Some(context("let x = 1;")),
            message_id: None,
        };
        let parts = rehydrate_text(&format_outgoing(&turn));
        assert_eq!(parts.len(), 2);
        match &parts[0] {
            ContentPart::CodeContext(ctx) => {
                assert_eq!(ctx.file_path, "src/lib.rs");
                assert_eq!(ctx.start_line, 3);
                assert_eq!(ctx.end_line, 7);
                assert_eq!(ctx.selected_text, "let x = 1;");
            }
            other => panic!("expected code context, got {other:?}"),
        }
        assert_eq!(parts[1].as_text(), Some("explain"));
    }

    #[test]
    fn empty_turns_are_detected() {
        assert!(OutgoingTurn::text("   \n").is_empty());
        assert!(!OutgoingTurn::text("hi").is_empty());
        let blank_reference = OutgoingTurn {
            code_references: vec![context("  ")],
            ..OutgoingTurn::default()
        };
        assert!(blank_reference.is_empty());
        let with_reference = OutgoingTurn {
            code_references: vec![context("x")],
            ..OutgoingTurn::default()
        };
        assert!(!with_reference.is_empty());
        let with_code = OutgoingTurn {
            prepended_code: Some(context("x")),
            ..OutgoingTurn::default()
        };
        assert!(!with_code.is_empty());
    }
}
