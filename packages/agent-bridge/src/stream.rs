//! Chat response stream parsing.
//!
//! The agent server usually answers `/reply` with an SSE body whose `data:`
//! payloads are JSON frames tagged `Message`, `Finish`, or `Error`. A
//! `Message` frame carries the assistant message's full state so far, not a
//! delta; a later frame for the same message id replaces the earlier one.
//! Some agent builds answer with plain text instead, so the stream's shape is
//! detected once per turn from the first non-empty chunk and latched.

use agent_bridge_client::types::{ContentPart, Message, Role};
use agent_bridge_error::BridgeError;
use serde_json::Value;

/// Reassembles SSE `data:` payloads from arbitrarily-split body chunks.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one body chunk and returns every complete event payload it
    /// finished.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        events
    }

    /// Flushes a final event that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        if let Some(data) = self.buffer.trim_end_matches('\r').strip_prefix("data:") {
            self.data_lines.push(data.trim_start().to_string());
        }
        self.buffer.clear();
        if self.data_lines.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data_lines).join("\n"))
        }
    }
}

/// Latched once per turn from the first non-empty chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    EventStream,
    Plaintext,
}

pub fn detect_mode(first_chunk: &str) -> StreamMode {
    let head = first_chunk.trim_start();
    if head.starts_with("data:") || head.starts_with("event:") {
        StreamMode::EventStream
    } else {
        StreamMode::Plaintext
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Full assistant message state so far; replaces any previous state for
    /// the same id.
    Message(Message),
    Finish {
        message: Option<Message>,
        reason: Option<String>,
    },
    Error {
        message: String,
    },
    /// `[DONE]` sentinel, tolerated and skipped.
    Done,
}

pub fn parse_frame(data: &str) -> Result<StreamFrame, BridgeError> {
    let trimmed = data.trim();
    if trimmed == "[DONE]" {
        return Ok(StreamFrame::Done);
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|err| BridgeError::stream(format!("invalid stream frame: {err}")))?;

    match value.get("type").and_then(Value::as_str) {
        Some("Message") => Ok(StreamFrame::Message(decode_message(&value))),
        Some("Finish") => Ok(StreamFrame::Finish {
            message: value
                .get("message")
                .filter(|message| !message.is_null())
                .map(|_| decode_message(&value)),
            reason: value
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        Some("Error") => Ok(StreamFrame::Error {
            message: frame_error_text(&value),
        }),
        other => Err(BridgeError::stream(format!(
            "unknown stream frame type: {other:?}"
        ))),
    }
}

/// Decodes the frame's `message` field, degrading to a synthesized assistant
/// message when the payload does not match the expected shape.
fn decode_message(frame: &Value) -> Message {
    let payload = frame.get("message").cloned().unwrap_or(Value::Null);
    if let Ok(message) = serde_json::from_value::<Message>(payload.clone()) {
        return message;
    }
    let id = payload
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("streaming")
        .to_string();
    let text = extract_text(&payload)
        .unwrap_or_else(|| serde_json::to_string_pretty(frame).unwrap_or_default());
    Message {
        id,
        role: Role::Assistant,
        created: chrono::Utc::now().timestamp(),
        content: vec![ContentPart::text(text)],
    }
}

/// Best-effort text extraction from an unrecognized message payload.
fn extract_text(payload: &Value) -> Option<String> {
    if let Some(text) = payload
        .get("content")
        .and_then(Value::as_array)
        .and_then(|parts| parts.first())
        .and_then(|part| part.get("text"))
        .and_then(Value::as_str)
    {
        return Some(text.to_string());
    }
    if let Some(text) = payload.as_str() {
        return Some(text.to_string());
    }
    None
}

fn frame_error_text(frame: &Value) -> String {
    frame
        .get("error")
        .and_then(Value::as_str)
        .or_else(|| frame.get("message").and_then(Value::as_str))
        .unwrap_or("agent stream reported an error")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_reassembles_events_split_across_chunks() {
        let mut acc = SseAccumulator::new();
        assert!(acc.push("data: {\"a\":").is_empty());
        assert!(acc.push("1}\n").is_empty());
        let events = acc.push("\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn accumulator_flushes_trailing_event_without_blank_line() {
        let mut acc = SseAccumulator::new();
        assert!(acc.push("data: tail").is_empty());
        assert_eq!(acc.finish().as_deref(), Some("tail"));
        assert_eq!(acc.finish(), None);
    }

    #[test]
    fn done_sentinel_is_tolerated() {
        assert_eq!(parse_frame("[DONE]").unwrap(), StreamFrame::Done);
    }

    #[test]
    fn message_frames_decode_the_full_message_state() {
        let frame = parse_frame(
            r#"{"type":"Message","message":{"id":"m1","role":"assistant","created":5,"content":[{"type":"text","text":"hi"}]}}"#,
        )
        .unwrap();
        match frame {
            StreamFrame::Message(message) => {
                assert_eq!(message.id, "m1");
                assert_eq!(message.text(), "hi");
            }
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    #[test]
    fn malformed_message_payloads_degrade_to_extracted_text() {
        let frame = parse_frame(
            r#"{"type":"Message","message":{"id":"m2","content":[{"text":"partial"}]}}"#,
        )
        .unwrap();
        match frame {
            StreamFrame::Message(message) => {
                assert_eq!(message.id, "m2");
                assert_eq!(message.text(), "partial");
                assert_eq!(message.role, Role::Assistant);
            }
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    #[test]
    fn error_frames_surface_their_text() {
        let frame = parse_frame(r#"{"type":"Error","error":"model overloaded"}"#).unwrap();
        assert_eq!(
            frame,
            StreamFrame::Error {
                message: "model overloaded".to_string()
            }
        );
    }

    #[test]
    fn detection_distinguishes_sse_from_plaintext() {
        assert_eq!(detect_mode("data: {}\n\n"), StreamMode::EventStream);
        assert_eq!(detect_mode("  \ndata: {}"), StreamMode::EventStream);
        assert_eq!(detect_mode("plain answer"), StreamMode::Plaintext);
    }
}
