//! Recovers structured code-context parts from user-message text loaded out
//! of server history.
//!
//! Outgoing messages serialize prepended code as a leading fenced block whose
//! first line comments the origin:
//!
//! ````text
//! ```rust
//! // src/lib.rs:10-20
//! fn body() {}
//! ```
//!
//! remaining prompt text
//! ````
//!
//! The server stores only the flattened text; on load this module parses the
//! blocks back into [`CodeContextContent`] parts. Text that does not match
//! the shape is kept verbatim.

use agent_bridge_client::types::{CodeContextContent, ContentPart, Message};
use regex::Regex;
use std::sync::OnceLock;

fn block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?s)^```(?P<lang>[A-Za-z0-9_+#.-]*)\n// (?P<path>[^:\n]+):(?P<start>\d+)-(?P<end>\d+)\n(?P<code>.*?)\n```\n?",
        )
        .expect("static pattern compiles")
    })
}

/// Splits one flattened text into content parts, pulling leading code-context
/// blocks out into structured form.
pub fn rehydrate_text(text: &str) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    let mut rest = text;
    while let Some(captures) = block_pattern().captures(rest) {
        let matched_len = captures
            .get(0)
            .map(|whole| whole.end())
            .unwrap_or(rest.len());
        let (Some(path), Some(start), Some(end), Some(code)) = (
            captures.name("path"),
            captures.name("start"),
            captures.name("end"),
            captures.name("code"),
        ) else {
            break;
        };
        let (Ok(start_line), Ok(end_line)) =
            (start.as_str().parse::<u32>(), end.as_str().parse::<u32>())
        else {
            break;
        };
        let file_path = path.as_str().to_string();
        let file_name = file_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(file_path.as_str())
            .to_string();
        parts.push(ContentPart::CodeContext(CodeContextContent {
            id: format!("{file_name}-{start_line}-{end_line}"),
            file_path,
            file_name,
            language_id: captures
                .name("lang")
                .map(|lang| lang.as_str().to_string())
                .unwrap_or_default(),
            start_line,
            end_line,
            selected_text: code.as_str().to_string(),
        }));
        rest = rest[matched_len..].strip_prefix('\n').unwrap_or(&rest[matched_len..]);
    }
    let remainder = rest.trim_start_matches('\n');
    if parts.is_empty() {
        // Nothing matched; keep the original text untouched.
        parts.push(ContentPart::text(text));
    } else if !remainder.is_empty() {
        parts.push(ContentPart::text(remainder));
    }
    parts
}

/// Rehydrates all plain-text parts of a loaded message in place.
pub fn rehydrate_message(message: &mut Message) {
    let mut content = Vec::with_capacity(message.content.len());
    for part in message.content.drain(..) {
        match part {
            ContentPart::Text(text) => content.extend(rehydrate_text(&text.text)),
            other => content.push(other),
        }
    }
    message.content = content;
}
