//! Wire types shared between the API client and the chat/session layers.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    pub data: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Structured fragment carrying a file path, language, line range, and
/// source text, attachable to a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeContextContent {
    pub file_path: String,
    pub file_name: String,
    pub language_id: String,
    pub start_line: u32,
    pub end_line: u32,
    pub selected_text: String,
    pub id: String,
}

/// One content fragment of a [`Message`]. Tool-call and tool-result parts
/// produced by the agent are carried opaquely and round-tripped untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(TextContent),
    Image(ImageContent),
    CodeContext(CodeContextContent),
    Opaque(Value),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextContent { text: text.into() })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(part) => Some(&part.text),
            _ => None,
        }
    }
}

impl Serialize for ContentPart {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = match self {
            Self::Text(part) => {
                let mut value = serde_json::to_value(part).map_err(serde::ser::Error::custom)?;
                value["type"] = json!("text");
                value
            }
            Self::Image(part) => {
                let mut value = serde_json::to_value(part).map_err(serde::ser::Error::custom)?;
                value["type"] = json!("image");
                value
            }
            Self::CodeContext(part) => {
                let mut value = serde_json::to_value(part).map_err(serde::ser::Error::custom)?;
                value["type"] = json!("code_context");
                value
            }
            Self::Opaque(value) => value.clone(),
        };
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContentPart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value.get("type").and_then(Value::as_str) {
            Some("text") => serde_json::from_value(value.clone())
                .map(ContentPart::Text)
                .map_err(D::Error::custom),
            Some("image") => serde_json::from_value(value.clone())
                .map(ContentPart::Image)
                .map_err(D::Error::custom),
            Some("code_context") => serde_json::from_value(value.clone())
                .map(ContentPart::CodeContext)
                .map_err(D::Error::custom),
            _ => Ok(ContentPart::Opaque(value)),
        }
    }
}

/// One conversational message. `created` is a unix timestamp in seconds and
/// is re-stamped locally on every incremental stream revision so clock skew
/// between client and server never renders messages out of order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub created: i64,
    pub content: Vec<ContentPart>,
}

impl Message {
    pub fn user(id: impl Into<String>, content: Vec<ContentPart>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            created: chrono::Utc::now().timestamp(),
            content,
        }
    }

    /// Concatenated text of all plain-text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Catalog-level description shared by the full session and its summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub metadata: SessionDescription,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Catalog entry. `is_local` marks a locally-optimistic session the server
/// has not yet confirmed; it is never sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub modified: String,
    #[serde(default)]
    pub metadata: SessionDescription,
    #[serde(default, rename = "isLocal")]
    pub is_local: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentVersions {
    #[serde(default)]
    pub available_versions: Vec<String>,
    #[serde(default)]
    pub default_version: String,
}
