//! Scrubs the launch secret and provider credentials out of anything headed
//! for the log sink.

use std::collections::BTreeMap;

use regex::Regex;
use reqwest::header::HeaderMap;
use serde_json::Value;

pub const REDACTED: &str = "[redacted]";
pub const SECRET_HEADER: &str = "x-secret-key";

#[derive(Debug, Clone)]
pub struct Redactor {
    secret: String,
    key_names: Vec<String>,
    key_pattern: Option<Regex>,
}

impl Redactor {
    pub fn new(secret: impl Into<String>, key_names: Vec<String>) -> Self {
        let key_pattern = build_key_pattern(&key_names);
        Self {
            secret: secret.into(),
            key_names,
            key_pattern,
        }
    }

    fn is_secret_key_name(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(SECRET_HEADER)
            || self
                .key_names
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(name))
    }

    /// Header map rendered for logging, secret values removed.
    pub fn headers(&self, headers: &HeaderMap) -> BTreeMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                let rendered = if self.is_secret_key_name(name.as_str()) {
                    REDACTED.to_string()
                } else {
                    value.to_str().unwrap_or(REDACTED).to_string()
                };
                (name.as_str().to_string(), rendered)
            })
            .collect()
    }

    /// Structured pass: replaces values of configured secret keys and any
    /// string equal to the launch secret, recursively.
    pub fn json(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, inner)| {
                        if self.is_secret_key_name(key) {
                            (key.clone(), Value::String(REDACTED.to_string()))
                        } else {
                            (key.clone(), self.json(inner))
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|item| self.json(item)).collect()),
            Value::String(text) if !self.secret.is_empty() && text.contains(&self.secret) => {
                Value::String(text.replace(&self.secret, REDACTED))
            }
            other => other.clone(),
        }
    }

    /// Regex pass over stringified payloads; catches secrets that survive
    /// the structured pass (pre-serialized bodies, error texts).
    pub fn text(&self, raw: &str) -> String {
        let mut scrubbed = if self.secret.is_empty() {
            raw.to_string()
        } else {
            raw.replace(&self.secret, REDACTED)
        };
        if let Some(pattern) = &self.key_pattern {
            scrubbed = pattern
                .replace_all(&scrubbed, format!("$key\"{REDACTED}\""))
                .into_owned();
        }
        scrubbed
    }
}

fn build_key_pattern(key_names: &[String]) -> Option<Regex> {
    if key_names.is_empty() {
        return None;
    }
    let alternation = key_names
        .iter()
        .map(|name| regex::escape(name))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(
        r#"(?i)(?P<key>"(?:{alternation})"\s*:\s*)"[^"]*""#
    ))
    .ok()
}
