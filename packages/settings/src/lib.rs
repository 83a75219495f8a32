//! Configuration boundary: provider/model selection and logging policy,
//! loaded from a JSON settings file.

use std::path::{Path, PathBuf};

use agent_bridge_error::BridgeError;
use serde::{Deserialize, Serialize};

/// Provider/model pair read from the settings file. Both fields are required
/// before the agent server may be started; the server manager enforces that.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderSettings {
    pub provider: Option<String>,
    pub model: Option<String>,
}

impl ProviderSettings {
    /// Names of the required keys that are absent, in declaration order.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.provider.as_deref().map_or(true, str::is_empty) {
            missing.push("provider");
        }
        if self.model.as_deref().map_or(true, str::is_empty) {
            missing.push("model");
        }
        missing
    }
}

fn default_secret_key_names() -> Vec<String> {
    [
        "api_key",
        "apiKey",
        "secret_key",
        "secretKey",
        "access_token",
        "authorization",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect()
}

/// Full settings file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default, flatten)]
    pub provider: ProviderSettings,
    /// When false, request/response bodies are never written to the log sink,
    /// regardless of log level. Redaction of secret values applies either way.
    #[serde(default)]
    pub log_sensitive_bodies: bool,
    /// JSON key names whose values are scrubbed from logged payloads, in
    /// addition to the launch secret itself.
    #[serde(default = "default_secret_key_names")]
    pub secret_key_names: Vec<String>,
    /// Initial system prompt sent to the agent after creation. Optional; an
    /// empty prompt is never sent over the wire.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            provider: ProviderSettings::default(),
            log_sensitive_bodies: false,
            secret_key_names: default_secret_key_names(),
            system_prompt: None,
        }
    }
}

impl BridgeSettings {
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            BridgeError::settings(format!("failed to read {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            BridgeError::settings(format!("failed to parse {}: {err}", path.display()))
        })
    }

    /// Loads the settings file if present, otherwise returns defaults. A
    /// malformed file is an error; a missing one is not.
    pub fn load_or_default(path: &Path) -> Result<Self, BridgeError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "settings file absent, using defaults");
            Ok(Self::default())
        }
    }
}

pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agent-bridge")
        .join("settings.json")
}
