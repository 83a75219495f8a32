//! Secret-authenticated HTTP client for the local agent server.
//!
//! Every request carries the per-launch `X-Secret-Key` header; everything
//! written to the log sink first goes through [`redact::Redactor`], and body
//! logging is additionally gated by a settings flag independent of log level.

pub mod redact;
pub mod types;

use std::path::PathBuf;

use agent_bridge_error::BridgeError;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, Response};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::redact::Redactor;
use crate::types::{AgentVersions, Message, Session, SessionMetadata};

/// Parameters for [`ApiClient::stream_chat_response`].
#[derive(Debug)]
pub struct ChatRequest<'a> {
    /// Full running history of the conversation; the server is stateless per
    /// request and receives every turn so far.
    pub messages: &'a [Message],
    pub session_id: Option<String>,
    /// Defaults to the process's current directory when absent.
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    secret_key: String,
    http: Client,
    redactor: Redactor,
    log_sensitive_bodies: bool,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        secret_key_names: Vec<String>,
        log_sensitive_bodies: bool,
    ) -> Self {
        let secret_key = secret_key.into();
        Self {
            base_url: base_url.into(),
            redactor: Redactor::new(secret_key.clone(), secret_key_names),
            secret_key,
            http: Client::new(),
            log_sensitive_bodies,
        }
    }

    /// Builds a client whose redaction key list and body-logging gate come
    /// from the user's settings.
    pub fn with_settings(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        settings: &agent_bridge_settings::BridgeSettings,
    ) -> Self {
        Self::new(
            base_url,
            secret_key,
            settings.secret_key_names.clone(),
            settings.log_sensitive_bodies,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    fn auth_headers(&self, accept_event_stream: bool) -> Result<HeaderMap, BridgeError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let secret = HeaderValue::from_str(&self.secret_key)
            .map_err(|err| BridgeError::stream(format!("invalid secret key header: {err}")))?;
        headers.insert(redact::SECRET_HEADER, secret);
        if accept_event_stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        Ok(headers)
    }

    /// Sends one request, logging method/path/redacted headers always and the
    /// redacted body only when sensitive logging is enabled. Non-2xx responses
    /// become [`BridgeError::Http`] carrying the (best-effort) body text.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        accept_event_stream: bool,
    ) -> Result<Response, BridgeError> {
        let url = format!("{}{path}", self.base_url);
        let headers = self.auth_headers(accept_event_stream)?;
        debug!(
            method = %method,
            path = path,
            headers = ?self.redactor.headers(&headers),
            "agent api request"
        );
        if let (Some(body), true) = (body, self.log_sensitive_bodies) {
            debug!(path = path, body = %self.redactor.json(body), "agent api request body");
        }

        let mut builder = self.http.request(method.clone(), &url).headers(headers);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(|err| {
            error!(method = %method, path = path, error = %err, "agent api request failed");
            err
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            if self.log_sensitive_bodies {
                error!(
                    path = path,
                    status = status.as_u16(),
                    body = %self.redactor.text(&body_text),
                    "agent api error response"
                );
            } else {
                error!(path = path, status = status.as_u16(), "agent api error response");
            }
            return Err(BridgeError::Http {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("unknown").to_string(),
                body: body_text,
            });
        }
        Ok(response)
    }

    /// Lists the server's sessions. Degrades to an empty list on any failure;
    /// callers treat "no sessions" and "listing failed" identically.
    pub async fn list_sessions(&self) -> Vec<SessionMetadata> {
        let response = match self.request(Method::GET, "/sessions", None, false).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "failed to list sessions");
                return Vec::new();
            }
        };
        let value: Value = match response.json().await {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "failed to parse session list");
                return Vec::new();
            }
        };
        let entries = value
            .as_array()
            .cloned()
            .or_else(|| value.get("sessions").and_then(Value::as_array).cloned())
            .unwrap_or_default();
        match serde_json::from_value(Value::Array(entries)) {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(error = %err, "failed to decode session list entries");
                Vec::new()
            }
        }
    }

    pub async fn get_session_history(&self, session_id: &str) -> Result<Session, BridgeError> {
        let response = self
            .request(Method::GET, &format!("/sessions/{session_id}"), None, false)
            .await?;
        Ok(response.json().await?)
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> bool {
        let body = json!({ "title": title });
        match self
            .request(
                Method::POST,
                &format!("/sessions/{session_id}/rename"),
                Some(&body),
                false,
            )
            .await
        {
            Ok(_) => true,
            Err(err) => {
                warn!(session_id = session_id, error = %err, "failed to rename session");
                false
            }
        }
    }

    pub async fn delete_session(&self, session_id: &str) -> bool {
        match self
            .request(
                Method::DELETE,
                &format!("/sessions/{session_id}"),
                None,
                false,
            )
            .await
        {
            Ok(_) => true,
            Err(err) => {
                warn!(session_id = session_id, error = %err, "failed to delete session");
                false
            }
        }
    }

    /// Load-bearing for startup configuration; failures propagate.
    pub async fn get_agent_versions(&self) -> Result<AgentVersions, BridgeError> {
        let response = self
            .request(Method::GET, "/agent/versions", None, false)
            .await?;
        Ok(response.json().await?)
    }

    /// Creates (or reconfigures) the agent. A zero-length success body counts
    /// as success without requiring a JSON parse.
    pub async fn create_agent(
        &self,
        provider: &str,
        model: Option<&str>,
        version: Option<&str>,
    ) -> Result<Value, BridgeError> {
        let mut body = json!({ "provider": provider });
        if let Some(model) = model {
            body["model"] = json!(model);
        }
        if let Some(version) = version {
            body["version"] = json!(version);
        }
        let response = self
            .request(Method::POST, "/agent/update_provider", Some(&body), false)
            .await?;
        let text = response.text().await.unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        match serde_json::from_str(&text) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(error = %err, "create_agent returned non-json success body");
                Ok(Value::Null)
            }
        }
    }

    /// Sets the agent's system prompt. A blank prompt skips the network call
    /// entirely and returns `None` so an empty override is never sent.
    pub async fn set_agent_prompt(&self, prompt: &str) -> Result<Option<Value>, BridgeError> {
        let trimmed = prompt.trim();
        if trimmed.is_empty() {
            debug!("skipping empty system prompt");
            return Ok(None);
        }
        let body = json!({ "extension": trimmed });
        let response = self
            .request(Method::POST, "/agent/prompt", Some(&body), false)
            .await?;
        Ok(Some(response.json().await.unwrap_or(Value::Null)))
    }

    pub async fn add_extension(&self, name: &str) -> Result<Value, BridgeError> {
        let body = json!({ "type": "builtin", "name": name });
        let response = self
            .request(Method::POST, "/extensions/add", Some(&body), false)
            .await?;
        Ok(response.json().await.unwrap_or(Value::Null))
    }

    /// Issues a streaming chat turn and hands the raw response back; the
    /// caller owns reading the body.
    pub async fn stream_chat_response(
        &self,
        request: ChatRequest<'_>,
    ) -> Result<Response, BridgeError> {
        let working_dir = request
            .working_dir
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let mut body = json!({
            "messages": request.messages,
            "session_working_dir": working_dir.to_string_lossy(),
        });
        if let Some(session_id) = &request.session_id {
            body["session_id"] = json!(session_id);
        }
        self.request(Method::POST, "/reply", Some(&body), true)
            .await
    }
}
