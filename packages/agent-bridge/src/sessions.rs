//! Session catalog and active-conversation state.
//!
//! The server owns session history; this layer keeps a local catalog that can
//! run ahead of it. Creating a session is optimistic: the entry exists only
//! locally (`is_local`) until the first completed chat turn makes the server
//! aware of it, at which point the server's copy of the entry wins. At most
//! one optimistic session exists at a time.

use std::sync::Arc;

use agent_bridge_client::types::{Message, Role, Session, SessionMetadata};
use agent_bridge_client::ApiClient;
use agent_bridge_error::BridgeError;
use chrono::Local;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::events::SessionEvent;
use crate::rehydrate::rehydrate_message;

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Default)]
struct State {
    catalog: Vec<SessionMetadata>,
    active: Option<Session>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub async fn sessions(&self) -> Vec<SessionMetadata> {
        self.inner.state.lock().await.catalog.clone()
    }

    pub async fn active_session(&self) -> Option<Session> {
        self.inner.state.lock().await.active.clone()
    }

    pub async fn active_session_id(&self) -> Option<String> {
        let state = self.inner.state.lock().await;
        state.active.as_ref().map(|s| s.session_id.clone())
    }

    /// Creates a new optimistic session and makes it active. Any previous
    /// optimistic entry is discarded; the server never sees either until a
    /// chat turn completes.
    pub async fn create_session(&self, working_dir: &str, description: &str) -> SessionMetadata {
        let id = Local::now().format("%Y%m%d%H%M%S").to_string();
        let mut entry = SessionMetadata {
            id: id.clone(),
            path: String::new(),
            modified: Local::now().to_rfc3339(),
            metadata: Default::default(),
            is_local: true,
        };
        entry.metadata.working_dir = working_dir.to_string();
        entry.metadata.description = description.to_string();
        entry.metadata.title = display_title(&entry);

        let catalog = {
            let mut state = self.inner.state.lock().await;
            state.catalog.retain(|existing| !existing.is_local);
            state.catalog.insert(0, entry.clone());
            state.active = Some(Session {
                session_id: id.clone(),
                metadata: entry.metadata.clone(),
                messages: Vec::new(),
            });
            state.catalog.clone()
        };
        let _ = self.inner.events.send(SessionEvent::Created {
            session: entry.clone(),
        });
        // The new session is active immediately, so consumers also see it
        // loaded and the catalog updated.
        let _ = self
            .inner
            .events
            .send(SessionEvent::Loaded { session_id: id });
        let _ = self
            .inner
            .events
            .send(SessionEvent::CatalogChanged { sessions: catalog });
        entry
    }

    /// Refreshes the catalog from the server and reconciles it with local
    /// state: the server list is authoritative for every session it knows,
    /// and a still-unsynced optimistic session is prepended.
    pub async fn refresh(&self, client: &ApiClient) -> Vec<SessionMetadata> {
        let server_sessions = client.list_sessions().await;
        let merged = {
            let mut state = self.inner.state.lock().await;
            let local = state
                .catalog
                .iter()
                .filter(|entry| entry.is_local)
                .cloned()
                .collect::<Vec<_>>();
            let merged = reconcile(server_sessions, local);
            state.catalog = merged.clone();
            merged
        };
        let _ = self.inner.events.send(SessionEvent::CatalogChanged {
            sessions: merged.clone(),
        });
        merged
    }

    /// Loads a session's history from the server and makes it active. The
    /// optimistic session never exists server-side, so loading it is a local
    /// no-op.
    pub async fn load_session(
        &self,
        client: &ApiClient,
        session_id: &str,
    ) -> Result<Session, BridgeError> {
        {
            let state = self.inner.state.lock().await;
            if let Some(active) = &state.active {
                if active.session_id == session_id {
                    return Ok(active.clone());
                }
            }
            let local = state
                .catalog
                .iter()
                .any(|entry| entry.id == session_id && entry.is_local);
            if local {
                debug!(session_id = session_id, "loading unsynced local session");
                let session = Session {
                    session_id: session_id.to_string(),
                    metadata: Default::default(),
                    messages: Vec::new(),
                };
                drop(state);
                return Ok(self.activate(session).await);
            }
        }

        let history = client
            .get_session_history(session_id)
            .await
            .map_err(|err| match err {
                BridgeError::Http { status: 404, .. } => BridgeError::SessionNotFound {
                    session_id: session_id.to_string(),
                },
                other => other,
            });
        let mut session = match history {
            Ok(session) => session,
            Err(err) => {
                let _ = self.inner.events.send(SessionEvent::Error {
                    report: (&err).into(),
                });
                return Err(err);
            }
        };
        if session.metadata.title.is_empty() {
            session.metadata.title = session.metadata.description.clone();
        }
        for message in &mut session.messages {
            if message.role == Role::User {
                rehydrate_message(message);
            }
        }
        Ok(self.activate(session).await)
    }

    pub async fn switch_session(
        &self,
        client: &ApiClient,
        session_id: &str,
    ) -> Result<Session, BridgeError> {
        let session = self.load_session(client, session_id).await?;
        self.refresh(client).await;
        let _ = self.inner.events.send(SessionEvent::Switched {
            session_id: session_id.to_string(),
        });
        Ok(session)
    }

    pub async fn rename_session(&self, client: &ApiClient, session_id: &str, title: &str) -> bool {
        if !client.rename_session(session_id, title).await {
            return false;
        }
        let sessions = {
            let mut state = self.inner.state.lock().await;
            if let Some(entry) = state.catalog.iter_mut().find(|e| e.id == session_id) {
                entry.metadata.title = title.to_string();
            }
            state.catalog.clone()
        };
        let _ = self
            .inner
            .events
            .send(SessionEvent::CatalogChanged { sessions });
        true
    }

    pub async fn delete_session(&self, client: &ApiClient, session_id: &str) -> bool {
        let is_local = {
            let state = self.inner.state.lock().await;
            state
                .catalog
                .iter()
                .any(|entry| entry.id == session_id && entry.is_local)
        };
        // Unsynced sessions are deleted locally; the server never had them.
        if !is_local && !client.delete_session(session_id).await {
            return false;
        }
        let sessions = {
            let mut state = self.inner.state.lock().await;
            state.catalog.retain(|entry| entry.id != session_id);
            if state
                .active
                .as_ref()
                .map(|active| active.session_id == session_id)
                .unwrap_or(false)
            {
                state.active = None;
            }
            state.catalog.clone()
        };
        let _ = self
            .inner
            .events
            .send(SessionEvent::CatalogChanged { sessions });
        true
    }

    /// Appends a message to the active conversation.
    pub async fn append_message(&self, message: Message) {
        let mut state = self.inner.state.lock().await;
        if let Some(active) = &mut state.active {
            active.messages.push(message);
        }
    }

    /// Replaces the message with the same id, or appends it. Stream frames
    /// carry full message state, so last-wins replacement is correct.
    pub async fn upsert_message(&self, message: Message) {
        let mut state = self.inner.state.lock().await;
        let Some(active) = &mut state.active else {
            return;
        };
        match active.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => active.messages.push(message),
        }
    }

    /// Re-stamps the newest assistant message with the current time. Used
    /// when a turn is aborted so a partially-streamed message keeps its place
    /// in chronological order.
    pub async fn restamp_last_assistant(&self) -> Option<Message> {
        let mut state = self.inner.state.lock().await;
        let active = state.active.as_mut()?;
        let message = active
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.role == Role::Assistant)?;
        message.created = chrono::Utc::now().timestamp();
        Some(message.clone())
    }

    async fn activate(&self, session: Session) -> Session {
        let session_id = session.session_id.clone();
        {
            let mut state = self.inner.state.lock().await;
            state.active = Some(session.clone());
        }
        let _ = self.inner.events.send(SessionEvent::Loaded { session_id });
        session
    }
}

/// Merges the server's session list with locally-optimistic entries. Server
/// entries win for any id both sides know; duplicates within the server list
/// itself resolve to the last occurrence.
fn reconcile(
    server_sessions: Vec<SessionMetadata>,
    local: Vec<SessionMetadata>,
) -> Vec<SessionMetadata> {
    let mut merged: Vec<SessionMetadata> = Vec::with_capacity(server_sessions.len() + local.len());
    for mut entry in server_sessions {
        if entry.metadata.title.is_empty() {
            entry.metadata.title = display_title(&entry);
        }
        match merged.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry,
            None => merged.push(entry),
        }
    }
    for entry in local {
        // Synced: the server copy is already in the list and wins.
        if merged.iter().any(|existing| existing.id == entry.id) {
            continue;
        }
        merged.insert(0, entry);
    }
    merged
}

/// Title shown for a catalog entry: explicit title, else the description,
/// else a placeholder derived from the id.
pub fn display_title(entry: &SessionMetadata) -> String {
    if !entry.metadata.title.is_empty() {
        return entry.metadata.title.clone();
    }
    if !entry.metadata.description.is_empty() {
        return entry.metadata.description.clone();
    }
    let prefix: String = entry.id.chars().take(8).collect();
    format!("Session {prefix}")
}
