//! Process supervisor for the local agent server.
//!
//! Owns exactly one managed server at a time: spawns it on a free port with a
//! freshly generated secret, waits for it to answer on that port, runs the
//! startup configuration sequence, and watches the process for unexpected
//! exits. Status transitions are published on a broadcast channel, and a
//! transition is only published when the status actually changes.

pub mod launch;

use std::sync::Arc;
use std::time::Duration;

use agent_bridge_client::ApiClient;
use agent_bridge_error::BridgeError;
use agent_bridge_settings::BridgeSettings;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::launch::{
    child_is_alive, find_available_port, kill_child, BinaryResolver, CommandLauncher, LaunchSpec,
    PathResolver, ProcessLauncher, SharedChild,
};

const SECRET_KEY_LEN: usize = 32;
const MONITOR_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Error { message: String },
    Stopping,
}

#[derive(Debug, Clone)]
pub struct ServerManagerConfig {
    pub binary_name: String,
    pub health_attempts: usize,
    pub health_delay: Duration,
}

impl Default for ServerManagerConfig {
    fn default() -> Self {
        Self {
            binary_name: "agent-server".to_string(),
            health_attempts: 40,
            health_delay: Duration::from_millis(150),
        }
    }
}

#[derive(Clone)]
pub struct ServerManager {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Mutex<BridgeSettings>,
    config: ServerManagerConfig,
    resolver: Arc<dyn BinaryResolver>,
    launcher: Arc<dyn ProcessLauncher>,
    http: reqwest::Client,
    ensure_lock: Mutex<()>,
    state: Mutex<ManagerState>,
    status_tx: broadcast::Sender<ServerStatus>,
}

struct ManagerState {
    status: ServerStatus,
    server: Option<RunningServer>,
    instance_counter: u64,
}

#[derive(Clone)]
struct RunningServer {
    port: u16,
    base_url: String,
    secret_key: String,
    client: ApiClient,
    pid: Option<u32>,
    child: SharedChild,
    // false when the process is externally managed and cannot be polled
    managed: bool,
    instance_id: u64,
}

impl ServerManager {
    pub fn new(settings: BridgeSettings, config: ServerManagerConfig) -> Self {
        Self::with_parts(
            settings,
            config,
            Arc::new(PathResolver),
            Arc::new(CommandLauncher),
        )
    }

    pub fn with_parts(
        settings: BridgeSettings,
        config: ServerManagerConfig,
        resolver: Arc<dyn BinaryResolver>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(Inner {
                settings: Mutex::new(settings),
                config,
                resolver,
                launcher,
                http: reqwest::Client::new(),
                ensure_lock: Mutex::new(()),
                state: Mutex::new(ManagerState {
                    status: ServerStatus::Stopped,
                    server: None,
                    instance_counter: 0,
                }),
                status_tx,
            }),
        }
    }

    /// Replaces the settings used by the next `start`. The running server, if
    /// any, keeps its current configuration until restarted.
    pub async fn update_settings(&self, settings: BridgeSettings) {
        *self.inner.settings.lock().await = settings;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerStatus> {
        self.inner.status_tx.subscribe()
    }

    pub async fn status(&self) -> ServerStatus {
        self.inner.state.lock().await.status.clone()
    }

    pub async fn port(&self) -> Option<u16> {
        self.inner.state.lock().await.server.as_ref().map(|s| s.port)
    }

    pub async fn base_url(&self) -> Option<String> {
        let state = self.inner.state.lock().await;
        state.server.as_ref().map(|s| s.base_url.clone())
    }

    pub async fn secret_key(&self) -> Option<String> {
        let state = self.inner.state.lock().await;
        state.server.as_ref().map(|s| s.secret_key.clone())
    }

    /// Client bound to the running server's address and secret, or
    /// [`BridgeError::ServerNotReady`] when nothing is running.
    pub async fn api_client(&self) -> Result<ApiClient, BridgeError> {
        let state = self.inner.state.lock().await;
        match (&state.status, state.server.as_ref()) {
            (ServerStatus::Running, Some(server)) => Ok(server.client.clone()),
            _ => Err(BridgeError::ServerNotReady),
        }
    }

    pub async fn is_ready(&self) -> bool {
        let server = {
            let state = self.inner.state.lock().await;
            if state.status != ServerStatus::Running {
                return false;
            }
            state.server.clone()
        };
        match server {
            Some(server) => !server.managed || child_is_alive(&server.child),
            None => false,
        }
    }

    /// Starts the agent server from a stopped state. Already running and
    /// healthy is a no-op; a failed or stopping server is only recovered
    /// through [`ServerManager::restart`].
    pub async fn start(&self) -> Result<(), BridgeError> {
        let _guard = self.inner.ensure_lock.lock().await;

        match self.status().await {
            ServerStatus::Stopped => {}
            ServerStatus::Running | ServerStatus::Starting => {
                if self.running_and_alive().await {
                    return Ok(());
                }
                // Stale status over a dead process; relaunch below.
            }
            ServerStatus::Error { .. } | ServerStatus::Stopping => {
                return Err(BridgeError::ServerNotReady);
            }
        }

        let settings = self.inner.settings.lock().await.clone();
        let missing = settings.provider.missing_keys();
        if !missing.is_empty() {
            // Fail before spawning anything; no secret is minted either.
            let err = BridgeError::MissingConfiguration {
                keys: missing.join(", "),
            };
            self.set_status(ServerStatus::Error {
                message: err.to_string(),
            })
            .await;
            return Err(err);
        }

        self.set_status(ServerStatus::Starting).await;

        // A fresh secret every launch; old secrets never outlive their process.
        let secret_key = generate_secret_key();

        let launched = match self.launch_process(&secret_key).await {
            Ok(launched) => launched,
            Err(err) => {
                self.set_status(ServerStatus::Error {
                    message: err.to_string(),
                })
                .await;
                return Err(err);
            }
        };

        let base_url = format!("http://127.0.0.1:{}", launched.port);
        let client = ApiClient::with_settings(&base_url, &secret_key, &settings);
        let managed = launched
            .child
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);

        let instance_id = {
            let mut state = self.inner.state.lock().await;
            state.instance_counter += 1;
            let instance_id = state.instance_counter;
            state.server = Some(RunningServer {
                port: launched.port,
                base_url: base_url.clone(),
                secret_key: secret_key.clone(),
                client: client.clone(),
                pid: launched.pid,
                child: launched.child.clone(),
                managed,
                instance_id,
            });
            instance_id
        };

        // Watch for exit before talking to the server so a crash during
        // configuration is still observed.
        self.spawn_exit_watcher(instance_id, launched.pid, launched.child.clone());

        if let Err(err) = self.wait_for_ready(&base_url, &secret_key).await {
            self.abort_start(instance_id, &err).await;
            return Err(err);
        }

        if let Err(err) = self.configure_agent(&client, &settings).await {
            self.abort_start(instance_id, &err).await;
            return Err(err);
        }

        info!(base_url = %base_url, "agent server running");
        self.set_status(ServerStatus::Running).await;
        Ok(())
    }

    /// Stops the server if one is running. Safe to call at any time.
    pub async fn stop(&self) {
        let _guard = self.inner.ensure_lock.lock().await;

        let server = {
            let mut state = self.inner.state.lock().await;
            state.server.take()
        };
        let Some(server) = server else {
            self.set_status(ServerStatus::Stopped).await;
            return;
        };

        self.set_status(ServerStatus::Stopping).await;
        let pid = server.pid;
        let child = server.child;
        let _ = tokio::task::spawn_blocking(move || kill_child(pid, &child)).await;
        self.set_status(ServerStatus::Stopped).await;
    }

    pub async fn restart(&self) -> Result<(), BridgeError> {
        self.stop().await;
        self.start().await
    }

    async fn running_and_alive(&self) -> bool {
        let server = {
            let state = self.inner.state.lock().await;
            if state.status != ServerStatus::Running {
                return false;
            }
            state.server.clone()
        };
        let Some(server) = server else {
            return false;
        };
        if !server.managed || child_is_alive(&server.child) {
            return true;
        }
        // Dead process left behind; clear it so start can relaunch.
        let mut state = self.inner.state.lock().await;
        if state
            .server
            .as_ref()
            .map(|s| s.instance_id == server.instance_id)
            .unwrap_or(false)
        {
            state.server = None;
        }
        false
    }

    async fn launch_process(&self, secret_key: &str) -> Result<launch::LaunchedProcess, BridgeError> {
        let binary = self.inner.resolver.resolve(&self.inner.config.binary_name)?;
        let port = find_available_port()?;
        let spec = LaunchSpec {
            binary,
            port,
            secret_key: secret_key.to_string(),
        };
        let launcher = self.inner.launcher.clone();
        tokio::task::spawn_blocking(move || launcher.launch(&spec))
            .await
            .map_err(|err| BridgeError::stream(format!("launch task failed: {err}")))?
    }

    async fn wait_for_ready(&self, base_url: &str, secret_key: &str) -> Result<(), BridgeError> {
        for _ in 0..self.inner.config.health_attempts {
            for endpoint in ["health", "sessions"] {
                let url = format!("{base_url}/{endpoint}");
                let request = self
                    .inner
                    .http
                    .get(&url)
                    .header(agent_bridge_client::redact::SECRET_HEADER, secret_key);
                match request.send().await {
                    Ok(response) if response.status().is_success() => return Ok(()),
                    Ok(_) | Err(_) => {}
                }
            }
            sleep(self.inner.config.health_delay).await;
        }
        Err(BridgeError::ServerNotReady)
    }

    /// Startup configuration: version discovery and agent creation must
    /// succeed; extension registration and the system prompt are best-effort.
    async fn configure_agent(
        &self,
        client: &ApiClient,
        settings: &BridgeSettings,
    ) -> Result<(), BridgeError> {
        let versions = client.get_agent_versions().await?;
        let version = if !versions.default_version.is_empty() {
            Some(versions.default_version.clone())
        } else {
            versions.available_versions.first().cloned()
        };

        if let Err(err) = client.add_extension("developer").await {
            warn!(error = %err, "failed to register developer extension");
        }

        let provider = settings.provider.provider.as_deref().unwrap_or_default();
        let model = settings.provider.model.as_deref();
        client
            .create_agent(provider, model, version.as_deref())
            .await?;

        if let Some(prompt) = &settings.system_prompt {
            if let Err(err) = client.set_agent_prompt(prompt).await {
                warn!(error = %err, "failed to set system prompt");
            }
        }
        Ok(())
    }

    async fn abort_start(&self, instance_id: u64, err: &BridgeError) {
        let server = {
            let mut state = self.inner.state.lock().await;
            let matches = state
                .server
                .as_ref()
                .map(|s| s.instance_id == instance_id)
                .unwrap_or(false);
            if matches {
                state.server.take()
            } else {
                None
            }
        };
        if let Some(server) = server {
            let pid = server.pid;
            let child = server.child;
            let _ = tokio::task::spawn_blocking(move || kill_child(pid, &child)).await;
        }
        self.set_status(ServerStatus::Error {
            message: err.to_string(),
        })
        .await;
    }

    fn spawn_exit_watcher(&self, instance_id: u64, pid: Option<u32>, child: SharedChild) {
        let externally_managed = child.lock().map(|guard| guard.is_none()).unwrap_or(true);
        if externally_managed {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let status = {
                    let mut guard = match child.lock() {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                    match guard.as_mut() {
                        Some(child) => child.try_wait().unwrap_or(None),
                        None => return,
                    }
                };
                if let Some(status) = status {
                    manager.handle_process_exit(instance_id, pid, status).await;
                    return;
                }
                sleep(Duration::from_millis(MONITOR_DELAY_MS)).await;
            }
        });
    }

    async fn handle_process_exit(
        &self,
        instance_id: u64,
        pid: Option<u32>,
        status: std::process::ExitStatus,
    ) {
        {
            let mut state = self.inner.state.lock().await;
            let matches = state
                .server
                .as_ref()
                .map(|s| s.instance_id == instance_id)
                .unwrap_or(false);
            if !matches {
                // A stop or restart already replaced this instance.
                return;
            }
            state.server = None;
        }
        warn!(pid = ?pid, status = ?status, "agent server exited unexpectedly");
        self.set_status(ServerStatus::Error {
            message: format!("agent server exited unexpectedly ({status})"),
        })
        .await;
    }

    async fn set_status(&self, status: ServerStatus) {
        let changed = {
            let mut state = self.inner.state.lock().await;
            if state.status == status {
                false
            } else {
                state.status = status.clone();
                true
            }
        };
        if changed {
            let _ = self.inner.status_tx.send(status);
        }
    }
}

fn generate_secret_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_KEY_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_keys_are_32_alphanumeric_chars() {
        let secret = generate_secret_key();
        assert_eq!(secret.len(), SECRET_KEY_LEN);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn consecutive_secrets_differ() {
        assert_ne!(generate_secret_key(), generate_secret_key());
    }
}
