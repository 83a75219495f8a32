//! Seams between the supervisor and the operating system: resolving the
//! agent-server binary and spawning it. Tests substitute both.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex as StdMutex};

use agent_bridge_error::BridgeError;

pub type SharedChild = Arc<StdMutex<Option<Child>>>;

/// What the supervisor asks a launcher to run.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub port: u16,
    pub secret_key: String,
}

/// A launched agent-server process. `child` is `None` when the process is
/// managed externally (tests point the supervisor at an already-running
/// server); the exit watcher then has nothing to poll.
pub struct LaunchedProcess {
    pub port: u16,
    pub pid: Option<u32>,
    pub child: SharedChild,
}

pub trait BinaryResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<PathBuf, BridgeError>;
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, BridgeError>;
}

/// Walks `PATH` for the named binary.
#[derive(Debug, Default)]
pub struct PathResolver;

impl BinaryResolver for PathResolver {
    fn resolve(&self, name: &str) -> Result<PathBuf, BridgeError> {
        let path_var = std::env::var_os("PATH").unwrap_or_default();
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
            #[cfg(windows)]
            {
                let exe = dir.join(format!("{name}.exe"));
                if exe.is_file() {
                    return Ok(exe);
                }
            }
        }
        Err(BridgeError::BinaryNotFound {
            name: name.to_string(),
        })
    }
}

/// Spawns the real binary with the port argument and the secret in its
/// environment. Stdout/stderr are discarded; the server does its own file
/// logging.
#[derive(Debug, Default)]
pub struct CommandLauncher;

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, BridgeError> {
        let child = Command::new(&spec.binary)
            .arg("serve")
            .arg("--port")
            .arg(spec.port.to_string())
            .env("AGENT_SECRET_KEY", &spec.secret_key)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| BridgeError::Spawn { source })?;
        let pid = child.id();
        Ok(LaunchedProcess {
            port: spec.port,
            pid: Some(pid),
            child: Arc::new(StdMutex::new(Some(child))),
        })
    }
}

pub fn find_available_port() -> Result<u16, BridgeError> {
    let listener =
        TcpListener::bind("127.0.0.1:0").map_err(|source| BridgeError::Spawn { source })?;
    let port = listener
        .local_addr()
        .map_err(|source| BridgeError::Spawn { source })?
        .port();
    drop(listener);
    Ok(port)
}

pub fn child_is_alive(child: &SharedChild) -> bool {
    let mut guard = match child.lock() {
        Ok(guard) => guard,
        Err(_) => return false,
    };
    let Some(child) = guard.as_mut() else {
        return false;
    };
    match child.try_wait() {
        Ok(Some(_)) => {
            *guard = None;
            false
        }
        Ok(None) => true,
        Err(_) => false,
    }
}

/// Kills the process, taking its whole tree down on Windows where a plain
/// kill leaves grandchildren running.
pub fn kill_child(pid: Option<u32>, child: &SharedChild) {
    #[cfg(windows)]
    if let Some(pid) = pid {
        let _ = Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    #[cfg(not(windows))]
    let _ = pid;

    if let Ok(mut guard) = child.lock() {
        if let Some(child) = guard.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        *guard = None;
    }
}
