//! Command-line front end. The library is meant to be embedded in an editor;
//! the CLI drives the same surfaces for scripting and troubleshooting.

use std::path::PathBuf;

use agent_bridge_error::BridgeError;
use agent_bridge_server_manager::{ServerManager, ServerManagerConfig, ServerStatus};
use agent_bridge_settings::{default_settings_path, BridgeSettings};
use clap::{Parser, Subcommand};
use tokio_stream::wrappers::BroadcastStream;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::events::ChatEvent;
use crate::processor::{ChatProcessor, OutgoingTurn};
use crate::sessions::{display_title, SessionManager};

#[derive(Debug, Parser)]
#[command(name = "agent-bridge", about = "Local agent server bridge")]
pub struct Cli {
    /// Settings file; defaults to the per-user config location.
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the agent server and print its status.
    Status,
    /// List the sessions known to the agent server.
    Sessions,
    /// Send one prompt and stream the reply to stdout.
    Chat(ChatArgs),
}

#[derive(Debug, clap::Args)]
pub struct ChatArgs {
    /// Prompt text.
    pub prompt: String,
    /// Continue an existing session instead of creating one.
    #[arg(long)]
    pub session: Option<String>,
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub async fn run_command(cli: Cli) -> Result<(), BridgeError> {
    let settings_path = cli.settings.unwrap_or_else(default_settings_path);
    let settings = BridgeSettings::load_or_default(&settings_path)?;
    let manager = ServerManager::new(settings, ServerManagerConfig::default());

    let result = match cli.command {
        Command::Status => run_status(&manager).await,
        Command::Sessions => run_sessions(&manager).await,
        Command::Chat(args) => run_chat(&manager, args).await,
    };
    manager.stop().await;
    result
}

async fn run_status(manager: &ServerManager) -> Result<(), BridgeError> {
    let status = match manager.start().await {
        Ok(()) => manager.status().await,
        Err(err) => ServerStatus::Error {
            message: err.to_string(),
        },
    };
    let line = serde_json::to_string(&status)
        .map_err(|err| BridgeError::stream(format!("failed to encode status: {err}")))?;
    println!("{line}");
    Ok(())
}

async fn run_sessions(manager: &ServerManager) -> Result<(), BridgeError> {
    manager.start().await?;
    let client = manager.api_client().await?;
    let sessions = SessionManager::new();
    for entry in sessions.refresh(&client).await {
        println!("{}\t{}", entry.id, display_title(&entry));
    }
    Ok(())
}

async fn run_chat(manager: &ServerManager, args: ChatArgs) -> Result<(), BridgeError> {
    use futures::StreamExt;

    manager.start().await?;
    let client = manager.api_client().await?;
    let sessions = SessionManager::new();
    sessions.refresh(&client).await;
    if let Some(session_id) = &args.session {
        sessions.switch_session(&client, session_id).await?;
    }

    let processor = ChatProcessor::new(sessions);
    let mut events = BroadcastStream::new(processor.subscribe());
    let printer = tokio::spawn(async move {
        // Message events carry full state; print only what extends the
        // already-printed text.
        let mut shown = String::new();
        while let Some(Ok(event)) = events.next().await {
            match event {
                ChatEvent::MessageReceived { message } => {
                    let text = message.text();
                    match incremental_suffix(&shown, &text) {
                        Some(suffix) => print!("{suffix}"),
                        // The message was rewritten; reprint it in full.
                        None => print!("\n{text}"),
                    }
                    shown = text;
                }
                ChatEvent::Finish { .. } => {
                    println!();
                    break;
                }
                ChatEvent::Error { report } => {
                    eprintln!("error: {}", report.message);
                    break;
                }
            }
        }
    });

    let result = processor
        .send_message(&client, OutgoingTurn::text(args.prompt))
        .await;
    let _ = printer.await;
    result
}

/// Returns the part of `current` that extends `previous`, or `None` when the
/// new state rewrites text that was already shown. Works on whole characters,
/// so a rewrite never slices through a multibyte sequence.
fn incremental_suffix<'a>(previous: &str, current: &'a str) -> Option<&'a str> {
    current.strip_prefix(previous)
}
