use agent_bridge::cli::{init_logging, run_command, Cli};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();
    if let Err(err) = run_command(cli).await {
        tracing::error!(error = %err, "agent-bridge failed");
        std::process::exit(1);
    }
}
