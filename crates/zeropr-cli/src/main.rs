//! ZeroPR CLI - LAN presence and live co-editing
//!
//! Commands:
//! - zeropr daemon                 - Run the agent in the foreground
//! - zeropr status                 - Show agent status
//! - zeropr peers                  - List discovered peers
//! - zeropr broadcast start|stop   - Toggle mDNS advertisement
//! - zeropr sessions               - List co-editing sessions
//! - zeropr session create|join|leave

mod client;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use zeropr_daemon::DaemonConfig;

use crate::client::AgentClient;

/// ZeroPR - see who is editing what on your LAN
#[derive(Parser)]
#[command(name = "zeropr", version, about = "LAN presence and live co-editing agent")]
struct Cli {
    /// Agent HTTP port (defaults to the configured port)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent in the foreground
    Daemon {
        /// HTTP/WebSocket port, also the advertised port
        #[arg(long)]
        http_port: Option<u16>,
        /// Device name advertised on the network
        #[arg(long)]
        name: Option<String>,
        /// Workspace root for shared files and repo detection
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Start broadcasting immediately
        #[arg(long)]
        broadcast: bool,
    },
    #[command(flatten)]
    Client(ClientCommand),
}

/// Commands served by a running agent
#[derive(Subcommand)]
enum ClientCommand {
    /// Show agent status
    Status,
    /// List discovered peers
    Peers,
    /// Start or stop advertising this machine
    Broadcast {
        #[command(subcommand)]
        action: BroadcastAction,
    },
    /// List co-editing sessions
    Sessions,
    /// Manage co-editing sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum BroadcastAction {
    Start,
    Stop,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Open a session on a file
    Create {
        file: String,
        /// Initiator id
        #[arg(long = "as")]
        participant: String,
    },
    /// Join an existing session
    Join {
        session_id: String,
        #[arg(long = "as")]
        participant: String,
    },
    /// Leave a session
    Leave {
        session_id: String,
        #[arg(long = "as")]
        participant: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = DaemonConfig::load()?;

    match cli.command {
        Commands::Daemon {
            http_port,
            name,
            workspace,
            broadcast,
        } => {
            init_tracing();

            if let Some(port) = http_port.or(cli.port) {
                config.http_port = port;
            }
            if let Some(name) = name {
                config.device_name = name;
            }
            config.workspace = match workspace {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            config.broadcast_on_start |= broadcast;

            zeropr_daemon::run(config).await
        }
        Commands::Client(command) => {
            let client = AgentClient::new(cli.port.unwrap_or(config.http_port));
            run_client(&client, command).await
        }
    }
}

async fn run_client(client: &AgentClient, command: ClientCommand) -> Result<()> {
    match command {
        ClientCommand::Status => client.status().await,
        ClientCommand::Peers => client.peers().await,
        ClientCommand::Broadcast { action } => match action {
            BroadcastAction::Start => client.broadcast(true).await,
            BroadcastAction::Stop => client.broadcast(false).await,
        },
        ClientCommand::Sessions => client.sessions().await,
        ClientCommand::Session { action } => match action {
            SessionAction::Create { file, participant } => {
                client.create_session(&file, &participant).await
            }
            SessionAction::Join {
                session_id,
                participant,
            } => client.join_session(&session_id, &participant).await,
            SessionAction::Leave {
                session_id,
                participant,
            } => client.leave_session(&session_id, &participant).await,
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("zeropr=info,zeropr_core=info,zeropr_daemon=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
