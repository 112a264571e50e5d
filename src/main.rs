use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use chatrelay::config::{ChatConfig, RelayConfig};
use chatrelay::interface::terminal::TerminalInterface;
use chatrelay::manager::Manager;
use chatrelay::relay::{client::RelayClient, server::RelayServer};
use chatrelay::session::SessionStore;
use chatrelay::store::SqliteStore;

#[derive(Parser)]
#[command(
    name = "chatrelay",
    version,
    about = "Chat relay and session-keeping client",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    // Running without a subcommand means `serve`.
    #[command(flatten)]
    serve: RelayConfig,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP relay in front of the inference service.
    Serve(RelayConfig),
    /// Chat from the terminal through a running relay.
    Chat(ChatConfig),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(cli.serve)) {
        Command::Serve(config) => serve(config).await,
        Command::Chat(config) => chat(config).await,
    }
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    info!(
        "Relaying {} to {} (streaming {})",
        chatrelay::relay::CHAT_PATH,
        config.predict_url(),
        if config.streaming { "on" } else { "off" }
    );

    let bind = config.bind;
    let app = RelayServer::new(config)?.router();

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Relay listening on {}", bind);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                info!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}

async fn chat(config: ChatConfig) -> anyhow::Result<()> {
    let db_path = config.db_path();
    info!("Initializing session store at {}", db_path.display());
    let port = SqliteStore::new(&db_path).await?;
    port.init().await?;

    let store = SessionStore::load(port, config.name_prefix.clone()).await?;
    let client = RelayClient::new(&config.relay_url)?;
    info!("Sending chats to {}", client.endpoint());

    let manager = Arc::new(Manager::new(store, client, config.reply_filter.build()?));
    TerminalInterface::new(manager).run().await
}
