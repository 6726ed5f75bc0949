//! codex-blocker - Codex session activity server
//!
//! Tails the rollout logs Codex writes under `~/.codex/sessions`, tracks which
//! sessions are working or idle, and publishes the aggregate over HTTP
//! (`GET /status`) and a WebSocket push channel (`/ws`) for the companion
//! browser extension.

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use codex_blocker::{
    config::{self, Config, ConfigError},
    registry::SessionRegistry,
    server::{self, ServerError, StartOptions},
};

/// codex-blocker - Codex session activity server
#[derive(Parser, Debug)]
#[command(name = "codex-blocker", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (TOML). Defaults to ~/.codex-blocker/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Address to bind. Only loopback is recommended.
    #[arg(long, global = true)]
    host: Option<IpAddr>,

    /// Port for the HTTP/WebSocket server
    #[arg(long, env = "CODEX_BLOCKER_PORT", global = true)]
    port: Option<u16>,

    /// Root of the Codex rollout log tree
    #[arg(long, env = "CODEX_SESSIONS_DIR", global = true)]
    sessions_dir: Option<PathBuf>,

    /// Where the client token is persisted
    #[arg(long, global = true)]
    token_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server (default)
    Serve,

    /// Print the effective configuration as TOML
    Config {
        /// Also write it to the config file path
        #[arg(long)]
        write: bool,
    },
}

#[derive(Error, Debug)]
pub enum BlockerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let result = match &cli.command {
        Some(Commands::Config { write }) => print_config(&cli, *write),
        Some(Commands::Serve) | None => run_server(&cli).await,
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        eprintln!("codex-blocker: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "codex_blocker=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(config::default_config_path)
}

/// Defaults, then the config file, then flags and environment.
fn load_config(cli: &Cli) -> Result<Config, BlockerError> {
    let path = config_path(cli);
    let mut config = Config::load_or_default(&path)?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(dir) = &cli.sessions_dir {
        config.sessions_dir = dir.clone();
    }
    if let Some(path) = &cli.token_file {
        config.token_path = path.clone();
    }
    config.validate()?;
    Ok(config)
}

fn print_config(cli: &Cli, write: bool) -> Result<(), BlockerError> {
    let config = load_config(cli)?;
    print!("{}", toml::to_string_pretty(&config)?);
    if write {
        let path = config_path(cli);
        config.save(&path)?;
        eprintln!("wrote {}", path.display());
    }
    Ok(())
}

async fn run_server(cli: &Cli) -> Result<(), BlockerError> {
    let config = load_config(cli)?;
    if !config.host.is_loopback() {
        tracing::warn!(host = %config.host, "binding to a non-loopback address");
    }

    let registry = SessionRegistry::with_session_timeout(config.session_timeout());
    let handle = server::start(&config, registry, StartOptions::default()).await?;

    println!();
    println!("  Codex Blocker Server");
    println!();
    println!("  HTTP:      http://{}", handle.addr());
    println!("  WebSocket: ws://{}/ws", handle.addr());
    println!();
    println!("  Watching Codex sessions in {}", config.sessions_dir.display());
    println!();

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C, shutting down");
    handle.shutdown().await;
    Ok(())
}
