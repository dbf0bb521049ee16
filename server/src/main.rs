use clap::Parser;
use coop_server::auth::{IdentityStore, JsonFileStore};
use coop_server::clock::system_clock;
use coop_server::config::CoreConfig;
use coop_server::coop::CoopCore;
use coop_server::network::{Server, ServerMessage};
use env_logger::Env;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;

/// Authoritative co-op coordination server.
/// Loads the configuration, applies command-line overrides, starts the core and serves bridges over UDP.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// TOML configuration file; defaults are used when omitted
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Server IP address to bind to
    #[clap(short = 'H', long)]
    host: Option<String>,
    /// Server port to listen on
    #[clap(short, long)]
    port: Option<u16>,
    /// Tick rate (updates per second)
    #[clap(short, long)]
    tick_rate: Option<u32>,
    /// Maximum number of simultaneously online players
    #[clap(short, long)]
    max_players: Option<usize>,
    /// Log filter, e.g. "info" or "coop_server=debug"
    #[clap(short, long)]
    log_level: Option<String>,
    /// Reject every new login until maintenance is switched off
    #[clap(long)]
    maintenance: bool,
    /// JSON file that keeps bans and known players across restarts
    #[clap(long)]
    identity_store: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut CoreConfig) {
        if self.host.is_some() || self.port.is_some() {
            let (current_host, current_port) = config
                .network
                .bind_address
                .rsplit_once(':')
                .map(|(h, p)| (h.to_string(), p.parse::<u16>().unwrap_or(7777)))
                .unwrap_or_else(|| ("127.0.0.1".to_string(), 7777));
            let host = self.host.clone().unwrap_or(current_host);
            let port = self.port.unwrap_or(current_port);
            config.network.bind_address = format!("{}:{}", host, port);
        }
        if let Some(tick_rate) = self.tick_rate {
            config.network.tick_rate = tick_rate;
        }
        if let Some(max_players) = self.max_players {
            config.identity.max_online_players = max_players;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.maintenance {
            config.identity.maintenance_mode = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CoreConfig::load(path).await?,
        None => CoreConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    env_logger::Builder::from_env(Env::default().default_filter_or(config.logging.level.as_str())).init();
    info!(
        "Starting coordination server on {} at {} Hz (max {} players)",
        config.network.bind_address, config.network.tick_rate, config.identity.max_online_players
    );

    let store = args
        .identity_store
        .as_ref()
        .map(|path| Arc::new(JsonFileStore::new(path.clone())) as Arc<dyn IdentityStore>);
    let core = Arc::new(CoopCore::with_clock(config.clone(), system_clock(), store)?);
    core.initialize()?;

    let mut server = Server::new(Arc::clone(&core), &config.network).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            if let Err(e) = shutdown.send(ServerMessage::Shutdown) {
                error!("Failed to signal shutdown: {}", e);
            }
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        core.shutdown();
        return Err(e);
    }
    Ok(())
}
