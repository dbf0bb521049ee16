use bridge_client::network::{BridgeClient, BridgeUpdate};
use clap::Parser;
use log::{error, info};
use shared::AuthMethod;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:7777")]
    server: String,

    /// Name to authenticate as
    #[arg(short = 'n', long)]
    name: String,

    /// Credential token
    #[arg(short = 't', long, default_value = "")]
    token: String,

    /// anonymous, steam, gog, epic or custom
    #[arg(short = 'm', long, default_value = "custom", value_parser = parse_method)]
    method: AuthMethod,

    /// Hardware fingerprint reported to the server
    #[arg(short = 'f', long, default_value = "reference-bridge")]
    fingerprint: String,

    /// Seconds between heartbeats
    #[arg(long, default_value = "2")]
    heartbeat: u64,
}

fn parse_method(value: &str) -> Result<AuthMethod, String> {
    match value.to_ascii_lowercase().as_str() {
        "anonymous" => Ok(AuthMethod::Anonymous),
        "steam" => Ok(AuthMethod::Steam),
        "gog" => Ok(AuthMethod::Gog),
        "epic" => Ok(AuthMethod::Epic),
        "custom" => Ok(AuthMethod::Custom),
        other => Err(format!("unknown auth method '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info to see decisions");
    }

    let args = Args::parse();

    info!("Connecting to: {}", args.server);
    let mut bridge = BridgeClient::new(&args.server).await?;

    match bridge
        .authenticate(&args.name, &args.token, args.method, &args.fingerprint)
        .await?
    {
        BridgeUpdate::Authenticated(session) => {
            info!(
                "Player #{} online, permissions: {}",
                session.player_id,
                session.permissions.join(", ")
            );
            info!("Type commands such as 'join Nova', 'talk 12' or 'vote 1 yes'");
        }
        BridgeUpdate::AuthFailed { code, message } => {
            error!("Login refused ({}): {}", code.name(), message);
            return Err(message.into());
        }
        other => return Err(format!("unexpected reply {:?}", other).into()),
    }

    bridge.run(Duration::from_secs(args.heartbeat.max(1))).await?;

    Ok(())
}
