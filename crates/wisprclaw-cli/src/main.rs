//! `wisprclaw`: talk to the agent gateway from the command line.
//!
//!   wisprclaw send "what's on my calendar?"
//!   echo "draft a reply" | wisprclaw send
//!   wisprclaw connect
//!   wisprclaw identity

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;
use wisprclaw_client::{Error, GatewayClient};
use wisprclaw_core::IdentityStore;

use crate::config::FileConfig;

/// Used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "wisprclaw=info,wisprclaw_client=info,wisprclaw_core=info";

#[derive(Parser)]
#[command(name = "wisprclaw", version, about = "WisprClaw agent gateway client")]
struct Cli {
    /// Config file (default: <config dir>/wisprclaw/config.toml)
    #[arg(long, env = "WISPRCLAW_CONFIG")]
    config: Option<PathBuf>,

    /// Gateway base URL
    #[arg(long, env = "WISPRCLAW_GATEWAY_URL")]
    url: Option<String>,

    /// Gateway bearer token
    #[arg(long, env = "WISPRCLAW_GATEWAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Device identity file
    #[arg(long, env = "WISPRCLAW_IDENTITY")]
    identity: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message to the agent and print its reply (reads stdin if no text)
    Send { text: Vec<String> },
    /// Authenticate with the gateway and report the result
    Connect,
    /// Print this device's id and public key
    Identity,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(DEFAULT_LOG_FILTER)
        }))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(FileConfig::default_path);
    let mut file = match &config_path {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    if let Some(url) = cli.url {
        file.gateway.url = url;
    }
    if let Some(token) = cli.token {
        file.gateway.token = Some(token);
    }

    let store = match cli.identity.or(file.identity_path) {
        Some(path) => IdentityStore::new(path),
        None => IdentityStore::default_location().context("locating device identity")?,
    };
    let identity = store.load_or_create();

    match cli.command {
        Command::Identity => {
            println!("device id:  {}", identity.device_id());
            println!("public key: {}", identity.public_key_url_safe());
            println!("stored at:  {}", store.path().display());
            Ok(())
        }
        Command::Connect => {
            let client = GatewayClient::new(file.gateway, identity);
            let mut states = client.watch_state();
            let progress = tokio::spawn(async move {
                while states.changed().await.is_ok() {
                    let state = *states.borrow_and_update();
                    if !state.is_connecting() {
                        break;
                    }
                    eprintln!("  {state:?}");
                }
            });

            let result = client.ensure_connected().await;
            client.disconnect().await;
            progress.abort();
            result.map_err(|e| report(&e))?;
            println!("authenticated with {}", client.config().url);
            Ok(())
        }
        Command::Send { text } => {
            let message = if text.is_empty() {
                let mut buf = String::new();
                tokio::io::stdin()
                    .read_to_string(&mut buf)
                    .await
                    .context("reading message from stdin")?;
                buf
            } else {
                text.join(" ")
            };
            let message = message.trim();
            anyhow::ensure!(!message.is_empty(), "nothing to send");

            let client = GatewayClient::new(file.gateway, identity);
            let result = client.send_request(message).await;
            client.disconnect().await;
            let reply = result.map_err(|e| report(&e))?;
            println!("{reply}");
            Ok(())
        }
    }
}

/// Tell connectivity problems apart from failures the agent reported.
fn report(e: &Error) -> anyhow::Error {
    if e.is_connection_level() {
        anyhow::anyhow!("could not reach agent: {e}")
    } else {
        anyhow::anyhow!("agent reported an error: {e}")
    }
}
