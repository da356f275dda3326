use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use ssc_rendezvous::config::Config;
use ssc_rendezvous::logger;
use ssc_rendezvous::peer::media::{LogSurface, SyntheticMedia};
use ssc_rendezvous::peer::{NegotiationState, WebRtcConnector};
use ssc_rendezvous::session::CallSession;
use ssc_rendezvous::signaling::{RelayStore, SignalingClient};
use ssc_rendezvous::store::{MemoryRelay, PostgrestRelay};
use ssc_rendezvous::utils::new_session_id;

#[derive(Parser, Debug)]
#[command(name = "ssc-rendezvous", version, about = "P2P call rendezvous over a shared signaling store")]
struct Cli {
    /// JSON config file
    #[arg(long, env = "SSC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Relay base URL (overrides config)
    #[arg(long, env = "SSC_RELAY_URL", global = true)]
    relay_url: Option<String>,

    /// Relay API key (overrides config)
    #[arg(long, env = "SSC_RELAY_KEY", global = true, hide_env_values = true)]
    relay_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a fresh session id to share with the other peer
    New,
    /// Join a session through the relay and stay until Ctrl-C
    Join { session_id: String },
    /// Connect two in-process peers through an in-memory relay
    Local {
        /// Seconds to keep the call up after both sides are established
        #[arg(long, default_value_t = 5)]
        hold_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logger::init(Some(config.log_filter()));

    match cli.command {
        Commands::New => {
            println!("{}", new_session_id());
            Ok(())
        }
        Commands::Join { session_id } => join(&config, &session_id).await,
        Commands::Local { hold_secs } => local(&config, Duration::from_secs(hold_secs)).await,
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(url) = &cli.relay_url {
        config.relay.url = url.clone();
    }
    if let Some(key) = &cli.relay_key {
        config.relay.api_key = key.clone();
    }
    config.validate()?;
    Ok(config)
}

fn session(config: &Config, relay: Arc<dyn RelayStore>) -> CallSession {
    CallSession::new(
        config,
        relay,
        Arc::new(WebRtcConnector),
        Arc::new(SyntheticMedia),
        Arc::new(LogSurface),
    )
}

async fn join(config: &Config, session_id: &str) -> Result<()> {
    let relay = PostgrestRelay::new(&config.relay).context("relay is not configured")?;
    let mut call = session(config, Arc::new(relay));
    let mut status = call.status();
    call.enter(session_id).await;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = status.borrow_and_update().clone();
                print_state(&state);
                if call.is_stalled() {
                    warn!("another peer overwrote our offer; restart with a new session id");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, leaving session");
                break;
            }
        }
    }

    call.leave().await;
    Ok(())
}

async fn local(config: &Config, hold: Duration) -> Result<()> {
    let relay: Arc<dyn RelayStore> = Arc::new(MemoryRelay::new());
    let signaling = SignalingClient::new(relay.clone());
    let session_id = new_session_id();
    let wait = Duration::from_secs(10);

    let mut caller = session(config, relay.clone());
    let mut callee = session(config, relay);

    // второй участник входит только когда offer уже лежит в записи
    caller.enter(&session_id).await;
    signaling
        .wait_for_offer(&session_id, config.poll_interval(), wait)
        .await?
        .ok_or_else(|| anyhow!("caller never published an offer: {}", caller.state()))?;

    callee.enter(&session_id).await;
    for (name, peer) in [("callee", &callee), ("caller", &caller)] {
        let state = peer
            .wait_for(wait, |s| s.is_established() || s.is_failed())
            .await
            .ok_or_else(|| anyhow!("{name} did not finish negotiation"))?;
        print_state(&state);
        if let NegotiationState::Failed(reason) = state {
            return Err(anyhow!("{name} failed: {reason}"));
        }
    }

    tokio::time::sleep(hold).await;
    caller.leave().await;
    callee.leave().await;
    Ok(())
}

fn print_state(state: &NegotiationState) {
    println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), state);
}
