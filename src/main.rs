//! p2pvpn CLI - point-to-point VPN between two peers
//!
//! Generate an identity on each side, exchange peer ids, then run the tunnel.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{RunArgs, RunConfig, RunSettings};
use p2pvpn_transport::{PeerAddr, StreamHost};
use p2pvpn_transport_quic::{Identity, QuicHost, QuicHostConfig};
use p2pvpn_tunnel::TunnelService;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Delay between attempts to reach the peer
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// p2pvpn - Tunnel IP packets or Ethernet frames to a single peer
#[derive(Parser, Debug)]
#[command(name = "p2pvpn")]
#[command(about = "p2pvpn - Tunnel IP packets or Ethernet frames to a single peer")]
#[command(version = VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a new peer identity
    Keygen {
        /// Directory to write the identity into
        #[arg(short = 'f', long = "identity")]
        identity: PathBuf,

        /// Replace an existing identity
        #[arg(long)]
        force: bool,
    },

    /// Print the peer id of an existing identity
    Id {
        /// Identity directory
        #[arg(short = 'f', long = "identity")]
        identity: PathBuf,
    },

    /// Bring up the interface and tunnel it to the peer
    #[command(long_about = r#"
Create the virtual interface, listen for the peer, keep dialing it until
a connection succeeds, then relay frames in both directions.

EXAMPLES:
  # On host A (peer id printed by `p2pvpn keygen` on host B)
  p2pvpn run -f /etc/p2pvpn -l 0.0.0.0:4001 \
    -p <peer-b-id>@198.51.100.2:4001 \
    -t 10.0.0.1/24,10.0.0.2

  # Ethernet frames over a named TAP device
  p2pvpn run -f /etc/p2pvpn -p <peer-id>@vpn.example.com:4001 \
    --tap --name vpn0

ENVIRONMENT VARIABLES:
  P2PVPN_IDENTITY   Identity directory
  P2PVPN_PEER       Peer address
  P2PVPN_LISTEN     Listen address
  P2PVPN_TUNNEL_IP  Tunnel addresses
  P2PVPN_CONFIG     YAML run configuration
    "#)]
    Run(RunArgs),
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn keygen(dir: PathBuf, force: bool) -> Result<()> {
    let identity = Identity::generate().context("Failed to generate identity")?;
    identity
        .save(&dir, force)
        .with_context(|| format!("Failed to save identity to {}", dir.display()))?;

    println!("peer ID: {}", identity.peer_id());
    Ok(())
}

fn show_id(dir: PathBuf) -> Result<()> {
    let identity = Identity::load(&dir)
        .with_context(|| format!("Failed to load identity from {}", dir.display()))?;

    println!("peer ID: {}", identity.peer_id());
    Ok(())
}

/// Dial the peer until it answers
async fn connect_with_retry(host: &QuicHost, peer: &PeerAddr) {
    info!("Trying to connect to {}", peer);

    let mut attempt = 0u64;
    loop {
        attempt += 1;
        match host.connect(peer).await {
            Ok(()) => {
                info!("Connected to {} after {} attempt(s)", peer.peer.short(), attempt);
                return;
            }
            Err(e) => {
                warn!(
                    "Connection attempt {} failed: {}. Retrying in {} seconds...",
                    attempt,
                    e,
                    CONNECT_RETRY_DELAY.as_secs()
                );
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let file = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    let settings = RunSettings::resolve(file, &args)?;

    let identity = Identity::load(&settings.identity).with_context(|| {
        format!(
            "Failed to load identity from {}",
            settings.identity.display()
        )
    })?;
    info!("Local peer: {}", identity.peer_id());

    let device = p2pvpn_device::create(&settings.interface)
        .await
        .context("Failed to create virtual interface")?;

    let host = QuicHost::bind(identity, QuicHostConfig::new(settings.listen))
        .context("Failed to start QUIC host")?;

    let service = TunnelService::new(device, settings.peer.peer.clone());
    service.register(&host);

    connect_with_retry(&host, &settings.peer).await;

    let result = service.serve(&host).await;

    let stats = service.stats().snapshot();
    info!(
        "Relayed {} frames ({} bytes) out, {} frames ({} bytes) in, {} dropped",
        stats.frames_out, stats.bytes_out, stats.frames_in, stats.bytes_in, stats.frames_dropped
    );

    result.context("Tunnel stopped")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Keygen { identity, force } => keygen(identity, force),
        Commands::Id { identity } => show_id(identity),
        Commands::Run(args) => {
            info!("p2pvpn {} starting...", VERSION);

            // Setup Ctrl+C handler
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C, shutting down...");
                }
                result = run(args) => {
                    if let Err(e) = result {
                        error!("{:#}", e);
                        return Err(e);
                    }
                }
            }

            info!("p2pvpn stopped");
            Ok(())
        }
    }
}
