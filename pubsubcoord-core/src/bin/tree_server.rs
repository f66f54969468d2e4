//! Coordination tree service binary

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pubsubcoord_core::tree::{SessionConfig, TreeServer, TreeServerConfig};
use pubsubcoord_core::ShutdownSignal;

#[derive(Debug, Parser)]
#[command(name = "tree-server", about = "Serve a coordination tree over HTTP")]
struct Args {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:7070")]
    bind_addr: SocketAddr,

    /// Seconds a session may stay silent before it expires
    #[arg(long, env = "SESSION_TIMEOUT", default_value_t = pubsubcoord_core::DEFAULT_SESSION_TIMEOUT_SECS)]
    session_timeout: u64,

    /// Longest a watch request is held open, in seconds
    #[arg(long, default_value_t = 20)]
    poll_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let defaults = SessionConfig::default();
    let config = TreeServerConfig {
        bind_addr: args.bind_addr,
        session: SessionConfig {
            expiry_timeout: Duration::from_secs(args.session_timeout),
            suspect_timeout: defaults.suspect_timeout.min(Duration::from_secs(args.session_timeout)),
            ..defaults
        },
        poll_timeout: Duration::from_secs(args.poll_timeout),
        ..TreeServerConfig::default()
    };

    info!("Starting tree server on {}", config.bind_addr);
    let shutdown = ShutdownSignal::new();
    shutdown.trigger_on_ctrl_c();
    TreeServer::new(config).serve(shutdown).await?;
    Ok(())
}
