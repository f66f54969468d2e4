//! Minimal endpoint and monitor process
//!
//! Registers with the tree, waits for its barrier, simulates its samples
//! and deregisters. Real load generators follow the same sequence.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pubsubcoord_core::config::{BrokerKind, ClientId, EndpointKind};
use pubsubcoord_core::endpoint::EndpointClient;
use pubsubcoord_core::protocol::{BarrierKind, TreeLayout};
use pubsubcoord_core::tree::{HttpTree, HttpTreeConfig};

#[derive(Debug, Parser)]
#[command(name = "endpoint", about = "Join an experiment run as an endpoint or monitor")]
struct Args {
    #[arg(long, env = "TREE_ADDR", default_value = "http://localhost:7070")]
    tree_addr: String,

    #[arg(long)]
    run_id: String,

    /// Seconds to wait on a barrier before giving up
    #[arg(long)]
    timeout: Option<u64>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// A publisher or subscriber for one topic
    Endpoint {
        /// `sub` or `pub`
        #[arg(long)]
        kind: EndpointKind,
        /// Client host, e.g. cli1-1
        #[arg(long)]
        host: String,
        #[arg(long)]
        topic: String,
        #[arg(long, default_value_t = 100)]
        samples: u64,
        /// Milliseconds between samples
        #[arg(long, default_value_t = 10)]
        interval: u64,
    },
    /// The monitor of one broker host
    Monitor {
        /// `eb` or `rb`
        #[arg(long)]
        broker: BrokerKind,
        #[arg(long)]
        host: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let timeout = args.timeout.map(Duration::from_secs);
    let paths = TreeLayout::default().run(&args.run_id);
    let pid = std::process::id();

    match args.role {
        Role::Endpoint {
            kind,
            host,
            topic,
            samples,
            interval,
        } => {
            let client = ClientId::parse(&host)?;
            let tree = HttpTree::connect(HttpTreeConfig {
                endpoint: args.tree_addr,
                label: format!("{}-{}-{}", kind.segment(), host, pid),
                ..HttpTreeConfig::default()
            })
            .await?;
            let endpoint = EndpointClient::new(Arc::new(tree), paths);

            endpoint.register_endpoint(kind, &client, &topic, pid).await?;
            endpoint.wait_barrier(BarrierKind::Publisher, timeout).await?;
            for _ in 0..samples {
                tokio::time::sleep(Duration::from_millis(interval)).await;
                endpoint.state().record_sample();
            }
            info!("{} on {} done after {} samples", kind, host, endpoint.state().samples());
            endpoint.close().await?;
        }
        Role::Monitor { broker, host } => {
            let tree = HttpTree::connect(HttpTreeConfig {
                endpoint: args.tree_addr,
                label: format!("monitor-{}", host),
                ..HttpTreeConfig::default()
            })
            .await?;
            let monitor = EndpointClient::new(Arc::new(tree), paths);

            monitor.register_monitor(broker, &host).await?;
            monitor.wait_barrier(BarrierKind::Finished, timeout).await?;
            info!("Monitor on {} done", host);
            monitor.close().await?;
        }
    }
    Ok(())
}
