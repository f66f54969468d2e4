//! Experiment coordinator binary

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pubsubcoord_core::coordinator::{
    CommandLauncher, CoordinatorConfig, EndpointLauncher, ExperimentCoordinator, LauncherConfig,
};
use pubsubcoord_core::endpoint::{SimulatedLauncher, SimulationConfig};
use pubsubcoord_core::protocol::TreeLayout;
use pubsubcoord_core::tree::{CoordinationTree, HttpTree, HttpTreeConfig, MemoryTree, TreeConnector};
use pubsubcoord_core::ExperimentConfig;

#[derive(Debug, Parser)]
#[command(name = "coordinator", about = "Run one pub/sub load-test experiment")]
struct Args {
    /// Experiment configuration file
    config: PathBuf,

    /// Run id; defaults to the file's `run_id` or a timestamp
    #[arg(long)]
    run_id: Option<String>,

    /// Kill leftover monitors and endpoints first
    #[arg(long)]
    kill: bool,

    /// Tree server URL; an in-process tree is used when unset
    #[arg(long, env = "TREE_ADDR")]
    tree_addr: Option<String>,

    /// Seconds to wait on each barrier before reporting what is pending
    #[arg(long)]
    timeout: Option<u64>,

    /// Run endpoints and monitors as in-process tasks
    #[arg(long)]
    simulate: bool,

    /// Keep the topics namespace during cleanup
    #[arg(long)]
    keep_topics: bool,

    /// Hosts spawned concurrently
    #[arg(long, default_value_t = 10)]
    parallelism: usize,

    /// Local parent of per-run log directories
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    #[arg(long, env = "SPAWN_CMD", default_value = "")]
    spawn_cmd: String,

    #[arg(long, env = "MONITORS_CMD", default_value = "")]
    monitors_cmd: String,

    #[arg(long, env = "KILL_CMD", default_value = "")]
    kill_cmd: String,

    #[arg(long, env = "CLEAN_LOGS_CMD", default_value = "")]
    clean_logs_cmd: String,

    #[arg(long, env = "COLLECT_LOGS_CMD", default_value = "")]
    collect_logs_cmd: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut experiment = ExperimentConfig::load(&args.config)?;
    if args.run_id.is_some() {
        experiment.run_id = args.run_id.clone();
    }
    let layout = TreeLayout::default();

    let (tree, connector): (Arc<dyn CoordinationTree>, Arc<dyn TreeConnector>) = match &args.tree_addr {
        Some(addr) => {
            let config = HttpTreeConfig {
                endpoint: addr.clone(),
                ..HttpTreeConfig::default()
            };
            let tree = HttpTree::connect(HttpTreeConfig {
                label: "coordinator".into(),
                ..config.clone()
            })
            .await?;
            let tree: Arc<dyn CoordinationTree> = Arc::new(tree);
            let connector: Arc<dyn TreeConnector> = Arc::new(config);
            (tree, connector)
        }
        None => {
            info!("No tree server configured, using an in-process tree");
            let memory = MemoryTree::new();
            let tree: Arc<dyn CoordinationTree> = Arc::new(memory.connect());
            let connector: Arc<dyn TreeConnector> = Arc::new(memory);
            (tree, connector)
        }
    };

    let launcher: Arc<dyn EndpointLauncher> = if args.simulate {
        Arc::new(SimulatedLauncher::new(
            connector,
            layout.clone(),
            SimulationConfig {
                log_root: args.log_dir.clone(),
                ..SimulationConfig::default()
            },
        ))
    } else {
        if args.tree_addr.is_none() {
            warn!("Remote endpoints cannot reach an in-process tree; set --tree-addr or --simulate");
        }
        Arc::new(CommandLauncher::new(LauncherConfig {
            spawn: args.spawn_cmd,
            monitors: args.monitors_cmd,
            kill: args.kill_cmd,
            clean_logs: args.clean_logs_cmd,
            collect_logs: args.collect_logs_cmd,
            log_root: args.log_dir,
        }))
    };

    let coordinator = ExperimentCoordinator::new(
        tree,
        launcher,
        experiment,
        CoordinatorConfig {
            layout,
            wait_timeout: args.timeout.map(Duration::from_secs),
            launch_parallelism: args.parallelism,
            kill_existing: args.kill,
            clean_topics: !args.keep_topics,
        },
    );

    tokio::select! {
        result = coordinator.run() => match result {
            Ok(report) => {
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
            Err(e) => {
                error!("Run {} failed: {}", coordinator.run_id(), e);
                Err(e.into())
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping run {}", coordinator.run_id());
            coordinator.stop().await?;
            Ok(())
        }
    }
}
