//! Tree service tests against a live server on a loopback port

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use pubsubcoord_core::config::ExperimentConfig;
use pubsubcoord_core::coordinator::{CoordinatorConfig, ExperimentCoordinator};
use pubsubcoord_core::endpoint::{SimulatedLauncher, SimulationConfig};
use pubsubcoord_core::protocol::{BarrierKind, TreeLayout};
use pubsubcoord_core::tree::{
    CoordinationTree, CreateMode, HttpTree, HttpTreeConfig, TreeServer, TreeServerConfig,
    WatchEventKind,
};
use pubsubcoord_core::{CoordError, ShutdownSignal};

struct Server {
    endpoint: String,
    shutdown: ShutdownSignal,
}

impl Server {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = ShutdownSignal::new();
        let server = TreeServer::new(TreeServerConfig {
            poll_timeout: Duration::from_millis(500),
            ..TreeServerConfig::default()
        });
        let signal = shutdown.clone();
        tokio::spawn(async move { server.serve_with_listener(listener, signal).await });
        Self { endpoint, shutdown }
    }

    fn config(&self, label: &str) -> HttpTreeConfig {
        HttpTreeConfig {
            endpoint: self.endpoint.clone(),
            label: label.to_string(),
            ..HttpTreeConfig::default()
        }
    }

    async fn connect(&self, label: &str) -> HttpTree {
        HttpTree::connect(self.config(label)).await.unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

#[tokio::test]
async fn test_node_round_trip() {
    let server = Server::start().await;
    let tree = server.connect("round-trip").await;

    tree.ensure_path("/experiment/r/sub/region_1").await.unwrap();
    tree.ensure_path("/experiment/r/sub/region_1").await.unwrap();
    tree.create("/experiment/r/sub/region_1/cli1-1", CreateMode::Persistent)
        .await
        .unwrap();
    assert!(matches!(
        tree.create("/experiment/r/sub/region_1/cli1-1", CreateMode::Persistent).await,
        Err(CoordError::NodeExists { .. })
    ));

    let snapshot = tree.children("/experiment/r/sub/region_1").await.unwrap();
    assert_eq!(snapshot.children, vec!["cli1-1".to_string()]);

    assert!(matches!(
        tree.delete("/experiment/r", false).await,
        Err(CoordError::NotEmpty { .. })
    ));
    assert!(matches!(
        tree.delete("/experiment/missing", false).await,
        Err(CoordError::MissingPath { .. })
    ));
    assert!(matches!(
        tree.exists("no-slash").await,
        Err(CoordError::InvalidPath { .. })
    ));

    tree.delete("/experiment", true).await.unwrap();
    assert!(!tree.exists("/experiment").await.unwrap());
    tree.close().await.unwrap();
}

#[tokio::test]
async fn test_watches_fire_across_sessions() {
    let server = Server::start().await;
    let watcher = server.connect("watcher").await;
    let writer = server.connect("writer").await;

    watcher.ensure_path("/runs/r/pub").await.unwrap();
    watcher.ensure_path("/runs/r/barriers/pub").await.unwrap();

    // Outlives at least one empty long poll
    let (snapshot, token) = watcher.watch_children("/runs/r/pub").await.unwrap();
    assert!(snapshot.is_empty());
    let fired = tokio::spawn(token);
    tokio::time::sleep(Duration::from_millis(700)).await;
    writer
        .create("/runs/r/pub/t1_cli1-1_9", CreateMode::Ephemeral)
        .await
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), fired)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, WatchEventKind::ChildrenChanged);

    let (exists, token) = watcher.watch_node("/runs/r/barriers/pub").await.unwrap();
    assert!(exists);
    writer.delete("/runs/r/barriers/pub", false).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, WatchEventKind::NodeDeleted);

    watcher.close().await.unwrap();
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_close_removes_ephemeral_nodes() {
    let server = Server::start().await;
    let observer = server.connect("observer").await;
    let endpoint = server.connect("endpoint").await;

    endpoint
        .create("/experiment/r/monitoring/eb/monitor_eb1", CreateMode::Ephemeral)
        .await
        .unwrap();
    assert!(observer
        .exists("/experiment/r/monitoring/eb/monitor_eb1")
        .await
        .unwrap());

    endpoint.close().await.unwrap();
    assert!(!observer
        .exists("/experiment/r/monitoring/eb/monitor_eb1")
        .await
        .unwrap());
    assert!(observer.exists("/experiment/r/monitoring/eb").await.unwrap());
    assert!(matches!(
        endpoint.exists("/experiment").await,
        Err(CoordError::SessionExpired { .. })
    ));
    observer.close().await.unwrap();
}

#[tokio::test]
async fn test_health_and_metrics_endpoints() {
    let server = Server::start().await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("{}/healthz", server.endpoint))
        .send()
        .await
        .unwrap();
    assert!(health.status().is_success());

    let metrics = client
        .get(format!("{}/metrics", server.endpoint))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("pubsubcoord_open_sessions"));
}

#[tokio::test]
async fn test_simulated_run_over_http() {
    let server = Server::start().await;
    let logs = tempfile::tempdir().unwrap();
    let experiment = ExperimentConfig::parse(
        "ebs:eb1
clients:cli1-1,cli2-1
topics:t1
sub_distribution:cli1-1:t1:2,cli2-1:t1:1
pub_distribution:cli2-1:t1:1
run_id:over-http",
    )
    .unwrap();

    let launcher = Arc::new(SimulatedLauncher::new(
        Arc::new(server.config("simulated")),
        TreeLayout::default(),
        SimulationConfig {
            max_samples: 3,
            log_root: logs.path().to_path_buf(),
            ..SimulationConfig::default()
        },
    ));
    let coordinator = ExperimentCoordinator::new(
        Arc::new(server.connect("coordinator").await),
        launcher.clone(),
        experiment,
        CoordinatorConfig {
            wait_timeout: Some(Duration::from_secs(20)),
            ..CoordinatorConfig::default()
        },
    );

    let report = coordinator.run().await.unwrap();
    launcher.wait_idle().await.unwrap();
    assert_eq!(report.barrier_waits.len(), 4);
    assert!(BarrierKind::ALL.iter().all(|b| coordinator.is_open(*b)));
}
