//! Stress tests for the rendezvous under many concurrent endpoints
//!
//! Run with: cargo test --release --test stress_rendezvous -- --nocapture

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use pubsubcoord_core::config::{ClientId, EndpointKind, ExperimentConfig};
use pubsubcoord_core::endpoint::EndpointClient;
use pubsubcoord_core::protocol::{
    BarrierController, BarrierKind, RunPaths, RunState, TreeLayout, WatchDispatcher,
};
use pubsubcoord_core::tree::{CoordinationTree, MemoryTree};
use pubsubcoord_core::ShutdownSignal;

/// `regions` regions of `clients` clients, each running `per_client` subscribers
fn fleet(regions: usize, clients: usize, per_client: u32) -> ExperimentConfig {
    let hosts: Vec<String> = (1..=regions)
        .flat_map(|r| (1..=clients).map(move |c| format!("cli{}-{}", r, c)))
        .collect();
    let subs: Vec<String> = hosts
        .iter()
        .map(|h| format!("{}:t1:{}", h, per_client))
        .collect();
    ExperimentConfig::parse(&format!(
        "clients:{}\ntopics:t1\nsub_distribution:{}\npub_distribution:{}:t1:1",
        hosts.join(","),
        subs.join(","),
        hosts[0]
    ))
    .unwrap()
}

struct Run {
    tree: Arc<MemoryTree>,
    paths: RunPaths,
    barriers: Arc<BarrierController>,
    shutdown: ShutdownSignal,
}

async fn start_run(config: &ExperimentConfig) -> Run {
    let tree = MemoryTree::new();
    let session: Arc<dyn CoordinationTree> = Arc::new(tree.connect());
    let paths = TreeLayout::default().run("stress");
    let clients = EndpointKind::ALL
        .into_iter()
        .flat_map(|kind| config.distribution(kind).keys().map(move |c| (kind, c)));
    for dir in paths.directories(clients) {
        session.ensure_path(&dir).await.unwrap();
    }

    let barriers = Arc::new(BarrierController::new(session.clone(), paths.clone()));
    barriers.install().await.unwrap();
    let dispatcher = WatchDispatcher::new(
        session,
        paths.clone(),
        RunState::new("stress", config),
        barriers.clone(),
    );
    let shutdown = ShutdownSignal::new();
    tokio::spawn(dispatcher.run(shutdown.clone()));

    Run {
        tree,
        paths,
        barriers,
        shutdown,
    }
}

/// Register subscribers concurrently, at most `limit` per client and topic
async fn register(run: &Run, config: &ExperimentConfig, limit: u32) -> Vec<Arc<EndpointClient>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    for (client, topics) in config.distribution(EndpointKind::Subscriber) {
        for (topic, count) in topics {
            for pid in 0..(*count).min(limit) {
                let tx = tx.clone();
                let tree = run.tree.clone();
                let paths = run.paths.clone();
                let client: ClientId = client.clone();
                let topic = topic.clone();
                tokio::spawn(async move {
                    let endpoint = EndpointClient::new(Arc::new(tree.connect()), paths);
                    endpoint
                        .register_endpoint(EndpointKind::Subscriber, &client, &topic, pid)
                        .await
                        .unwrap();
                    let _ = tx.send(Arc::new(endpoint));
                });
            }
        }
    }
    drop(tx);

    let mut endpoints = Vec::new();
    while let Some(endpoint) = rx.recv().await {
        endpoints.push(endpoint);
    }
    endpoints
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_concurrent_join_and_leave() {
    let config = fleet(8, 25, 4);
    let total = config.total_endpoints(EndpointKind::Subscriber);
    let run = start_run(&config).await;

    let start = Instant::now();
    let endpoints = register(&run, &config, u32::MAX).await;
    assert_eq!(endpoints.len(), total as usize);
    run.barriers
        .wait(BarrierKind::Subscriber, Some(Duration::from_secs(30)))
        .await
        .unwrap();
    let joined = start.elapsed();

    let start = Instant::now();
    let mut leaving = Vec::new();
    for endpoint in endpoints {
        leaving.push(tokio::spawn(async move { endpoint.close().await }));
    }
    for handle in leaving {
        handle.await.unwrap().unwrap();
    }
    run.barriers
        .wait(BarrierKind::Finished, Some(Duration::from_secs(30)))
        .await
        .unwrap();
    let left = start.elapsed();

    println!("Rendezvous stress test:");
    println!("  Endpoints: {}", total);
    println!("  Join barrier after: {:?}", joined);
    println!("  Finished barrier after: {:?}", left);

    assert!(run.barriers.is_open(BarrierKind::Subscriber));
    assert!(run.barriers.is_open(BarrierKind::Finished));
    assert!(!run.barriers.is_open(BarrierKind::Publisher));
    run.shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_churn_before_join() {
    let config = fleet(4, 10, 3);
    let run = start_run(&config).await;

    // Every client gets partway, drops out, and retries
    for _ in 0..3 {
        let partial = register(&run, &config, 2).await;
        for endpoint in &partial {
            endpoint.close().await.unwrap();
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!run.barriers.is_open(BarrierKind::Subscriber));
    assert!(!run.barriers.is_open(BarrierKind::Finished));

    let _endpoints = register(&run, &config, u32::MAX).await;
    run.barriers
        .wait(BarrierKind::Subscriber, Some(Duration::from_secs(30)))
        .await
        .unwrap();
    run.shutdown.shutdown();
}
