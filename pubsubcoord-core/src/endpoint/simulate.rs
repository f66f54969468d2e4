//! In-process stand-ins for endpoint and monitor processes
//!
//! [`SimulatedLauncher`] runs every "process" as a tokio task with its own
//! tree session, so dry runs exercise the same registrations, barriers and
//! session expiry as real deployments.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::client::EndpointClient;
use crate::config::{BrokerKind, ClientId, EndpointKind};
use crate::coordinator::launcher::{EndpointLauncher, SpawnRequest};
use crate::error::{CoordError, Result};
use crate::protocol::{BarrierKind, TreeLayout};
use crate::tree::TreeConnector;

/// Timing of simulated processes
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Delay per simulated sample
    pub sample_interval: Duration,
    /// Upper bound on simulated samples per endpoint
    pub max_samples: u64,
    /// Give up waiting on a barrier after this long
    pub barrier_timeout: Option<Duration>,
    /// Where `collect_logs` creates run directories
    pub log_root: PathBuf,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(1),
            max_samples: 20,
            barrier_timeout: Some(Duration::from_secs(60)),
            log_root: std::env::temp_dir().join("pubsubcoord-logs"),
        }
    }
}

/// Launcher that runs endpoints and monitors as tasks
pub struct SimulatedLauncher {
    connector: Arc<dyn TreeConnector>,
    layout: TreeLayout,
    config: SimulationConfig,
    processes: Mutex<JoinSet<Result<()>>>,
    next_pid: AtomicU32,
}

impl SimulatedLauncher {
    pub fn new(connector: Arc<dyn TreeConnector>, layout: TreeLayout, config: SimulationConfig) -> Self {
        Self {
            connector,
            layout,
            config,
            processes: Mutex::new(JoinSet::new()),
            next_pid: AtomicU32::new(1000),
        }
    }

    fn start(&self, process: impl std::future::Future<Output = Result<()>> + Send + 'static) {
        self.processes.lock().spawn(process);
    }

    /// Wait for every simulated process to exit; returns the first error
    pub async fn wait_idle(&self) -> Result<()> {
        let mut processes = std::mem::take(&mut *self.processes.lock());
        let mut first_error = None;
        while let Some(joined) = processes.join_next().await {
            let result = joined
                .map_err(|e| CoordError::internal(format!("simulated process panicked: {}", e)))
                .and_then(|r| r);
            if let Err(e) = result {
                warn!("Simulated process failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn running(&self) -> usize {
        self.processes.lock().len()
    }
}

struct EndpointRun {
    kind: EndpointKind,
    client: ClientId,
    topic: String,
    pid: u32,
    samples: u64,
}

async fn run_endpoint(
    connector: Arc<dyn TreeConnector>,
    layout: TreeLayout,
    config: SimulationConfig,
    run_id: String,
    run: EndpointRun,
) -> Result<()> {
    let label = format!("{}-{}-{}", run.kind.segment(), run.client, run.pid);
    let tree = connector.connect(&label).await?;
    let endpoint = EndpointClient::new(tree, layout.run(&run_id));

    endpoint
        .register_endpoint(run.kind, &run.client, &run.topic, run.pid)
        .await?;
    // Publishers start sending once every publisher is up; subscribers keep
    // receiving until the publishers have sent their samples
    endpoint
        .wait_barrier(BarrierKind::Publisher, config.barrier_timeout)
        .await?;
    for _ in 0..run.samples {
        tokio::time::sleep(config.sample_interval).await;
        endpoint.state().record_sample();
    }
    if run.kind == EndpointKind::Subscriber {
        tokio::time::sleep(config.sample_interval * 2).await;
    }
    debug!(
        "{} {} done after {} samples",
        run.kind,
        label,
        endpoint.state().samples()
    );
    endpoint.close().await
}

async fn run_monitor(
    connector: Arc<dyn TreeConnector>,
    layout: TreeLayout,
    config: SimulationConfig,
    run_id: String,
    broker: BrokerKind,
    host: String,
) -> Result<()> {
    let tree = connector.connect(&format!("monitor-{}", host)).await?;
    let monitor = EndpointClient::new(tree, layout.run(&run_id));
    monitor.register_monitor(broker, &host).await?;
    monitor
        .wait_barrier(BarrierKind::Finished, config.barrier_timeout)
        .await?;
    monitor.close().await
}

#[async_trait]
impl EndpointLauncher for SimulatedLauncher {
    async fn spawn(&self, request: SpawnRequest) -> Result<()> {
        let samples = request.sample_count.min(self.config.max_samples);
        for (topic, count) in &request.topics {
            for _ in 0..*count {
                let run = EndpointRun {
                    kind: request.kind,
                    client: request.host.clone(),
                    topic: topic.clone(),
                    pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
                    samples,
                };
                self.start(run_endpoint(
                    self.connector.clone(),
                    self.layout.clone(),
                    self.config.clone(),
                    request.run_id.clone(),
                    run,
                ));
            }
        }
        debug!("Simulating {} on {}", request.kind.plural(), request.host);
        Ok(())
    }

    async fn start_monitors(&self, broker: BrokerKind, hosts: &[String], run_id: &str) -> Result<()> {
        for host in hosts {
            self.start(run_monitor(
                self.connector.clone(),
                self.layout.clone(),
                self.config.clone(),
                run_id.to_string(),
                broker,
                host.clone(),
            ));
        }
        Ok(())
    }

    async fn kill_existing(&self, _hosts: &[String]) -> Result<()> {
        let mut processes = self.processes.lock();
        if !processes.is_empty() {
            info!("Killing {} simulated processes", processes.len());
        }
        processes.abort_all();
        Ok(())
    }

    async fn clean_logs(&self, _hosts: &[String]) -> Result<()> {
        Ok(())
    }

    async fn collect_logs(&self, run_id: &str, _hosts: &[String]) -> Result<PathBuf> {
        let dir = self.config.log_root.join(run_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}
