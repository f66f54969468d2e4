//! Experiment coordinator
//!
//! Sequences one run: clean the tree, lay out the run, start monitors,
//! start subscribers and wait for them, start publishers and wait for them,
//! wait until subscribers and monitors have left, collect logs. Owns the
//! tree connection and the watch dispatcher for the run.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::diagnostics::{self, Remaining};
use super::launcher::{spawn_in_batches, EndpointLauncher, SpawnRequest};
use crate::config::{BrokerKind, ClientId, EndpointKind, ExperimentConfig, RegionId, TopicCounts};
use crate::error::{CoordError, Result};
use crate::metrics::{self, standard};
use crate::protocol::{
    BarrierController, BarrierKind, RunPaths, RunState, TreeLayout, WatchDispatcher,
};
use crate::runtime::ShutdownSignal;
use crate::tree::CoordinationTree;

/// Configuration for the experiment coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Tree locations of runs and topics
    pub layout: TreeLayout,
    /// Per-barrier wait limit; `None` waits forever
    pub wait_timeout: Option<Duration>,
    /// Hosts spawned concurrently
    pub launch_parallelism: usize,
    /// Kill leftover monitors and endpoints before the run
    pub kill_existing: bool,
    /// Delete the topics namespace during cleanup
    pub clean_topics: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            layout: TreeLayout::default(),
            wait_timeout: None,
            launch_parallelism: 10,
            kill_existing: false,
            clean_topics: true,
        }
    }
}

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Created, nothing done yet
    Idle,
    /// Removing leftovers of earlier runs
    Cleaning,
    /// Run laid out, dispatcher running
    Ready,
    /// Starting processes
    Launching,
    /// Blocked on a barrier
    Waiting(BarrierKind),
    /// Copying logs back
    CollectingLogs,
    /// Tree connection closed
    Stopped,
}

/// Time spent blocked on one barrier
#[derive(Debug, Clone, Serialize)]
pub struct BarrierWait {
    pub barrier: BarrierKind,
    pub waited_ms: u64,
}

/// Summary of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub barrier_waits: Vec<BarrierWait>,
    pub subscribers_joined: usize,
    pub publishers_joined: usize,
    pub log_dir: PathBuf,
}

/// Drives one experiment run
pub struct ExperimentCoordinator {
    config: CoordinatorConfig,
    experiment: Arc<ExperimentConfig>,
    run_id: String,
    paths: RunPaths,
    tree: Arc<dyn CoordinationTree>,
    launcher: Arc<dyn EndpointLauncher>,
    barriers: Arc<BarrierController>,
    shutdown: ShutdownSignal,
    dispatcher: Mutex<Option<JoinHandle<Result<RunState>>>>,
    state: RwLock<CoordinatorState>,
}

impl ExperimentCoordinator {
    /// Create a coordinator for one run.
    ///
    /// The run id comes from the experiment file, or is generated from the
    /// current time.
    pub fn new(
        tree: Arc<dyn CoordinationTree>,
        launcher: Arc<dyn EndpointLauncher>,
        experiment: ExperimentConfig,
        config: CoordinatorConfig,
    ) -> Self {
        let run_id = experiment
            .run_id
            .clone()
            .unwrap_or_else(|| Utc::now().format("run-%Y%m%d-%H%M%S").to_string());
        let paths = config.layout.run(&run_id);
        let barriers = Arc::new(BarrierController::new(tree.clone(), paths.clone()));
        Self {
            config,
            experiment: Arc::new(experiment),
            run_id,
            paths,
            tree,
            launcher,
            barriers,
            shutdown: ShutdownSignal::new(),
            dispatcher: Mutex::new(None),
            state: RwLock::new(CoordinatorState::Idle),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    pub fn experiment(&self) -> &ExperimentConfig {
        &self.experiment
    }

    /// Signal that stops the dispatcher; `stop` triggers it
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub async fn state(&self) -> CoordinatorState {
        *self.state.read().await
    }

    async fn set_state(&self, state: CoordinatorState) {
        *self.state.write().await = state;
    }

    /// Whether this run has opened the barrier
    pub fn is_open(&self, barrier: BarrierKind) -> bool {
        self.barriers.is_open(barrier)
    }

    /// Kill leftovers if configured, delete every run and the topics
    /// namespace, and clean remote logs
    pub async fn clean(&self) -> Result<()> {
        self.set_state(CoordinatorState::Cleaning).await;
        let hosts = self.experiment.hosts();
        if self.config.kill_existing {
            info!("Killing leftover processes on {} hosts", hosts.len());
            self.launcher.kill_existing(&hosts).await?;
        }
        if self.tree.delete_if_exists(&self.config.layout.root, true).await? {
            info!("Deleted {}", self.config.layout.root);
        }
        if self.config.clean_topics
            && self
                .tree
                .delete_if_exists(&self.config.layout.topics_root, true)
                .await?
        {
            info!("Deleted {}", self.config.layout.topics_root);
        }
        self.launcher.clean_logs(&hosts).await?;
        Ok(())
    }

    /// Create the run's directories and barriers and start the dispatcher
    pub async fn setup(&self) -> Result<()> {
        if self.dispatcher.lock().is_some() {
            return Err(CoordError::internal(format!(
                "run {} is already set up",
                self.run_id
            )));
        }

        let clients = EndpointKind::ALL.into_iter().flat_map(|kind| {
            self.experiment
                .distribution(kind)
                .keys()
                .map(move |client| (kind, client))
        });
        let directories = self.paths.directories(clients);
        for dir in &directories {
            self.tree.ensure_path(dir).await?;
        }
        debug!("Created {} directories under {}", directories.len(), self.paths.base());
        self.barriers.install().await?;

        let dispatcher = WatchDispatcher::new(
            self.tree.clone(),
            self.paths.clone(),
            RunState::new(self.run_id.clone(), &self.experiment),
            self.barriers.clone(),
        );
        let shutdown = self.shutdown.clone();
        *self.dispatcher.lock() = Some(tokio::spawn(dispatcher.run(shutdown)));

        self.set_state(CoordinatorState::Ready).await;
        info!("Run {} set up under {}", self.run_id, self.paths.base());
        Ok(())
    }

    /// Create the registration directory of one client and return it
    pub async fn open_registration_path(
        &self,
        kind: EndpointKind,
        region: &RegionId,
        client: &ClientId,
    ) -> Result<String> {
        if client.region() != region {
            return Err(CoordError::InvalidClientId {
                client: client.to_string(),
                reason: format!("belongs to region {}, not {}", client.region(), region),
            });
        }
        let path = self.paths.client_registrations(kind, client);
        self.tree.ensure_path(&path).await?;
        Ok(path)
    }

    /// Block until a barrier opens.
    ///
    /// On timeout the error lists what the barrier is still waiting for.
    pub async fn wait(&self, barrier: BarrierKind) -> Result<()> {
        self.set_state(CoordinatorState::Waiting(barrier)).await;
        info!("Waiting for {} barrier", barrier);
        match self.barriers.wait(barrier, self.config.wait_timeout).await {
            Err(CoordError::BarrierTimeout {
                barrier: name,
                waited_secs,
                ..
            }) => {
                let pending = diagnostics::pending_for(
                    self.tree.as_ref(),
                    &self.paths,
                    &self.experiment,
                    barrier,
                )
                .await
                .unwrap_or_else(|e| vec![format!("unknown ({})", e)]);
                warn!("{} barrier still closed, pending: {}", barrier, pending.join(", "));
                Err(CoordError::BarrierTimeout {
                    barrier: name,
                    waited_secs,
                    pending,
                })
            }
            other => other,
        }
    }

    /// Clients and regions of `kind` that have not reported complete
    pub async fn remaining(&self, kind: EndpointKind) -> Result<Remaining> {
        diagnostics::remaining(self.tree.as_ref(), &self.paths, &self.experiment, kind).await
    }

    /// Spawn the missing endpoints of every client that has not completed.
    ///
    /// Returns the number of hosts spawned on.
    pub async fn relaunch_remaining(&self, kind: EndpointKind) -> Result<usize> {
        let remaining = self.remaining(kind).await?;
        let mut requests = Vec::new();
        for pending in &remaining.clients {
            let Some(expected) = self.experiment.distribution(kind).get(&pending.client) else {
                continue;
            };
            let registered = match self
                .tree
                .children(&self.paths.client_registrations(kind, &pending.client))
                .await
            {
                Ok(snapshot) => snapshot.children,
                Err(CoordError::MissingPath { .. }) => Vec::new(),
                Err(e) => return Err(e),
            };
            let missing = diagnostics::missing_topics(expected, &pending.client, &registered);
            if !missing.is_empty() {
                requests.push(self.spawn_request(kind, &pending.client, missing));
            }
        }

        let hosts = requests.len();
        if hosts == 0 {
            info!("No {} to relaunch", kind.plural());
            return Ok(0);
        }
        info!("Relaunching {} on {} hosts", kind.plural(), hosts);
        spawn_in_batches(&self.launcher, requests, self.config.launch_parallelism).await?;
        Ok(hosts)
    }

    fn spawn_request(&self, kind: EndpointKind, client: &ClientId, topics: TopicCounts) -> SpawnRequest {
        let sample_count = match kind {
            EndpointKind::Subscriber => self.experiment.sub_sample_count,
            EndpointKind::Publisher => self.experiment.pub_sample_count,
        };
        SpawnRequest {
            kind,
            host: client.clone(),
            topics,
            sample_count,
            send_interval_ms: self.experiment.sleep_interval_ms,
            run_id: self.run_id.clone(),
        }
    }

    async fn launch(&self, kind: EndpointKind) -> Result<()> {
        self.set_state(CoordinatorState::Launching).await;
        let requests = self
            .experiment
            .distribution(kind)
            .iter()
            .map(|(client, topics)| self.spawn_request(kind, client, topics.clone()))
            .collect();
        info!(
            "Starting {} {}",
            self.experiment.total_endpoints(kind),
            kind.plural()
        );
        spawn_in_batches(&self.launcher, requests, self.config.launch_parallelism).await
    }

    async fn start_monitors(&self) -> Result<()> {
        self.set_state(CoordinatorState::Launching).await;
        for broker in BrokerKind::ALL {
            let hosts = self.experiment.brokers(broker);
            if hosts.is_empty() {
                continue;
            }
            info!("Starting monitors on {} {} hosts", hosts.len(), broker);
            self.launcher
                .start_monitors(broker, hosts, &self.run_id)
                .await?;
        }
        Ok(())
    }

    async fn timed_wait(&self, barrier: BarrierKind, waits: &mut Vec<BarrierWait>) -> Result<()> {
        let started = Instant::now();
        self.wait(barrier).await?;
        waits.push(BarrierWait {
            barrier,
            waited_ms: started.elapsed().as_millis() as u64,
        });
        Ok(())
    }

    async fn run_phases(&self, waits: &mut Vec<BarrierWait>) -> Result<PathBuf> {
        self.clean().await?;
        self.setup().await?;
        self.start_monitors().await?;

        self.launch(EndpointKind::Subscriber).await?;
        self.timed_wait(BarrierKind::Subscriber, waits).await?;

        self.launch(EndpointKind::Publisher).await?;
        self.timed_wait(BarrierKind::Publisher, waits).await?;

        self.timed_wait(BarrierKind::Finished, waits).await?;
        self.timed_wait(BarrierKind::Monitoring, waits).await?;

        self.set_state(CoordinatorState::CollectingLogs).await;
        self.launcher
            .collect_logs(&self.run_id, &self.experiment.hosts())
            .await
    }

    /// Run the whole experiment and stop.
    ///
    /// The tree connection is closed whether or not the run succeeds.
    pub async fn run(&self) -> Result<RunReport> {
        let started_at = Utc::now();
        info!("Starting run {}", self.run_id);

        let mut waits = Vec::new();
        let outcome = self.run_phases(&mut waits).await;
        if let Err(e) = &outcome {
            error!("Run {} failed: {}", self.run_id, e);
        }
        let stopped = self.stop().await;

        let log_dir = outcome?;
        let final_state = stopped?;
        let joined = |kind: EndpointKind| {
            final_state.as_ref().map_or(0, |state| {
                let phases = state.phases();
                phases.endpoints(kind).count() - phases.awaiting_join(kind).len()
            })
        };

        let report = RunReport {
            run_id: self.run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            barrier_waits: waits,
            subscribers_joined: joined(EndpointKind::Subscriber),
            publishers_joined: joined(EndpointKind::Publisher),
            log_dir,
        };
        info!(
            "Run {} finished in {}s, logs in {}",
            self.run_id,
            (report.finished_at - report.started_at).num_seconds(),
            report.log_dir.display()
        );
        debug!("Metrics at end of run:\n{}", metrics::gather_system_metrics());
        Ok(report)
    }

    /// Stop the dispatcher and close the tree connection.
    ///
    /// Returns the dispatcher's final state if it ran and finished cleanly.
    pub async fn stop(&self) -> Result<Option<RunState>> {
        self.shutdown.shutdown();
        let handle = self.dispatcher.lock().take();
        let final_state = match handle {
            Some(handle) => match handle.await {
                Ok(Ok(state)) => Some(state),
                Ok(Err(e)) => {
                    warn!("Dispatcher for run {} ended with error: {}", self.run_id, e);
                    None
                }
                Err(e) => {
                    warn!("Dispatcher for run {} panicked: {}", self.run_id, e);
                    None
                }
            },
            None => None,
        };

        if self.state().await != CoordinatorState::Stopped {
            self.tree.close().await?;
            self.set_state(CoordinatorState::Stopped).await;
            info!(
                "Coordinator for run {} stopped ({} barriers opened in total)",
                self.run_id,
                standard::BARRIERS_OPENED.get()
            );
        }
        Ok(final_state)
    }

    /// Delete everything recorded under a run
    pub async fn teardown(&self, run_id: &str) -> Result<()> {
        let paths = self.config.layout.run(run_id);
        if self.tree.delete_if_exists(paths.base(), true).await? {
            info!("Tore down run {}", run_id);
        } else {
            debug!("Run {} has nothing to tear down", run_id);
        }
        Ok(())
    }
}
