//! Starting and stopping experiment processes
//!
//! [`EndpointLauncher`] is the seam to whatever actually runs processes on
//! remote hosts. [`CommandLauncher`] fills shell command templates and runs
//! them locally, which is how playbook-driven setups plug in.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{BrokerKind, ClientId, EndpointKind, TopicCounts};
use crate::error::{CoordError, Result};

/// Parameters for starting one client's endpoints of one kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnRequest {
    pub kind: EndpointKind,
    pub host: ClientId,
    /// Endpoints to start per topic
    pub topics: TopicCounts,
    /// Samples to send (publishers) or receive (subscribers)
    pub sample_count: u64,
    /// Publisher send interval in milliseconds
    pub send_interval_ms: u64,
    pub run_id: String,
}

/// Remote process control used by the coordinator
#[async_trait]
pub trait EndpointLauncher: Send + Sync {
    /// Start the endpoints described by `request`
    async fn spawn(&self, request: SpawnRequest) -> Result<()>;

    /// Start a monitor on every broker host of one type
    async fn start_monitors(&self, broker: BrokerKind, hosts: &[String], run_id: &str)
        -> Result<()>;

    /// Kill monitors and endpoints left over from earlier runs
    async fn kill_existing(&self, hosts: &[String]) -> Result<()>;

    /// Remove log files from every host
    async fn clean_logs(&self, hosts: &[String]) -> Result<()>;

    /// Copy logs of a run into a local directory and return it
    async fn collect_logs(&self, run_id: &str, hosts: &[String]) -> Result<PathBuf>;
}

/// Spawn requests in batches of `parallelism`, each batch concurrently.
///
/// Requests are sorted by host first. The first failure aborts the
/// remaining batches.
pub async fn spawn_in_batches(
    launcher: &Arc<dyn EndpointLauncher>,
    mut requests: Vec<SpawnRequest>,
    parallelism: usize,
) -> Result<()> {
    requests.sort_by(|a, b| a.host.cmp(&b.host));
    let total = requests.len();
    for (index, batch) in requests.chunks(parallelism.max(1)).enumerate() {
        debug!("Spawning batch {} ({} hosts)", index, batch.len());
        let mut spawns = JoinSet::new();
        for request in batch.iter().cloned() {
            let launcher = launcher.clone();
            spawns.spawn(async move { launcher.spawn(request).await });
        }
        while let Some(joined) = spawns.join_next().await {
            joined.map_err(|e| CoordError::internal(format!("spawn task panicked: {}", e)))??;
        }
    }
    info!("Spawned endpoints on {} hosts", total);
    Ok(())
}

/// Shell command templates
///
/// Placeholders: `{kind}`, `{host}`, `{topics}` (JSON object), `{sample_count}`,
/// `{send_interval}`, `{run_id}`, `{broker}`, `{hosts}` (comma separated),
/// `{log_dir}`. An empty template skips that step.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub spawn: String,
    pub monitors: String,
    pub kill: String,
    pub clean_logs: String,
    pub collect_logs: String,
    /// Local parent of per-run log directories
    pub log_root: PathBuf,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            spawn: String::new(),
            monitors: String::new(),
            kill: String::new(),
            clean_logs: String::new(),
            collect_logs: String::new(),
            log_root: PathBuf::from("logs"),
        }
    }
}

/// Runs filled-in command templates through `sh -c`
pub struct CommandLauncher {
    config: LauncherConfig,
}

impl CommandLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    async fn run(&self, step: &str, template: &str, vars: &BTreeMap<&str, String>, host: &str) -> Result<()> {
        if template.is_empty() {
            debug!("No {} command configured, skipping", step);
            return Ok(());
        }
        let command = fill(template, vars);
        debug!("Running {} command: {}", step, command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .await
            .map_err(|e| CoordError::LaunchFailed {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("{} command failed on {}: {}", step, host, stderr.trim());
            Err(CoordError::LaunchFailed {
                host: host.to_string(),
                reason: format!("{} exited with {}", step, output.status),
            })
        }
    }
}

/// Substitute `{name}` placeholders
pub fn fill(template: &str, vars: &BTreeMap<&str, String>) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}

#[async_trait]
impl EndpointLauncher for CommandLauncher {
    async fn spawn(&self, request: SpawnRequest) -> Result<()> {
        let topics = serde_json::to_string(&request.topics)
            .map_err(|e| CoordError::internal(e.to_string()))?;
        let vars = BTreeMap::from([
            ("kind", request.kind.segment().to_string()),
            ("host", request.host.to_string()),
            ("topics", topics),
            ("sample_count", request.sample_count.to_string()),
            ("send_interval", request.send_interval_ms.to_string()),
            ("run_id", request.run_id.clone()),
        ]);
        self.run("spawn", &self.config.spawn, &vars, request.host.host())
            .await
    }

    async fn start_monitors(
        &self,
        broker: BrokerKind,
        hosts: &[String],
        run_id: &str,
    ) -> Result<()> {
        if hosts.is_empty() {
            return Ok(());
        }
        let vars = BTreeMap::from([
            ("broker", broker.segment().to_string()),
            ("hosts", hosts.join(",")),
            ("run_id", run_id.to_string()),
        ]);
        self.run("monitors", &self.config.monitors, &vars, &hosts.join(","))
            .await
    }

    async fn kill_existing(&self, hosts: &[String]) -> Result<()> {
        let vars = BTreeMap::from([("hosts", hosts.join(","))]);
        self.run("kill", &self.config.kill, &vars, &hosts.join(","))
            .await
    }

    async fn clean_logs(&self, hosts: &[String]) -> Result<()> {
        let vars = BTreeMap::from([("hosts", hosts.join(","))]);
        self.run("clean_logs", &self.config.clean_logs, &vars, &hosts.join(","))
            .await
    }

    async fn collect_logs(&self, run_id: &str, hosts: &[String]) -> Result<PathBuf> {
        let log_dir = self.config.log_root.join(run_id);
        tokio::fs::create_dir_all(&log_dir).await?;
        let vars = BTreeMap::from([
            ("hosts", hosts.join(",")),
            ("run_id", run_id.to_string()),
            ("log_dir", log_dir.display().to_string()),
        ]);
        self.run("collect_logs", &self.config.collect_logs, &vars, &hosts.join(","))
            .await?;
        Ok(log_dir)
    }
}
