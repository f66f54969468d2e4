//! Which clients, regions and monitors a run is still waiting on
//!
//! Computed from the tree rather than from dispatcher state, so it can be
//! queried from any process with a session.

use serde::Serialize;

use crate::config::{BrokerKind, ClientId, EndpointKind, ExperimentConfig, RegionId, TopicCounts};
use crate::error::{CoordError, Result};
use crate::protocol::{BarrierKind, RunPaths};
use crate::tree::CoordinationTree;

/// A client whose endpoints have not all registered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingClient {
    pub client: ClientId,
    pub registered: usize,
    pub expected: usize,
}

/// Outstanding clients and regions for one endpoint kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Remaining {
    pub kind: EndpointKind,
    pub clients: Vec<PendingClient>,
    pub regions: Vec<RegionId>,
}

impl Remaining {
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty() && self.regions.is_empty()
    }

    /// Human-readable entries, clients first
    pub fn labels(&self) -> Vec<String> {
        let clients = self.clients.iter().map(|p| {
            format!("{} ({}/{} {})", p.client, p.registered, p.expected, self.kind.plural())
        });
        let regions = self.regions.iter().map(|r| format!("region {}", r));
        clients.chain(regions).collect()
    }
}

async fn child_count(tree: &dyn CoordinationTree, path: &str) -> Result<usize> {
    match tree.children(path).await {
        Ok(snapshot) => Ok(snapshot.len()),
        Err(CoordError::MissingPath { .. }) => Ok(0),
        Err(e) => Err(e),
    }
}

/// Clients without a completion marker and regions without a joined marker
pub async fn remaining(
    tree: &dyn CoordinationTree,
    paths: &RunPaths,
    config: &ExperimentConfig,
    kind: EndpointKind,
) -> Result<Remaining> {
    let mut clients = Vec::new();
    for (client, expected) in config.endpoint_counts(kind) {
        if tree.exists(&paths.client_marker(kind, &client)).await? {
            continue;
        }
        let registered = child_count(tree, &paths.client_registrations(kind, &client)).await?;
        clients.push(PendingClient {
            client,
            registered,
            expected: expected as usize,
        });
    }

    let mut regions = Vec::new();
    for region in config.region_membership(kind).into_keys() {
        if !tree.exists(&paths.region_marker(kind, &region)).await? {
            regions.push(region);
        }
    }

    Ok(Remaining {
        kind,
        clients,
        regions,
    })
}

/// Per-topic endpoints of `client` that are configured but not registered.
///
/// Registration names are `{topic}_{client}_{pid}`; names that do not
/// parse are ignored.
pub fn missing_topics(expected: &TopicCounts, client: &ClientId, registered: &[String]) -> TopicCounts {
    let marker = format!("_{}_", client.host());
    let mut missing = expected.clone();
    for name in registered {
        let Some(split) = name.rfind(&marker) else {
            continue;
        };
        if let Some(count) = missing.get_mut(&name[..split]) {
            *count = count.saturating_sub(1);
        }
    }
    missing.retain(|_, count| *count > 0);
    missing
}

/// Clients that still have subscribers registered
pub async fn still_registered(
    tree: &dyn CoordinationTree,
    paths: &RunPaths,
    config: &ExperimentConfig,
    kind: EndpointKind,
) -> Result<Vec<(ClientId, usize)>> {
    let mut registered = Vec::new();
    for client in config.distribution(kind).keys() {
        let count = child_count(tree, &paths.client_registrations(kind, client)).await?;
        if count > 0 {
            registered.push((client.clone(), count));
        }
    }
    Ok(registered)
}

/// Monitor registrations still present, as `eb/monitor_<host>`
pub async fn running_monitors(tree: &dyn CoordinationTree, paths: &RunPaths) -> Result<Vec<String>> {
    let mut running = Vec::new();
    for broker in BrokerKind::ALL {
        match tree.children(&paths.monitors(broker)).await {
            Ok(snapshot) => running.extend(
                snapshot
                    .children
                    .into_iter()
                    .map(|name| format!("{}/{}", broker.segment(), name)),
            ),
            Err(CoordError::MissingPath { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(running)
}

/// What a barrier is still waiting for
pub async fn pending_for(
    tree: &dyn CoordinationTree,
    paths: &RunPaths,
    config: &ExperimentConfig,
    barrier: BarrierKind,
) -> Result<Vec<String>> {
    match barrier {
        BarrierKind::Subscriber => Ok(remaining(tree, paths, config, EndpointKind::Subscriber)
            .await?
            .labels()),
        BarrierKind::Publisher => Ok(remaining(tree, paths, config, EndpointKind::Publisher)
            .await?
            .labels()),
        BarrierKind::Finished => Ok(still_registered(tree, paths, config, EndpointKind::Subscriber)
            .await?
            .into_iter()
            .map(|(client, count)| format!("{} ({} subscribers registered)", client, count))
            .collect()),
        BarrierKind::Monitoring => running_monitors(tree, paths).await,
    }
}
