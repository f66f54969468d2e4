//! Endpoint side of the rendezvous
//!
//! What a publisher, subscriber or monitor process does against the tree:
//! register an ephemeral node, wait for a barrier, deregister.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::state::{EndpointState, ProcessPhase};
use crate::config::{BrokerKind, ClientId, EndpointKind};
use crate::error::{CoordError, Result};
use crate::protocol::layout::{endpoint_node_name, RunPaths};
use crate::protocol::{wait_for_removal, BarrierKind};
use crate::tree::{CoordinationTree, CreateMode};

/// One endpoint process's view of a run
pub struct EndpointClient {
    tree: Arc<dyn CoordinationTree>,
    paths: RunPaths,
    state: Arc<EndpointState>,
}

impl EndpointClient {
    pub fn new(tree: Arc<dyn CoordinationTree>, paths: RunPaths) -> Self {
        Self {
            tree,
            paths,
            state: Arc::new(EndpointState::new()),
        }
    }

    /// Session owning this process's ephemeral registrations
    pub fn session_id(&self) -> &str {
        self.tree.session_id()
    }

    pub fn state(&self) -> &Arc<EndpointState> {
        &self.state
    }

    /// Register one endpoint of `kind` for `topic` on `client`
    pub async fn register_endpoint(
        &self,
        kind: EndpointKind,
        client: &ClientId,
        topic: &str,
        pid: u32,
    ) -> Result<String> {
        let path = format!(
            "{}/{}",
            self.paths.client_registrations(kind, client),
            endpoint_node_name(topic, client, pid)
        );
        self.tree.create(&path, CreateMode::Ephemeral).await?;
        debug!("Registered {} {}", kind, path);
        self.state.add_registration(path.clone()).await;
        Ok(path)
    }

    /// Register the monitor of one broker host
    pub async fn register_monitor(&self, broker: BrokerKind, host: &str) -> Result<String> {
        let path = self.paths.monitor_node(broker, host);
        self.tree.create(&path, CreateMode::Ephemeral).await?;
        info!("Registered {} monitor on {}", broker, host);
        self.state.add_registration(path.clone()).await;
        Ok(path)
    }

    /// Block until a barrier opens
    pub async fn wait_barrier(&self, barrier: BarrierKind, timeout: Option<Duration>) -> Result<()> {
        let path = self.paths.barrier(barrier);
        debug!("Waiting on {} barrier", barrier);
        let waiting = wait_for_removal(self.tree.as_ref(), &path);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, waiting).await {
                Ok(result) => result,
                Err(_) => Err(CoordError::BarrierTimeout {
                    barrier: barrier.to_string(),
                    waited_secs: limit.as_secs(),
                    pending: Vec::new(),
                }),
            },
            None => waiting.await,
        };
        let phase = if result.is_ok() {
            ProcessPhase::Running
        } else {
            ProcessPhase::Failed
        };
        self.state.set_phase(phase).await;
        result
    }

    /// Remove every registration this process created
    pub async fn deregister(&self) -> Result<()> {
        debug!(
            "Deregistering {} nodes of session {}",
            self.state.registration_count().await,
            self.session_id()
        );
        for path in self.state.take_registrations().await {
            self.tree.delete_if_exists(&path, false).await?;
            debug!("Deregistered {}", path);
        }
        self.state.set_phase(ProcessPhase::Finished).await;
        Ok(())
    }

    /// Deregister and close the session
    pub async fn close(&self) -> Result<()> {
        self.deregister().await?;
        self.tree.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TreeLayout;
    use crate::tree::MemoryTree;

    #[tokio::test]
    async fn test_register_and_deregister() {
        let tree = MemoryTree::new();
        let paths = TreeLayout::default().run("r");
        let client = ClientId::parse("cli1-1").unwrap();
        let endpoint = EndpointClient::new(Arc::new(tree.connect()), paths.clone());

        let path = endpoint
            .register_endpoint(EndpointKind::Subscriber, &client, "t1", 7)
            .await
            .unwrap();
        assert_eq!(path, "/experiment/r/sub/region_1/cli1-1/t1_cli1-1_7");
        assert_eq!(endpoint.state().phase().await, ProcessPhase::Registered);
        assert_eq!(endpoint.state().registration_count().await, 1);

        endpoint.deregister().await.unwrap();
        assert!(!tree.exists(&path).unwrap());
        assert_eq!(endpoint.state().registration_count().await, 0);
        assert_eq!(endpoint.state().phase().await, ProcessPhase::Finished);
    }

    #[tokio::test]
    async fn test_wait_returns_once_barrier_removed() {
        let tree = MemoryTree::new();
        let paths = TreeLayout::default().run("r");
        let controller = tree.connect();
        controller
            .ensure_path(&paths.barrier(BarrierKind::Publisher))
            .await
            .unwrap();

        let endpoint = EndpointClient::new(Arc::new(tree.connect()), paths.clone());
        let timed_out = endpoint
            .wait_barrier(BarrierKind::Publisher, Some(Duration::from_millis(30)))
            .await;
        assert!(matches!(timed_out, Err(CoordError::BarrierTimeout { .. })));
        assert_eq!(endpoint.state().phase().await, ProcessPhase::Failed);

        controller
            .delete(&paths.barrier(BarrierKind::Publisher), false)
            .await
            .unwrap();
        endpoint
            .wait_barrier(BarrierKind::Publisher, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(endpoint.state().phase().await, ProcessPhase::Running);
    }
}
