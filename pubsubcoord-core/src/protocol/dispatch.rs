//! Serial watch dispatch
//!
//! Every children watch of a run is armed from, and fires into, one task.
//! Fired tokens are forwarded over a channel and handled one at a time, so
//! [`RunState`] needs no lock. A handled watch is re-armed by taking a fresh
//! snapshot together with a new token, which means a change that lands
//! between two fires is always seen by the next snapshot.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::barrier::BarrierController;
use super::layout::RunPaths;
use super::state::{Effect, Outcome, RunState, WatchAction};
use crate::config::{BrokerKind, ClientId, EndpointKind};
use crate::error::{CoordError, Result};
use crate::metrics::standard;
use crate::runtime::ShutdownSignal;
use crate::tree::{ChildrenSnapshot, CoordinationTree, CreateMode, WatchEvent};

/// What a children watch is observing
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchKey {
    /// One client's endpoint registrations
    Endpoints { kind: EndpointKind, client: ClientId },
    /// Region markers of one endpoint kind
    Joined(EndpointKind),
    /// Monitor registrations of one broker type
    Monitors(BrokerKind),
}

struct Fired {
    key: WatchKey,
    result: Result<WatchEvent>,
}

/// Owns [`RunState`] and the watches feeding it
pub struct WatchDispatcher {
    tree: Arc<dyn CoordinationTree>,
    paths: RunPaths,
    state: RunState,
    barriers: Arc<BarrierController>,
    fired_tx: mpsc::UnboundedSender<Fired>,
    fired_rx: mpsc::UnboundedReceiver<Fired>,
    tokens: JoinSet<()>,
    armed: usize,
}

impl WatchDispatcher {
    pub fn new(
        tree: Arc<dyn CoordinationTree>,
        paths: RunPaths,
        state: RunState,
        barriers: Arc<BarrierController>,
    ) -> Self {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        Self {
            tree,
            paths,
            state,
            barriers,
            fired_tx,
            fired_rx,
            tokens: JoinSet::new(),
            armed: 0,
        }
    }

    /// Every watch the run starts with
    pub fn keys(&self) -> Vec<WatchKey> {
        let mut keys = Vec::new();
        for kind in EndpointKind::ALL {
            keys.extend(self.state.phases().endpoints(kind).map(|t| WatchKey::Endpoints {
                kind,
                client: t.client().clone(),
            }));
            keys.push(WatchKey::Joined(kind));
        }
        keys.extend(BrokerKind::ALL.into_iter().map(WatchKey::Monitors));
        keys
    }

    fn path(&self, key: &WatchKey) -> String {
        match key {
            WatchKey::Endpoints { kind, client } => self.paths.client_registrations(*kind, client),
            WatchKey::Joined(kind) => self.paths.joined(*kind),
            WatchKey::Monitors(broker) => self.paths.monitors(*broker),
        }
    }

    /// Run until every watch has stopped, shutdown, or a fatal error.
    ///
    /// A fatal error aborts the barrier controller so waiters return
    /// instead of hanging. The final state is returned for reporting.
    pub async fn run(mut self, shutdown: ShutdownSignal) -> Result<RunState> {
        info!("Watch dispatcher started for run {}", self.state.run_id());
        match self.dispatch(&shutdown).await {
            Ok(()) => {
                info!("Watch dispatcher for run {} finished", self.state.run_id());
                Ok(self.state)
            }
            Err(e) => {
                error!("Watch dispatcher for run {} failed: {}", self.state.run_id(), e);
                self.barriers.abort(e.to_string());
                Err(e)
            }
        }
    }

    async fn dispatch(&mut self, shutdown: &ShutdownSignal) -> Result<()> {
        let mut stop = shutdown.subscribe();
        if shutdown.is_triggered() {
            return Ok(());
        }

        let initial = self.state.initial_effects();
        self.apply(initial).await?;
        for key in self.keys() {
            self.arm(key).await?;
        }

        while self.armed > 0 {
            let fired = tokio::select! {
                fired = self.fired_rx.recv() => fired,
                _ = stop.recv() => None,
            };
            let Some(fired) = fired else {
                info!("Watch dispatcher stopping with {} watches armed", self.armed);
                break;
            };
            self.armed -= 1;
            while self.tokens.try_join_next().is_some() {}
            standard::WATCH_FIRES.inc();

            let event = fired.result?;
            debug!("Watch on {} fired: {:?}", event.path, event.kind);
            self.arm(fired.key).await?;
        }

        self.tokens.abort_all();
        Ok(())
    }

    /// Snapshot, handle, and arm the next token if the handler asks for it
    async fn arm(&mut self, key: WatchKey) -> Result<()> {
        let path = self.path(&key);
        let (snapshot, token) = match self.tree.watch_children(&path).await {
            Ok(armed) => armed,
            Err(CoordError::MissingPath { .. }) => {
                debug!("Watched path {} is gone, dropping its watch", path);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let outcome = self.handle(&key, &snapshot);
        self.apply(outcome.effects).await?;

        if outcome.action == WatchAction::Rearm {
            let fired_tx = self.fired_tx.clone();
            self.armed += 1;
            self.tokens.spawn(async move {
                let result = token.await;
                let _ = fired_tx.send(Fired { key, result });
            });
        } else {
            debug!("Stopped watching {}", path);
        }
        Ok(())
    }

    fn handle(&mut self, key: &WatchKey, snapshot: &ChildrenSnapshot) -> Outcome {
        match key {
            WatchKey::Endpoints { kind, client } => {
                self.state.on_endpoints(*kind, client, snapshot.len())
            }
            WatchKey::Joined(kind) => self.state.on_joined(*kind, snapshot.len()),
            WatchKey::Monitors(broker) => {
                self.state
                    .on_monitors(*broker, snapshot.len(), snapshot.cversion)
            }
        }
    }

    async fn apply(&self, effects: Vec<Effect>) -> Result<()> {
        for effect in effects {
            match effect {
                Effect::MarkClient { kind, client } => {
                    self.mark(&self.paths.client_marker(kind, &client)).await?;
                }
                Effect::UnmarkClient { kind, client } => {
                    self.tree
                        .delete_if_exists(&self.paths.client_marker(kind, &client), true)
                        .await?;
                }
                Effect::MarkRegion { kind, region } => {
                    self.mark(&self.paths.region_marker(kind, &region)).await?;
                }
                Effect::UnmarkRegion { kind, region } => {
                    self.tree
                        .delete_if_exists(&self.paths.region_marker(kind, &region), true)
                        .await?;
                }
                Effect::OpenBarrier(barrier) => {
                    self.barriers.open(barrier).await?;
                }
            }
        }
        Ok(())
    }

    async fn mark(&self, path: &str) -> Result<()> {
        match self.tree.create(path, CreateMode::Persistent).await {
            Ok(()) | Err(CoordError::NodeExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
