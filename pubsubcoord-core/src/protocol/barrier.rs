//! Run barriers
//!
//! A barrier is a tree node whose existence blocks waiters. The controller
//! opens a barrier by deleting its node, at most once per run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::layout::RunPaths;
use crate::config::EndpointKind;
use crate::error::{CoordError, Result};
use crate::metrics::standard;
use crate::tree::{CoordinationTree, CreateMode};

/// The four barriers of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarrierKind {
    /// Every subscriber registered
    #[serde(rename = "sub")]
    Subscriber,
    /// Every publisher registered
    #[serde(rename = "pub")]
    Publisher,
    /// Every subscriber deregistered
    Finished,
    /// Every broker monitor exited
    Monitoring,
}

impl BarrierKind {
    pub const ALL: [BarrierKind; 4] = [
        BarrierKind::Subscriber,
        BarrierKind::Publisher,
        BarrierKind::Finished,
        BarrierKind::Monitoring,
    ];

    pub fn segment(self) -> &'static str {
        match self {
            BarrierKind::Subscriber => "sub",
            BarrierKind::Publisher => "pub",
            BarrierKind::Finished => "finished",
            BarrierKind::Monitoring => "monitoring",
        }
    }

    /// Barrier that opens when every endpoint of `kind` has joined
    pub fn joined(kind: EndpointKind) -> Self {
        match kind {
            EndpointKind::Subscriber => BarrierKind::Subscriber,
            EndpointKind::Publisher => BarrierKind::Publisher,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for BarrierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

impl FromStr for BarrierKind {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        BarrierKind::ALL
            .into_iter()
            .find(|kind| kind.segment() == s)
            .ok_or_else(|| CoordError::InvalidConfig {
                reason: format!("unknown barrier {:?}", s),
            })
    }
}

/// Owns the barrier nodes of one run
pub struct BarrierController {
    tree: Arc<dyn CoordinationTree>,
    paths: RunPaths,
    opened: [AtomicBool; 4],
    /// Set once when the dispatcher fails, observed by waiters
    abort: watch::Sender<Option<String>>,
}

impl BarrierController {
    pub fn new(tree: Arc<dyn CoordinationTree>, paths: RunPaths) -> Self {
        let (abort, _) = watch::channel(None);
        Self {
            tree,
            paths,
            opened: Default::default(),
            abort,
        }
    }

    pub fn path(&self, kind: BarrierKind) -> String {
        self.paths.barrier(kind)
    }

    /// Create all four barrier nodes, closed
    pub async fn install(&self) -> Result<()> {
        for kind in BarrierKind::ALL {
            match self.tree.create(&self.path(kind), CreateMode::Persistent).await {
                Ok(()) | Err(CoordError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
            self.opened[kind.index()].store(false, Ordering::SeqCst);
        }
        info!("Installed barriers under {}", self.paths.barriers());
        Ok(())
    }

    /// Open a barrier. Returns false if it was already opened this run.
    pub async fn open(&self, kind: BarrierKind) -> Result<bool> {
        if self.opened[kind.index()].swap(true, Ordering::SeqCst) {
            standard::DUPLICATE_TRANSITIONS.inc();
            debug!("Barrier {} already open, ignoring", kind);
            return Ok(false);
        }
        if !self.tree.delete_if_exists(&self.path(kind), false).await? {
            warn!("Barrier node {} was already gone", self.path(kind));
        }
        standard::BARRIERS_OPENED.inc();
        info!("Opened {} barrier", kind);
        Ok(true)
    }

    /// Whether this controller has opened the barrier
    pub fn is_open(&self, kind: BarrierKind) -> bool {
        self.opened[kind.index()].load(Ordering::SeqCst)
    }

    /// Mark the run as failed; every current and future waiter returns
    /// `RunAborted`
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.abort.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    fn check_aborted(&self) -> Result<()> {
        match &*self.abort.borrow() {
            Some(reason) => Err(CoordError::RunAborted {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Block until this controller opens the barrier.
    ///
    /// Returns immediately if it is already open. A barrier node deleted
    /// by anything else, such as a teardown, fails with `RunAborted`. With
    /// a timeout, fails
    /// with `BarrierTimeout`; the pending list is left for the caller to
    /// fill in.
    pub async fn wait(&self, kind: BarrierKind, timeout: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        let waiting = self.wait_absent(kind);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, waiting).await {
                Ok(result) => result,
                Err(_) => Err(CoordError::BarrierTimeout {
                    barrier: kind.to_string(),
                    waited_secs: limit.as_secs(),
                    pending: Vec::new(),
                }),
            },
            None => waiting.await,
        };
        if result.is_ok() {
            standard::BARRIER_WAIT_DURATION.observe_duration(started.elapsed());
        }
        result
    }

    async fn wait_absent(&self, kind: BarrierKind) -> Result<()> {
        let path = self.path(kind);
        let mut aborted = self.abort.subscribe();
        self.check_aborted()?;
        tokio::select! {
            result = wait_for_removal(self.tree.as_ref(), &path) => {
                result?;
                if self.is_open(kind) {
                    return Ok(());
                }
                self.check_aborted()?;
                warn!("Barrier node {} removed without being opened", path);
                Err(CoordError::RunAborted {
                    reason: format!("{} barrier removed without opening", kind),
                })
            }
            changed = aborted.changed() => match changed {
                Ok(()) => self.check_aborted(),
                Err(_) => Err(CoordError::ShutdownInProgress),
            },
        }
    }
}

/// Block until `path` does not exist, using existence watches
pub async fn wait_for_removal(tree: &dyn CoordinationTree, path: &str) -> Result<()> {
    loop {
        let (exists, token) = tree.watch_node(path).await?;
        if !exists {
            debug!("{} is gone", path);
            return Ok(());
        }
        token.await?;
    }
}
