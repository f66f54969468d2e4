//! Coordination tree
//!
//! A hierarchical, watchable node store in the style of ZooKeeper. The
//! protocol only depends on the [`CoordinationTree`] trait; [`MemoryTree`]
//! is the in-process store and [`HttpTree`] talks to a `tree-server`.

pub mod http;
pub mod memory;
pub mod server;
pub mod session;
pub mod wire;

pub use http::{HttpTree, HttpTreeConfig};
pub use memory::{LocalSession, MemoryTree};
pub use server::{TreeServer, TreeServerConfig};
pub use session::{SessionConfig, SessionManager};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::{CoordError, Result};

/// Lifetime of a created node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreateMode {
    /// Lives until deleted
    Persistent,
    /// Removed when the creating session closes or expires
    Ephemeral,
}

/// Children of a node at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildrenSnapshot {
    /// Watched path
    pub path: String,
    /// Child names, sorted
    pub children: Vec<String>,
    /// Number of child creates/deletes since the node was created
    pub cversion: u64,
    /// Tree revision at which the node was created
    pub czxid: u64,
}

impl ChildrenSnapshot {
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// What made a watch fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    /// A direct child was created or deleted
    ChildrenChanged,
    /// The watched node appeared
    NodeCreated,
    /// The watched node (or an ancestor) was deleted
    NodeDeleted,
}

/// Delivered exactly once per armed watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// One-shot watch registration.
///
/// Resolves once, on the next change, and is consumed by doing so. Observers
/// that want to keep watching must arm a new token.
pub struct WatchToken {
    inner: Pin<Box<dyn Future<Output = Result<WatchEvent>> + Send>>,
}

impl WatchToken {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<WatchEvent>> + Send + 'static,
    {
        Self {
            inner: Box::pin(future),
        }
    }
}

impl Future for WatchToken {
    type Output = Result<WatchEvent>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for WatchToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchToken").finish_non_exhaustive()
    }
}

/// A session-scoped connection to the coordination service
#[async_trait]
pub trait CoordinationTree: Send + Sync {
    /// Identifier of the session owning this connection's ephemeral nodes
    fn session_id(&self) -> &str;

    /// Create `path` and any missing ancestors; no error if it exists
    async fn ensure_path(&self, path: &str) -> Result<()>;

    /// Create `path` (parents as needed); `NodeExists` if already present
    async fn create(&self, path: &str, mode: CreateMode) -> Result<()>;

    /// Delete a node; `MissingPath` if absent, `NotEmpty` if it has
    /// children and `recursive` is false
    async fn delete(&self, path: &str, recursive: bool) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn children(&self, path: &str) -> Result<ChildrenSnapshot>;

    /// Snapshot the children and arm a one-shot children watch atomically
    async fn watch_children(&self, path: &str) -> Result<(ChildrenSnapshot, WatchToken)>;

    /// Report existence and arm a one-shot watch on it flipping
    async fn watch_node(&self, path: &str) -> Result<(bool, WatchToken)>;

    /// End the session, dropping its ephemeral nodes
    async fn close(&self) -> Result<()>;

    /// Check-then-delete; returns whether this call removed the node
    async fn delete_if_exists(&self, path: &str, recursive: bool) -> Result<bool> {
        if !self.exists(path).await? {
            return Ok(false);
        }
        match self.delete(path, recursive).await {
            Ok(()) => Ok(true),
            // Lost a race with another deleter
            Err(CoordError::MissingPath { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Opens new sessions on a coordination service
///
/// Each simulated endpoint process gets its own session so its ephemeral
/// registrations vanish when it exits.
#[async_trait]
pub trait TreeConnector: Send + Sync {
    async fn connect(&self, label: &str) -> Result<Arc<dyn CoordinationTree>>;
}

#[async_trait]
impl TreeConnector for Arc<MemoryTree> {
    async fn connect(&self, _label: &str) -> Result<Arc<dyn CoordinationTree>> {
        Ok(Arc::new(MemoryTree::connect(self)))
    }
}

#[async_trait]
impl TreeConnector for HttpTreeConfig {
    async fn connect(&self, label: &str) -> Result<Arc<dyn CoordinationTree>> {
        let config = HttpTreeConfig {
            label: label.to_string(),
            ..self.clone()
        };
        Ok(Arc::new(HttpTree::connect(config).await?))
    }
}

/// Validate an absolute, slash-delimited path
pub fn validate_path(path: &str) -> Result<()> {
    let invalid = |reason: &str| CoordError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if !path.starts_with('/') {
        return Err(invalid("must be absolute"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(invalid("trailing slash"));
    }
    if path[1..].split('/').any(str::is_empty) {
        return Err(invalid("empty segment"));
    }
    Ok(())
}

/// Append a child segment to a path
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of a path, `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a path
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_validation() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/experiment/run1/sub").is_ok());
        assert!(validate_path("experiment").is_err());
        assert!(validate_path("/experiment/").is_err());
        assert!(validate_path("/experiment//sub").is_err());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(join("/", "experiment"), "/experiment");
        assert_eq!(join("/experiment", "run1"), "/experiment/run1");
        assert_eq!(parent("/experiment/run1"), Some("/experiment"));
        assert_eq!(parent("/experiment"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(name("/experiment/run1/sub"), "sub");
    }
}
