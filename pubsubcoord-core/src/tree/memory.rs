//! In-process coordination tree
//!
//! Every mutation bumps a tree-wide revision published on a
//! `tokio::sync::watch` channel; watch tokens subscribe before checking, so
//! a change between snapshot and wait is never lost.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{
    join, name, parent, validate_path, ChildrenSnapshot, CoordinationTree, CreateMode,
    WatchEvent, WatchEventKind, WatchToken,
};
use crate::error::{CoordError, Result};

#[derive(Debug)]
struct Node {
    children: BTreeSet<String>,
    cversion: u64,
    czxid: u64,
    owner: Option<String>,
}

impl Node {
    fn new(czxid: u64, owner: Option<String>) -> Self {
        Self {
            children: BTreeSet::new(),
            cversion: 0,
            czxid,
            owner,
        }
    }
}

#[derive(Debug)]
struct TreeState {
    nodes: HashMap<String, Node>,
    /// Ephemeral paths owned by each open session
    sessions: HashMap<String, HashSet<String>>,
    zxid: u64,
}

impl TreeState {
    fn next_zxid(&mut self) -> u64 {
        self.zxid += 1;
        self.zxid
    }

    fn insert(&mut self, path: &str, owner: Option<String>) {
        let czxid = self.next_zxid();
        if let Some(parent_path) = parent(path) {
            if let Some(parent_node) = self.nodes.get_mut(parent_path) {
                parent_node.children.insert(name(path).to_string());
                parent_node.cversion += 1;
            }
        }
        if let Some(session) = &owner {
            self.sessions
                .entry(session.clone())
                .or_default()
                .insert(path.to_string());
        }
        self.nodes.insert(path.to_string(), Node::new(czxid, owner));
    }

    /// Create missing ancestors of `path` (not `path` itself)
    fn ensure_parents(&mut self, path: &str) {
        let mut missing = Vec::new();
        let mut cursor = parent(path);
        while let Some(p) = cursor {
            if self.nodes.contains_key(p) {
                break;
            }
            missing.push(p.to_string());
            cursor = parent(p);
        }
        for p in missing.into_iter().rev() {
            self.insert(&p, None);
        }
    }

    fn remove_subtree(&mut self, path: &str) -> usize {
        let mut stack = vec![path.to_string()];
        let mut removed = 0;
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children.iter().map(|child| join(&current, child)));
                if let Some(owner) = node.owner {
                    if let Some(owned) = self.sessions.get_mut(&owner) {
                        owned.remove(&current);
                    }
                }
                removed += 1;
            }
        }
        if let Some(parent_path) = parent(path) {
            if let Some(parent_node) = self.nodes.get_mut(parent_path) {
                if parent_node.children.remove(name(path)) {
                    parent_node.cversion += 1;
                }
            }
        }
        self.next_zxid();
        removed
    }
}

/// Shared in-process node store
#[derive(Debug)]
pub struct MemoryTree {
    state: Mutex<TreeState>,
    revision: watch::Sender<u64>,
}

impl MemoryTree {
    /// Create a tree holding only the root node
    pub fn new() -> Arc<Self> {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::new(0, None));
        let (revision, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(TreeState {
                nodes,
                sessions: HashMap::new(),
                zxid: 0,
            }),
            revision,
        })
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Open a session that can own ephemeral nodes
    pub fn open_session(&self) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.state
            .lock()
            .sessions
            .insert(session_id.clone(), HashSet::new());
        debug!("Opened tree session {}", session_id);
        session_id
    }

    /// Open a session and wrap it as a [`CoordinationTree`] connection
    pub fn connect(self: &Arc<Self>) -> LocalSession {
        LocalSession {
            session_id: self.open_session(),
            tree: self.clone(),
        }
    }

    pub fn is_session_open(&self, session_id: &str) -> bool {
        self.state.lock().sessions.contains_key(session_id)
    }

    /// Close a session, deleting every ephemeral node it owns.
    /// Returns the number of nodes removed.
    pub fn close_session(&self, session_id: &str) -> usize {
        let removed = {
            let mut state = self.state.lock();
            let Some(owned) = state.sessions.remove(session_id) else {
                return 0;
            };
            let mut removed = 0;
            for path in owned {
                if state.nodes.contains_key(&path) {
                    removed += state.remove_subtree(&path);
                }
            }
            removed
        };
        if removed > 0 {
            self.bump();
        }
        info!(
            "Closed tree session {} ({} ephemeral nodes removed)",
            session_id, removed
        );
        removed
    }

    pub fn ensure_path(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let created = {
            let mut state = self.state.lock();
            if state.nodes.contains_key(path) {
                false
            } else {
                state.ensure_parents(path);
                state.insert(path, None);
                true
            }
        };
        if created {
            self.bump();
        }
        Ok(())
    }

    pub fn create(&self, path: &str, mode: CreateMode, session_id: &str) -> Result<()> {
        validate_path(path)?;
        {
            let mut state = self.state.lock();
            if !state.sessions.contains_key(session_id) {
                return Err(CoordError::SessionExpired {
                    session_id: session_id.to_string(),
                });
            }
            if state.nodes.contains_key(path) {
                return Err(CoordError::NodeExists {
                    path: path.to_string(),
                });
            }
            state.ensure_parents(path);
            let owner = match mode {
                CreateMode::Persistent => None,
                CreateMode::Ephemeral => Some(session_id.to_string()),
            };
            state.insert(path, owner);
        }
        self.bump();
        Ok(())
    }

    pub fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordError::InvalidPath {
                path: path.to_string(),
                reason: "cannot delete the root".into(),
            });
        }
        {
            let mut state = self.state.lock();
            let node = state.nodes.get(path).ok_or_else(|| CoordError::MissingPath {
                path: path.to_string(),
            })?;
            if !recursive && !node.children.is_empty() {
                return Err(CoordError::NotEmpty {
                    path: path.to_string(),
                    children: node.children.len(),
                });
            }
            state.remove_subtree(path);
        }
        self.bump();
        Ok(())
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        validate_path(path)?;
        Ok(self.state.lock().nodes.contains_key(path))
    }

    pub fn children(&self, path: &str) -> Result<ChildrenSnapshot> {
        validate_path(path)?;
        let state = self.state.lock();
        let node = state.nodes.get(path).ok_or_else(|| CoordError::MissingPath {
            path: path.to_string(),
        })?;
        Ok(ChildrenSnapshot {
            path: path.to_string(),
            children: node.children.iter().cloned().collect(),
            cversion: node.cversion,
            czxid: node.czxid,
        })
    }

    /// Wait until the children of `path` differ from the given snapshot
    /// version, or the node is replaced or removed.
    pub async fn wait_children_change(
        &self,
        path: &str,
        czxid: u64,
        cversion: u64,
    ) -> Result<WatchEvent> {
        let mut rx = self.revision.subscribe();
        loop {
            let kind = {
                let state = self.state.lock();
                match state.nodes.get(path) {
                    None => Some(WatchEventKind::NodeDeleted),
                    Some(node) if node.czxid != czxid => Some(WatchEventKind::NodeDeleted),
                    Some(node) if node.cversion != cversion => {
                        Some(WatchEventKind::ChildrenChanged)
                    }
                    Some(_) => None,
                }
            };
            if let Some(kind) = kind {
                return Ok(WatchEvent {
                    path: path.to_string(),
                    kind,
                });
            }
            rx.changed()
                .await
                .map_err(|_| CoordError::ShutdownInProgress)?;
        }
    }

    /// Wait until the existence of `path` differs from `existed`
    pub async fn wait_existence_change(&self, path: &str, existed: bool) -> Result<WatchEvent> {
        let mut rx = self.revision.subscribe();
        loop {
            let exists = self.state.lock().nodes.contains_key(path);
            if exists != existed {
                let kind = if exists {
                    WatchEventKind::NodeCreated
                } else {
                    WatchEventKind::NodeDeleted
                };
                return Ok(WatchEvent {
                    path: path.to_string(),
                    kind,
                });
            }
            rx.changed()
                .await
                .map_err(|_| CoordError::ShutdownInProgress)?;
        }
    }

    /// Number of nodes, root included
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

/// A session on a [`MemoryTree`] in the same process
#[derive(Debug, Clone)]
pub struct LocalSession {
    session_id: String,
    tree: Arc<MemoryTree>,
}

impl LocalSession {
    pub fn tree(&self) -> &Arc<MemoryTree> {
        &self.tree
    }

    fn check_open(&self) -> Result<()> {
        if self.tree.is_session_open(&self.session_id) {
            Ok(())
        } else {
            Err(CoordError::SessionExpired {
                session_id: self.session_id.clone(),
            })
        }
    }
}

#[async_trait]
impl CoordinationTree for LocalSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn ensure_path(&self, path: &str) -> Result<()> {
        self.check_open()?;
        self.tree.ensure_path(path)
    }

    async fn create(&self, path: &str, mode: CreateMode) -> Result<()> {
        self.tree.create(path, mode, &self.session_id)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        self.check_open()?;
        self.tree.delete(path, recursive)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        self.tree.exists(path)
    }

    async fn children(&self, path: &str) -> Result<ChildrenSnapshot> {
        self.check_open()?;
        self.tree.children(path)
    }

    async fn watch_children(&self, path: &str) -> Result<(ChildrenSnapshot, WatchToken)> {
        self.check_open()?;
        let snapshot = self.tree.children(path)?;
        let tree = self.tree.clone();
        let watched = path.to_string();
        let (czxid, cversion) = (snapshot.czxid, snapshot.cversion);
        let token = WatchToken::new(async move {
            tree.wait_children_change(&watched, czxid, cversion).await
        });
        Ok((snapshot, token))
    }

    async fn watch_node(&self, path: &str) -> Result<(bool, WatchToken)> {
        self.check_open()?;
        let exists = self.tree.exists(path)?;
        let tree = self.tree.clone();
        let watched = path.to_string();
        let token = WatchToken::new(async move {
            tree.wait_existence_change(&watched, exists).await
        });
        Ok((exists, token))
    }

    async fn close(&self) -> Result<()> {
        self.tree.close_session(&self.session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ensure_path_is_idempotent() {
        let tree = MemoryTree::new();
        let session = tree.connect();

        session.ensure_path("/experiment/run1/sub").await.unwrap();
        session.ensure_path("/experiment/run1/sub").await.unwrap();

        assert!(session.exists("/experiment").await.unwrap());
        assert!(session.exists("/experiment/run1/sub").await.unwrap());
        let snapshot = session.children("/experiment/run1").await.unwrap();
        assert_eq!(snapshot.children, vec!["sub".to_string()]);
        assert_eq!(snapshot.cversion, 1);
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let tree = MemoryTree::new();
        let session = tree.connect();
        session.ensure_path("/a/b/c").await.unwrap();

        assert!(matches!(
            session.delete("/a", false).await,
            Err(CoordError::NotEmpty { .. })
        ));
        session.delete("/a", true).await.unwrap();
        assert!(!session.exists("/a/b/c").await.unwrap());
        assert!(matches!(
            session.delete("/a", true).await,
            Err(CoordError::MissingPath { .. })
        ));
        assert!(!session.delete_if_exists("/a", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let tree = MemoryTree::new();
        let session = tree.connect();
        session.create("/x/y", CreateMode::Persistent).await.unwrap();
        assert!(matches!(
            session.create("/x/y", CreateMode::Persistent).await,
            Err(CoordError::NodeExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_ephemeral_nodes_removed_on_close() {
        let tree = MemoryTree::new();
        let controller = tree.connect();
        let endpoint = tree.connect();

        controller.ensure_path("/reg").await.unwrap();
        endpoint.create("/reg/e1", CreateMode::Ephemeral).await.unwrap();
        endpoint.create("/reg/e2", CreateMode::Persistent).await.unwrap();

        endpoint.close().await.unwrap();
        let snapshot = controller.children("/reg").await.unwrap();
        assert_eq!(snapshot.children, vec!["e2".to_string()]);
        assert!(matches!(
            endpoint.create("/reg/e3", CreateMode::Ephemeral).await,
            Err(CoordError::SessionExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_children_watch_fires_once_per_change() {
        let tree = MemoryTree::new();
        let session = tree.connect();
        session.ensure_path("/reg").await.unwrap();

        let (snapshot, token) = session.watch_children("/reg").await.unwrap();
        assert!(snapshot.is_empty());

        let writer = session.clone();
        tokio::spawn(async move {
            writer.create("/reg/e1", CreateMode::Persistent).await.unwrap();
        });

        let event = tokio::time::timeout(Duration::from_secs(1), token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, WatchEventKind::ChildrenChanged);

        let (snapshot, _token) = session.watch_children("/reg").await.unwrap();
        assert_eq!(snapshot.children, vec!["e1".to_string()]);
    }

    #[tokio::test]
    async fn test_change_before_await_is_not_lost() {
        let tree = MemoryTree::new();
        let session = tree.connect();
        session.ensure_path("/reg").await.unwrap();

        let (_, token) = session.watch_children("/reg").await.unwrap();
        session.create("/reg/e1", CreateMode::Persistent).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, WatchEventKind::ChildrenChanged);
    }

    #[tokio::test]
    async fn test_children_watch_sees_recreated_node_as_deleted() {
        let tree = MemoryTree::new();
        let session = tree.connect();
        session.ensure_path("/reg").await.unwrap();

        let (_, token) = session.watch_children("/reg").await.unwrap();
        session.delete("/reg", true).await.unwrap();
        session.ensure_path("/reg").await.unwrap();

        let event = token.await.unwrap();
        assert_eq!(event.kind, WatchEventKind::NodeDeleted);
    }

    #[tokio::test]
    async fn test_node_watch() {
        let tree = MemoryTree::new();
        let session = tree.connect();
        session.ensure_path("/barrier").await.unwrap();

        let (exists, token) = session.watch_node("/barrier").await.unwrap();
        assert!(exists);
        session.delete("/barrier", false).await.unwrap();
        let event = token.await.unwrap();
        assert_eq!(event.kind, WatchEventKind::NodeDeleted);
    }
}
