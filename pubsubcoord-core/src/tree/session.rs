//! Session liveness tracking
//!
//! Remote clients hold a session open with heartbeats. Sessions that stop
//! heartbeating are first marked suspect, then expired; expiring a session
//! is what removes an endpoint's ephemeral registrations from the tree.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{CoordError, Result};

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Heartbeating normally
    Active,
    /// Missed heartbeats, may still recover
    Suspect,
    /// Timed out; ephemeral nodes are gone
    Expired,
    /// Closed by the client
    Closed,
}

/// Information about an open session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    /// Free-form client label (host name, process role)
    pub label: String,
    pub status: SessionStatus,
    pub opened_at: Instant,
    pub last_heartbeat: Instant,
}

/// Configuration for session liveness
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval clients are expected to heartbeat at
    pub heartbeat_interval: Duration,
    /// Silence after which a session is suspect
    pub suspect_timeout: Duration,
    /// Silence after which a session expires
    pub expiry_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(crate::DEFAULT_HEARTBEAT_INTERVAL_SECS),
            suspect_timeout: Duration::from_secs(crate::DEFAULT_HEARTBEAT_INTERVAL_SECS * 3),
            expiry_timeout: Duration::from_secs(crate::DEFAULT_SESSION_TIMEOUT_SECS),
        }
    }
}

/// Tracks heartbeats for every remote session
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionInfo>>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start tracking a session opened on the tree
    pub async fn register(&self, session_id: String, label: String) {
        let now = Instant::now();
        info!("Registered session {} ({})", session_id, label);
        self.sessions.write().await.insert(
            session_id.clone(),
            SessionInfo {
                session_id,
                label,
                status: SessionStatus::Active,
                opened_at: now,
                last_heartbeat: now,
            },
        );
    }

    /// Process a heartbeat
    pub async fn heartbeat(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .filter(|s| matches!(s.status, SessionStatus::Active | SessionStatus::Suspect))
            .ok_or_else(|| CoordError::SessionExpired {
                session_id: session_id.to_string(),
            })?;

        session.last_heartbeat = Instant::now();
        if session.status == SessionStatus::Suspect {
            session.status = SessionStatus::Active;
            info!("Session {} recovered from suspect status", session_id);
        }
        debug!("Heartbeat from session {}", session_id);
        Ok(())
    }

    /// Mark a session closed by its client
    pub async fn close(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.status = SessionStatus::Closed;
            info!("Session {} ({}) closed", session_id, session.label);
        }
    }

    /// Check heartbeats and return sessions that just expired
    pub async fn check_health(&self) -> Vec<String> {
        let now = Instant::now();
        let mut expired = Vec::new();

        let mut sessions = self.sessions.write().await;
        for (id, session) in sessions.iter_mut() {
            if matches!(session.status, SessionStatus::Expired | SessionStatus::Closed) {
                continue;
            }

            let elapsed = now.duration_since(session.last_heartbeat);
            if elapsed > self.config.expiry_timeout {
                warn!("Session {} ({}) expired", id, session.label);
                session.status = SessionStatus::Expired;
                expired.push(id.clone());
            } else if elapsed > self.config.suspect_timeout
                && session.status == SessionStatus::Active
            {
                warn!("Session {} ({}) marked as suspect", id, session.label);
                session.status = SessionStatus::Suspect;
            }
        }

        expired
    }

    /// Drop bookkeeping for sessions that are no longer live
    pub async fn prune(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| matches!(s.status, SessionStatus::Active | SessionStatus::Suspect));
        before - sessions.len()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .count()
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(session_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_millis(5),
            suspect_timeout: Duration::from_millis(20),
            expiry_timeout: Duration::from_millis(60),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_session() {
        let manager = SessionManager::new(SessionConfig::default());
        assert!(matches!(
            manager.heartbeat("nope").await,
            Err(CoordError::SessionExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_session_expires_without_heartbeats() {
        let manager = SessionManager::new(fast_config());
        manager.register("s1".into(), "cli1-1".into()).await;
        manager.register("s2".into(), "cli1-2".into()).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.heartbeat("s2").await.unwrap();
        assert!(manager.check_health().await.is_empty());
        assert_eq!(manager.get("s1").await.unwrap().status, SessionStatus::Suspect);

        tokio::time::sleep(Duration::from_millis(40)).await;
        manager.heartbeat("s2").await.unwrap();
        let expired = manager.check_health().await;
        assert_eq!(expired, vec!["s1".to_string()]);

        assert!(manager.heartbeat("s1").await.is_err());
        assert_eq!(manager.prune().await, 1);
        assert_eq!(manager.active_count().await, 1);
    }
}
