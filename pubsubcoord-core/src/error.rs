//! Error types for pubsubcoord
//!
//! Covers the coordination tree, the barrier protocol, configuration
//! loading and the launcher glue.

use thiserror::Error;

/// Primary error type for all coordination operations
#[derive(Debug, Error)]
pub enum CoordError {
    // ========== Connectivity Errors ==========

    /// Lost (or never had) a connection to the coordination service
    #[error("Coordination service at {endpoint} unreachable: {reason}")]
    Connectivity { endpoint: String, reason: String },

    /// Session was closed or expired by the coordination service
    #[error("Session {session_id} expired")]
    SessionExpired { session_id: String },

    // ========== Tree Errors ==========

    /// Operation on a path that does not exist
    #[error("No node at path {path}")]
    MissingPath { path: String },

    /// Create on a path that already exists
    #[error("Node already exists at path {path}")]
    NodeExists { path: String },

    /// Non-recursive delete of a node that still has children
    #[error("Node at {path} has {children} children")]
    NotEmpty { path: String, children: usize },

    /// Malformed path
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    // ========== Protocol Errors ==========

    /// A barrier did not open before the caller's deadline
    #[error("Barrier {barrier} still closed after {waited_secs}s, pending: {pending:?}")]
    BarrierTimeout {
        barrier: String,
        waited_secs: u64,
        pending: Vec<String>,
    },

    /// Dispatcher stopped while callers were still waiting on it
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// The watch dispatcher hit a fatal error; no barrier will open
    #[error("Run aborted: {reason}")]
    RunAborted { reason: String },

    // ========== Configuration Errors ==========

    /// Experiment configuration failed validation
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Client host name does not encode a region
    #[error("Invalid client id {client:?}: {reason}")]
    InvalidClientId { client: String, reason: String },

    // ========== Launcher Errors ==========

    /// Spawning a remote process failed
    #[error("Launch on {host} failed: {reason}")]
    LaunchFailed { host: String, reason: String },

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CoordError {
    /// Returns true if this error may succeed when retried by an operator
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordError::BarrierTimeout { .. } | CoordError::LaunchFailed { .. }
        )
    }

    /// Returns true if this error must abort the run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordError::Connectivity { .. }
                | CoordError::SessionExpired { .. }
                | CoordError::MissingPath { .. }
                | CoordError::InvalidPath { .. }
                | CoordError::ShutdownInProgress
                | CoordError::RunAborted { .. }
        )
    }

    /// Short machine-readable tag, used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            CoordError::Connectivity { .. } => "connectivity",
            CoordError::SessionExpired { .. } => "session_expired",
            CoordError::MissingPath { .. } => "missing_path",
            CoordError::NodeExists { .. } => "node_exists",
            CoordError::NotEmpty { .. } => "not_empty",
            CoordError::InvalidPath { .. } => "invalid_path",
            CoordError::BarrierTimeout { .. } => "barrier_timeout",
            CoordError::ShutdownInProgress => "shutdown",
            CoordError::RunAborted { .. } => "run_aborted",
            CoordError::InvalidConfig { .. } => "invalid_config",
            CoordError::InvalidClientId { .. } => "invalid_client_id",
            CoordError::LaunchFailed { .. } => "launch_failed",
            CoordError::Io(_) => "io",
            CoordError::Internal { .. } => "internal",
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        CoordError::Internal {
            message: message.into(),
        }
    }
}

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let err = CoordError::Connectivity {
            endpoint: "http://zk:2181".into(),
            reason: "refused".into(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());

        let err = CoordError::BarrierTimeout {
            barrier: "subscriber".into(),
            waited_secs: 30,
            pending: vec!["cli1-2".into()],
        };
        assert!(!err.is_fatal());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("cli1-2"));
    }
}
