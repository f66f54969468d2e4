//! JSON messages exchanged between `HttpTree` and `TreeServer`

use serde::{Deserialize, Serialize};

use super::{ChildrenSnapshot, CreateMode, WatchEvent};
use crate::error::CoordError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    pub label: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub session_id: String,
    /// Interval the server expects heartbeats at
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRequest {
    pub session_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub session_id: String,
    pub path: String,
    pub mode: CreateMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub session_id: String,
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

/// Long poll until the children differ from the given version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchChildrenRequest {
    pub session_id: String,
    pub path: String,
    pub czxid: u64,
    pub cversion: u64,
}

/// Long poll until existence differs from `exists`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchNodeRequest {
    pub session_id: String,
    pub path: String,
    pub exists: bool,
}

/// `event` is `None` when the poll timed out with nothing to report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchResponse {
    pub event: Option<WatchEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildrenResponse {
    pub snapshot: ChildrenSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

/// Error body returned with every non-2xx status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub children: Option<usize>,
}

impl ErrorBody {
    pub fn from_error(err: &CoordError) -> Self {
        let (path, children) = match err {
            CoordError::MissingPath { path }
            | CoordError::NodeExists { path }
            | CoordError::InvalidPath { path, .. } => (Some(path.clone()), None),
            CoordError::NotEmpty { path, children } => (Some(path.clone()), Some(*children)),
            _ => (None, None),
        };
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            path,
            children,
        }
    }

    /// Rebuild the typed error on the client side
    pub fn into_error(self, endpoint: &str, session_id: &str) -> CoordError {
        let path = self.path.unwrap_or_default();
        match self.kind.as_str() {
            "missing_path" => CoordError::MissingPath { path },
            "node_exists" => CoordError::NodeExists { path },
            "not_empty" => CoordError::NotEmpty {
                path,
                children: self.children.unwrap_or_default(),
            },
            "invalid_path" => CoordError::InvalidPath {
                path,
                reason: self.message,
            },
            "session_expired" => CoordError::SessionExpired {
                session_id: session_id.to_string(),
            },
            "shutdown" => CoordError::ShutdownInProgress,
            "connectivity" => CoordError::Connectivity {
                endpoint: endpoint.to_string(),
                reason: self.message,
            },
            _ => CoordError::Internal {
                message: self.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_preserves_kind() {
        let err = CoordError::NotEmpty {
            path: "/experiment".into(),
            children: 3,
        };
        let body = ErrorBody::from_error(&err);
        let json = serde_json::to_string(&body).unwrap();
        let body: ErrorBody = serde_json::from_str(&json).unwrap();
        match body.into_error("http://tree:7070", "s1") {
            CoordError::NotEmpty { path, children } => {
                assert_eq!(path, "/experiment");
                assert_eq!(children, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
