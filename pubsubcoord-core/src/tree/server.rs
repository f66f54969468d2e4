//! HTTP front-end for a [`MemoryTree`]
//!
//! Serves the tree to remote sessions as JSON over HTTP. Watches are long
//! polls: the client sends the version it last saw and the server answers
//! when the node changes or the poll times out.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::memory::MemoryTree;
use super::session::{SessionConfig, SessionManager};
use super::wire::*;
use crate::error::{CoordError, Result};
use crate::metrics::standard;
use crate::runtime::ShutdownSignal;

/// Configuration for the tree server
#[derive(Debug, Clone)]
pub struct TreeServerConfig {
    /// Listen address
    pub bind_addr: SocketAddr,
    /// Session liveness settings
    pub session: SessionConfig,
    /// Longest a watch request is held open
    pub poll_timeout: Duration,
    /// How often expired sessions are reaped
    pub health_check_interval: Duration,
}

impl Default for TreeServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            session: SessionConfig::default(),
            poll_timeout: Duration::from_secs(20),
            health_check_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
struct AppState {
    tree: Arc<MemoryTree>,
    sessions: Arc<SessionManager>,
    poll_timeout: Duration,
}

impl AppState {
    fn check_session(&self, session_id: &str) -> Result<()> {
        if self.tree.is_session_open(session_id) {
            Ok(())
        } else {
            Err(CoordError::SessionExpired {
                session_id: session_id.to_string(),
            })
        }
    }
}

/// Error wrapper mapping [`CoordError`] onto HTTP statuses
struct ApiError(CoordError);

impl From<CoordError> for ApiError {
    fn from(err: CoordError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoordError::MissingPath { .. } => StatusCode::NOT_FOUND,
            CoordError::NodeExists { .. } | CoordError::NotEmpty { .. } => StatusCode::CONFLICT,
            CoordError::SessionExpired { .. } => StatusCode::GONE,
            CoordError::InvalidPath { .. } => StatusCode::BAD_REQUEST,
            CoordError::ShutdownInProgress => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody::from_error(&self.0))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Coordination service: a [`MemoryTree`] plus session liveness
pub struct TreeServer {
    config: TreeServerConfig,
    tree: Arc<MemoryTree>,
    sessions: Arc<SessionManager>,
}

impl TreeServer {
    pub fn new(config: TreeServerConfig) -> Self {
        let sessions = Arc::new(SessionManager::new(config.session.clone()));
        Self {
            config,
            tree: MemoryTree::new(),
            sessions,
        }
    }

    /// The served tree, for co-located sessions
    pub fn tree(&self) -> &Arc<MemoryTree> {
        &self.tree
    }

    /// Build the HTTP router
    pub fn router(&self) -> Router {
        let state = AppState {
            tree: self.tree.clone(),
            sessions: self.sessions.clone(),
            poll_timeout: self.config.poll_timeout,
        };
        Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .route("/metrics", get(|| async { crate::metrics::gather_system_metrics() }))
            .route("/v1/sessions/open", post(open_session))
            .route("/v1/sessions/heartbeat", post(heartbeat))
            .route("/v1/sessions/close", post(close_session))
            .route("/v1/nodes/ensure", post(ensure_path))
            .route("/v1/nodes/create", post(create_node))
            .route("/v1/nodes/delete", post(delete_node))
            .route("/v1/nodes/exists", post(node_exists))
            .route("/v1/nodes/children", post(node_children))
            .route("/v1/watch/children", post(watch_children))
            .route("/v1/watch/node", post(watch_node))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Start reaping sessions that stopped heartbeating
    pub fn start_health_loop(&self, shutdown: &ShutdownSignal) {
        let tree = self.tree.clone();
        let sessions = self.sessions.clone();
        let period = self.config.health_check_interval;
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.recv() => break,
                }
                for session_id in sessions.check_health().await {
                    let removed = tree.close_session(&session_id);
                    warn!(
                        "Reaped expired session {} ({} ephemeral nodes)",
                        session_id, removed
                    );
                }
                sessions.prune().await;
                standard::OPEN_SESSIONS.set(tree.session_count() as i64);
            }
            debug!("Session health loop stopped");
        });
    }

    /// Bind the configured address and serve until shutdown
    pub async fn serve(self, shutdown: ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve_with_listener(
        self,
        listener: TcpListener,
        shutdown: ShutdownSignal,
    ) -> Result<()> {
        info!("Tree server listening on {}", listener.local_addr()?);
        self.start_health_loop(&shutdown);
        let app = self.router();
        let mut stop = shutdown.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            })
            .await?;
        info!("Tree server stopped");
        Ok(())
    }
}

async fn open_session(
    State(state): State<AppState>,
    Json(req): Json<OpenSessionRequest>,
) -> ApiResult<OpenSessionResponse> {
    if req.protocol_version != crate::PROTOCOL_VERSION {
        return Err(CoordError::InvalidConfig {
            reason: format!(
                "client speaks protocol {}, server speaks {}",
                req.protocol_version,
                crate::PROTOCOL_VERSION
            ),
        }
        .into());
    }
    let session_id = state.tree.open_session();
    state.sessions.register(session_id.clone(), req.label).await;
    standard::OPEN_SESSIONS.set(state.tree.session_count() as i64);
    Ok(Json(OpenSessionResponse {
        session_id,
        heartbeat_interval_ms: state.sessions.config().heartbeat_interval.as_millis() as u64,
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<SessionRequest>,
) -> ApiResult<Ack> {
    state.check_session(&req.session_id)?;
    state.sessions.heartbeat(&req.session_id).await?;
    Ok(Json(Ack::ok()))
}

async fn close_session(
    State(state): State<AppState>,
    Json(req): Json<SessionRequest>,
) -> ApiResult<Ack> {
    state.sessions.close(&req.session_id).await;
    state.tree.close_session(&req.session_id);
    standard::OPEN_SESSIONS.set(state.tree.session_count() as i64);
    Ok(Json(Ack::ok()))
}

async fn ensure_path(
    State(state): State<AppState>,
    Json(req): Json<PathRequest>,
) -> ApiResult<Ack> {
    state.check_session(&req.session_id)?;
    state.tree.ensure_path(&req.path)?;
    Ok(Json(Ack::ok()))
}

async fn create_node(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> ApiResult<Ack> {
    state.tree.create(&req.path, req.mode, &req.session_id)?;
    Ok(Json(Ack::ok()))
}

async fn delete_node(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> ApiResult<Ack> {
    state.check_session(&req.session_id)?;
    state.tree.delete(&req.path, req.recursive)?;
    Ok(Json(Ack::ok()))
}

async fn node_exists(
    State(state): State<AppState>,
    Json(req): Json<PathRequest>,
) -> ApiResult<ExistsResponse> {
    state.check_session(&req.session_id)?;
    let exists = state.tree.exists(&req.path)?;
    Ok(Json(ExistsResponse { exists }))
}

async fn node_children(
    State(state): State<AppState>,
    Json(req): Json<PathRequest>,
) -> ApiResult<ChildrenResponse> {
    state.check_session(&req.session_id)?;
    let snapshot = state.tree.children(&req.path)?;
    Ok(Json(ChildrenResponse { snapshot }))
}

async fn watch_children(
    State(state): State<AppState>,
    Json(req): Json<WatchChildrenRequest>,
) -> ApiResult<WatchResponse> {
    state.check_session(&req.session_id)?;
    let wait = state
        .tree
        .wait_children_change(&req.path, req.czxid, req.cversion);
    let event = match tokio::time::timeout(state.poll_timeout, wait).await {
        Ok(event) => Some(event?),
        Err(_) => None,
    };
    Ok(Json(WatchResponse { event }))
}

async fn watch_node(
    State(state): State<AppState>,
    Json(req): Json<WatchNodeRequest>,
) -> ApiResult<WatchResponse> {
    state.check_session(&req.session_id)?;
    let wait = state.tree.wait_existence_change(&req.path, req.exists);
    let event = match tokio::time::timeout(state.poll_timeout, wait).await {
        Ok(event) => Some(event?),
        Err(_) => None,
    };
    Ok(Json(WatchResponse { event }))
}
