//! HTTP client for a remote `tree-server`
//!
//! One `HttpTree` is one session. A background task heartbeats the
//! session; once a heartbeat fails the connection is considered lost and
//! every later call fails with `Connectivity`. There is no reconnect.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::wire::*;
use super::{validate_path, ChildrenSnapshot, CoordinationTree, CreateMode, WatchToken};
use crate::error::{CoordError, Result};
use crate::runtime::ShutdownSignal;

/// Configuration for the tree client
#[derive(Debug, Clone)]
pub struct HttpTreeConfig {
    /// Base URL of the tree server
    pub endpoint: String,
    /// Timeout for ordinary requests
    pub request_timeout: Duration,
    /// Timeout for long-poll watch requests (must exceed the server's poll timeout)
    pub watch_timeout: Duration,
    /// Label reported to the server for this session
    pub label: String,
}

impl Default for HttpTreeConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:7070".into(),
            request_timeout: Duration::from_secs(10),
            watch_timeout: Duration::from_secs(30),
            label: "pubsubcoord".into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Transport {
    client: reqwest::Client,
    endpoint: String,
    session_id: String,
}

impl Transport {
    async fn post<Req, Resp>(&self, route: &str, body: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.endpoint.trim_end_matches('/'), route);
        let connectivity = |e: reqwest::Error| CoordError::Connectivity {
            endpoint: self.endpoint.clone(),
            reason: e.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(connectivity)?;

        if response.status().is_success() {
            response.json::<Resp>().await.map_err(connectivity)
        } else {
            let body: ErrorBody = response.json().await.map_err(connectivity)?;
            Err(body.into_error(&self.endpoint, &self.session_id))
        }
    }
}

/// A session on a remote coordination service
pub struct HttpTree {
    config: HttpTreeConfig,
    transport: Transport,
    lost: Arc<AtomicBool>,
    heartbeat_stop: ShutdownSignal,
}

impl HttpTree {
    /// Open a session and start heartbeating it
    pub async fn connect(config: HttpTreeConfig) -> Result<Self> {
        info!("Connecting to coordination service at {}", config.endpoint);
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CoordError::Connectivity {
                endpoint: config.endpoint.clone(),
                reason: e.to_string(),
            })?;

        let bootstrap = Transport {
            client,
            endpoint: config.endpoint.clone(),
            session_id: String::new(),
        };
        let opened: OpenSessionResponse = bootstrap
            .post(
                "/v1/sessions/open",
                &OpenSessionRequest {
                    label: config.label.clone(),
                    protocol_version: crate::PROTOCOL_VERSION,
                },
                config.request_timeout,
            )
            .await?;

        let transport = Transport {
            session_id: opened.session_id,
            ..bootstrap
        };
        let tree = Self {
            config,
            transport,
            lost: Arc::new(AtomicBool::new(false)),
            heartbeat_stop: ShutdownSignal::new(),
        };
        tree.start_heartbeat(Duration::from_millis(opened.heartbeat_interval_ms.max(1)));
        info!("Opened session {}", tree.transport.session_id);
        Ok(tree)
    }

    fn start_heartbeat(&self, period: Duration) {
        let transport = self.transport.clone();
        let lost = self.lost.clone();
        let timeout = self.config.request_timeout;
        let mut stop = self.heartbeat_stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.recv() => break,
                }
                let request = SessionRequest {
                    session_id: transport.session_id.clone(),
                };
                if let Err(e) = transport
                    .post::<_, Ack>("/v1/sessions/heartbeat", &request, timeout)
                    .await
                {
                    error!("Heartbeat for session {} failed: {}", transport.session_id, e);
                    lost.store(true, Ordering::SeqCst);
                    break;
                }
            }
            debug!("Heartbeat task for session {} stopped", transport.session_id);
        });
    }

    /// True once a heartbeat has failed
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn check_connected(&self) -> Result<()> {
        if self.is_lost() {
            Err(CoordError::Connectivity {
                endpoint: self.config.endpoint.clone(),
                reason: "session heartbeat failed".into(),
            })
        } else {
            Ok(())
        }
    }

    async fn call<Req, Resp>(&self, route: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        self.check_connected()?;
        self.transport
            .post(route, body, self.config.request_timeout)
            .await
    }

    fn path_request(&self, path: &str) -> Result<PathRequest> {
        validate_path(path)?;
        Ok(PathRequest {
            session_id: self.transport.session_id.clone(),
            path: path.to_string(),
        })
    }
}

#[async_trait]
impl CoordinationTree for HttpTree {
    fn session_id(&self) -> &str {
        &self.transport.session_id
    }

    async fn ensure_path(&self, path: &str) -> Result<()> {
        let request = self.path_request(path)?;
        self.call::<_, Ack>("/v1/nodes/ensure", &request).await?;
        Ok(())
    }

    async fn create(&self, path: &str, mode: CreateMode) -> Result<()> {
        validate_path(path)?;
        let request = CreateRequest {
            session_id: self.transport.session_id.clone(),
            path: path.to_string(),
            mode,
        };
        self.call::<_, Ack>("/v1/nodes/create", &request).await?;
        Ok(())
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        validate_path(path)?;
        let request = DeleteRequest {
            session_id: self.transport.session_id.clone(),
            path: path.to_string(),
            recursive,
        };
        self.call::<_, Ack>("/v1/nodes/delete", &request).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let request = self.path_request(path)?;
        let response: ExistsResponse = self.call("/v1/nodes/exists", &request).await?;
        Ok(response.exists)
    }

    async fn children(&self, path: &str) -> Result<ChildrenSnapshot> {
        let request = self.path_request(path)?;
        let response: ChildrenResponse = self.call("/v1/nodes/children", &request).await?;
        Ok(response.snapshot)
    }

    async fn watch_children(&self, path: &str) -> Result<(ChildrenSnapshot, WatchToken)> {
        let snapshot = self.children(path).await?;
        let request = WatchChildrenRequest {
            session_id: self.transport.session_id.clone(),
            path: path.to_string(),
            czxid: snapshot.czxid,
            cversion: snapshot.cversion,
        };
        let transport = self.transport.clone();
        let timeout = self.config.watch_timeout;
        let token = WatchToken::new(async move {
            loop {
                let response: WatchResponse = transport
                    .post("/v1/watch/children", &request, timeout)
                    .await?;
                if let Some(event) = response.event {
                    return Ok(event);
                }
            }
        });
        Ok((snapshot, token))
    }

    async fn watch_node(&self, path: &str) -> Result<(bool, WatchToken)> {
        let exists = self.exists(path).await?;
        let request = WatchNodeRequest {
            session_id: self.transport.session_id.clone(),
            path: path.to_string(),
            exists,
        };
        let transport = self.transport.clone();
        let timeout = self.config.watch_timeout;
        let token = WatchToken::new(async move {
            loop {
                let response: WatchResponse =
                    transport.post("/v1/watch/node", &request, timeout).await?;
                if let Some(event) = response.event {
                    return Ok(event);
                }
            }
        });
        Ok((exists, token))
    }

    async fn close(&self) -> Result<()> {
        self.heartbeat_stop.shutdown();
        let request = SessionRequest {
            session_id: self.transport.session_id.clone(),
        };
        self.transport
            .post::<_, Ack>("/v1/sessions/close", &request, self.config.request_timeout)
            .await?;
        info!("Closed session {}", self.transport.session_id);
        Ok(())
    }
}
