//! pubsubcoord - barrier-based rendezvous for pub/sub load tests
//!
//! This crate coordinates one experiment run across a fleet of hosts:
//! - Coordination tree (in-memory or served over HTTP)
//! - Per-client, per-region and global join counting
//! - Four run barriers: subscribers, publishers, finished, monitoring
//! - Experiment sequencing and endpoint launching

pub mod config;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod runtime;
pub mod tree;

pub use config::ExperimentConfig;
pub use coordinator::ExperimentCoordinator;
pub use error::{CoordError, Result};
pub use runtime::ShutdownSignal;

/// Wire protocol version of the tree service
pub const PROTOCOL_VERSION: u32 = 1;

/// Default session heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 2;

/// Default session timeout in seconds
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 15;
