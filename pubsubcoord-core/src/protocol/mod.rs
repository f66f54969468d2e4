//! Rendezvous protocol
//!
//! Endpoints register under per-client paths; the dispatcher counts them
//! per client, then per region, then across regions, and opens the
//! matching barrier once everything has joined.

pub mod aggregator;
pub mod barrier;
pub mod dispatch;
pub mod layout;
pub mod state;
pub mod tracker;

pub use aggregator::{GroupAggregator, GroupCount, GroupPhase, GroupTransition};
pub use barrier::{wait_for_removal, BarrierController, BarrierKind};
pub use dispatch::{WatchDispatcher, WatchKey};
pub use layout::{RunPaths, TreeLayout};
pub use state::{Effect, Outcome, RunState, WatchAction};
pub use tracker::{EndpointPhase, EndpointTracker, MonitorPhase, MonitorTracker, PhaseTracker};
