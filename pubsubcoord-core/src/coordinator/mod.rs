//! Experiment coordination
//!
//! Sequences a run, launches endpoint processes, and reports what a
//! barrier is still waiting for.

pub mod diagnostics;
pub mod experiment;
pub mod launcher;

pub use diagnostics::{PendingClient, Remaining};
pub use experiment::{
    BarrierWait, CoordinatorConfig, CoordinatorState, ExperimentCoordinator, RunReport,
};
pub use launcher::{CommandLauncher, EndpointLauncher, LauncherConfig, SpawnRequest};
