//! Endpoint-side helpers
//!
//! Used by publisher, subscriber and monitor processes, and by the
//! simulated launcher for dry runs.

pub mod client;
pub mod simulate;
pub mod state;

pub use client::EndpointClient;
pub use simulate::{SimulatedLauncher, SimulationConfig};
pub use state::{EndpointState, ProcessPhase};
