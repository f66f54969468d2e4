//! Endpoint process state
//!
//! Tracks where one endpoint process is in its run.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Endpoint process phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPhase {
    /// Connected, nothing registered yet
    Starting,
    /// Registration nodes created
    Registered,
    /// Released by its barrier, sending or receiving
    Running,
    /// Registrations removed
    Finished,
    /// Gave up after an error
    Failed,
}

/// Local state of one endpoint process
pub struct EndpointState {
    phase: RwLock<ProcessPhase>,
    /// Registration node paths owned by this process
    registrations: RwLock<Vec<String>>,
    samples: AtomicU64,
}

impl EndpointState {
    pub fn new() -> Self {
        Self {
            phase: RwLock::new(ProcessPhase::Starting),
            registrations: RwLock::new(Vec::new()),
            samples: AtomicU64::new(0),
        }
    }

    pub async fn phase(&self) -> ProcessPhase {
        *self.phase.read().await
    }

    pub async fn set_phase(&self, phase: ProcessPhase) {
        *self.phase.write().await = phase;
    }

    pub async fn add_registration(&self, path: String) {
        self.registrations.write().await.push(path);
        *self.phase.write().await = ProcessPhase::Registered;
    }

    /// Take every registration, leaving none recorded
    pub async fn take_registrations(&self) -> Vec<String> {
        std::mem::take(&mut *self.registrations.write().await)
    }

    pub async fn registration_count(&self) -> usize {
        self.registrations.read().await.len()
    }

    /// Count one sent or received sample; returns the new total
    pub fn record_sample(&self) -> u64 {
        self.samples.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

impl Default for EndpointState {
    fn default() -> Self {
        Self::new()
    }
}
