//! Per-client and per-broker phase tracking
//!
//! Endpoint trackers follow one client's registrations for one endpoint
//! kind. Monitor trackers follow the monitors of one broker type.

use std::collections::BTreeMap;
use tracing::debug;

use super::aggregator::{GroupCount, GroupPhase, GroupTransition};
use crate::config::{BrokerKind, ClientId, EndpointKind, ExperimentConfig};
use crate::metrics::standard;

/// Where a client's endpoints are in their lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointPhase {
    AwaitingJoin,
    Joined,
    Departed,
}

impl From<GroupPhase> for EndpointPhase {
    fn from(phase: GroupPhase) -> Self {
        match phase {
            GroupPhase::Pending => EndpointPhase::AwaitingJoin,
            GroupPhase::Complete => EndpointPhase::Joined,
            GroupPhase::Drained => EndpointPhase::Departed,
        }
    }
}

/// Joined/departed state machine for one (kind, client)
#[derive(Debug, Clone)]
pub struct EndpointTracker {
    kind: EndpointKind,
    client: ClientId,
    group: GroupCount,
    observed: bool,
}

impl EndpointTracker {
    pub fn new(kind: EndpointKind, client: ClientId, expected: u32) -> Self {
        Self {
            kind,
            client,
            group: GroupCount::new(expected as usize),
            observed: false,
        }
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }

    pub fn phase(&self) -> EndpointPhase {
        self.group.phase().into()
    }

    pub fn registered(&self) -> usize {
        self.group.count()
    }

    pub fn expected(&self) -> usize {
        self.group.expected()
    }

    /// Apply the registration count from a children snapshot.
    ///
    /// Publishers never depart; their watch is dropped once they join.
    pub fn observe(&mut self, count: usize) -> Option<GroupTransition> {
        let first = !std::mem::replace(&mut self.observed, true);
        if !self.needs_watch() {
            standard::DUPLICATE_TRANSITIONS.inc();
            debug!(
                "Ignoring late snapshot for {} on {}",
                self.kind.plural(),
                self.client
            );
            return None;
        }
        if count == self.group.count() && !first {
            standard::DUPLICATE_TRANSITIONS.inc();
            debug!(
                "No change for {} on {} ({} registered)",
                self.kind.plural(),
                self.client,
                count
            );
            return None;
        }
        self.group.observe(count)
    }

    /// Whether this client still needs watching
    pub fn needs_watch(&self) -> bool {
        match (self.kind, self.phase()) {
            (_, EndpointPhase::Departed) => false,
            (EndpointKind::Publisher, EndpointPhase::Joined) => false,
            _ => true,
        }
    }
}

/// Monitor lifecycle for one broker type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    Running,
    Exited,
}

#[derive(Debug, Clone)]
pub struct MonitorTracker {
    broker: BrokerKind,
    phase: MonitorPhase,
}

impl MonitorTracker {
    /// A broker type with no configured brokers has nothing to wait for
    pub fn new(broker: BrokerKind, configured: usize) -> Self {
        let phase = if configured == 0 {
            MonitorPhase::Exited
        } else {
            MonitorPhase::Running
        };
        Self { broker, phase }
    }

    pub fn broker(&self) -> BrokerKind {
        self.broker
    }

    pub fn phase(&self) -> MonitorPhase {
        self.phase
    }

    /// Apply a snapshot of the monitor registration path. Returns true on
    /// the transition to exited.
    ///
    /// An empty path only counts once it has seen a registration, so
    /// monitors that have not started yet are not mistaken for exited ones.
    pub fn observe(&mut self, count: usize, cversion: u64) -> bool {
        if self.phase == MonitorPhase::Running && count == 0 && cversion > 0 {
            self.phase = MonitorPhase::Exited;
            true
        } else {
            false
        }
    }
}

/// All endpoint and monitor trackers of a run
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    endpoints: BTreeMap<(EndpointKind, ClientId), EndpointTracker>,
    monitors: BTreeMap<BrokerKind, MonitorTracker>,
}

impl PhaseTracker {
    pub fn new(config: &ExperimentConfig) -> Self {
        let mut endpoints = BTreeMap::new();
        for kind in EndpointKind::ALL {
            for (client, expected) in config.endpoint_counts(kind) {
                endpoints.insert(
                    (kind, client.clone()),
                    EndpointTracker::new(kind, client, expected),
                );
            }
        }
        let monitors = BrokerKind::ALL
            .into_iter()
            .map(|broker| {
                (
                    broker,
                    MonitorTracker::new(broker, config.brokers(broker).len()),
                )
            })
            .collect();
        Self {
            endpoints,
            monitors,
        }
    }

    pub fn endpoint(&self, kind: EndpointKind, client: &ClientId) -> Option<&EndpointTracker> {
        self.endpoints.get(&(kind, client.clone()))
    }

    pub fn endpoint_mut(
        &mut self,
        kind: EndpointKind,
        client: &ClientId,
    ) -> Option<&mut EndpointTracker> {
        self.endpoints.get_mut(&(kind, client.clone()))
    }

    pub fn endpoints(&self, kind: EndpointKind) -> impl Iterator<Item = &EndpointTracker> {
        self.endpoints
            .iter()
            .filter(move |((k, _), _)| *k == kind)
            .map(|(_, tracker)| tracker)
    }

    pub fn monitor(&self, broker: BrokerKind) -> Option<&MonitorTracker> {
        self.monitors.get(&broker)
    }

    pub fn monitor_mut(&mut self, broker: BrokerKind) -> Option<&mut MonitorTracker> {
        self.monitors.get_mut(&broker)
    }

    /// True once every broker type's monitors have exited
    pub fn monitoring_complete(&self) -> bool {
        self.monitors
            .values()
            .all(|m| m.phase() == MonitorPhase::Exited)
    }

    /// Clients of `kind` that have not joined yet
    pub fn awaiting_join(&self, kind: EndpointKind) -> Vec<&EndpointTracker> {
        self.endpoints(kind)
            .filter(|t| t.phase() == EndpointPhase::AwaitingJoin)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(host: &str) -> ClientId {
        ClientId::parse(host).unwrap()
    }

    #[test]
    fn test_subscriber_join_and_depart() {
        let mut tracker = EndpointTracker::new(EndpointKind::Subscriber, client("cli1-1"), 3);
        assert_eq!(tracker.observe(2), None);
        assert_eq!(tracker.observe(3), Some(GroupTransition::Completed));
        assert!(tracker.needs_watch());
        assert_eq!(tracker.observe(1), None);
        assert_eq!(tracker.observe(0), Some(GroupTransition::Drained));
        assert_eq!(tracker.phase(), EndpointPhase::Departed);
        assert!(!tracker.needs_watch());
    }

    #[test]
    fn test_overfull_client_does_not_join() {
        let mut tracker = EndpointTracker::new(EndpointKind::Subscriber, client("cli1-1"), 3);
        assert_eq!(tracker.observe(4), None);
        assert_eq!(tracker.phase(), EndpointPhase::AwaitingJoin);
        assert_eq!(tracker.observe(3), Some(GroupTransition::Completed));
    }

    #[test]
    fn test_awaiting_join_lists_pending_clients() {
        let config = ExperimentConfig::parse(
            "clients:cli1-1,cli1-2
topics:t1
sub_distribution:cli1-1:t1:1,cli1-2:t1:2
pub_distribution:cli1-1:t1:1",
        )
        .unwrap();
        let mut phases = PhaseTracker::new(&config);
        phases
            .endpoint_mut(EndpointKind::Subscriber, &client("cli1-1"))
            .unwrap()
            .observe(1);
        let pending: Vec<_> = phases
            .awaiting_join(EndpointKind::Subscriber)
            .into_iter()
            .map(|t| t.client().to_string())
            .collect();
        assert_eq!(pending, vec!["cli1-2".to_string()]);
    }

    #[test]
    fn test_publisher_stops_after_join() {
        let mut tracker = EndpointTracker::new(EndpointKind::Publisher, client("cli1-1"), 1);
        assert_eq!(tracker.observe(1), Some(GroupTransition::Completed));
        assert!(!tracker.needs_watch());
        assert_eq!(tracker.observe(0), None);
        assert_eq!(tracker.phase(), EndpointPhase::Joined);
    }

    #[test]
    fn test_duplicate_snapshot_is_suppressed() {
        let mut tracker = EndpointTracker::new(EndpointKind::Subscriber, client("cli1-1"), 2);
        assert_eq!(tracker.observe(2), Some(GroupTransition::Completed));
        let before = standard::DUPLICATE_TRANSITIONS.get();
        assert_eq!(tracker.observe(2), None);
        assert!(standard::DUPLICATE_TRANSITIONS.get() > before);
    }

    #[test]
    fn test_monitor_needs_a_registration_first() {
        let mut monitor = MonitorTracker::new(BrokerKind::Edge, 2);
        assert!(!monitor.observe(0, 0));
        assert!(!monitor.observe(2, 2));
        assert!(!monitor.observe(1, 3));
        assert!(monitor.observe(0, 4));
        assert!(!monitor.observe(0, 4));
        assert_eq!(monitor.phase(), MonitorPhase::Exited);
    }

    #[test]
    fn test_unconfigured_broker_type_starts_exited() {
        let monitor = MonitorTracker::new(BrokerKind::Routing, 0);
        assert_eq!(monitor.phase(), MonitorPhase::Exited);
    }
}
