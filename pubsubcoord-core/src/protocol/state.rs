//! Per-run protocol state
//!
//! [`RunState`] turns watch snapshots into [`Effect`]s. It performs no I/O;
//! the dispatcher applies the effects to the tree and the barriers.

use tracing::{debug, info};

use super::aggregator::{GroupAggregator, GroupPhase, GroupTransition};
use super::barrier::BarrierKind;
use super::tracker::{MonitorPhase, PhaseTracker};
use crate::config::{BrokerKind, ClientId, EndpointKind, ExperimentConfig, RegionId};
use crate::metrics::standard;

/// Whether a one-shot watch should be armed again after handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Rearm,
    Stop,
}

/// A tree or barrier change requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Record that a client has all its endpoints registered
    MarkClient { kind: EndpointKind, client: ClientId },
    /// Remove a client's completion marker after it emptied
    UnmarkClient { kind: EndpointKind, client: ClientId },
    /// Record that every client of a region has joined
    MarkRegion { kind: EndpointKind, region: RegionId },
    /// Remove a region's marker after its clients emptied
    UnmarkRegion { kind: EndpointKind, region: RegionId },
    OpenBarrier(BarrierKind),
}

/// Result of handling one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub effects: Vec<Effect>,
    pub action: WatchAction,
}

impl Outcome {
    fn new(action: WatchAction) -> Self {
        Self {
            effects: Vec::new(),
            action,
        }
    }
}

/// Everything the dispatcher knows about a run
#[derive(Debug, Clone)]
pub struct RunState {
    run_id: String,
    phases: PhaseTracker,
    groups: GroupAggregator,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, config: &ExperimentConfig) -> Self {
        Self {
            run_id: run_id.into(),
            phases: PhaseTracker::new(config),
            groups: GroupAggregator::new(config),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn phases(&self) -> &PhaseTracker {
        &self.phases
    }

    pub fn groups(&self) -> &GroupAggregator {
        &self.groups
    }

    /// Apply a client's registration count (level 0 → level 1)
    pub fn on_endpoints(&mut self, kind: EndpointKind, client: &ClientId, count: usize) -> Outcome {
        let Some(tracker) = self.phases.endpoint_mut(kind, client) else {
            debug!("Ignoring {} snapshot for unconfigured client {}", kind, client);
            return Outcome::new(WatchAction::Stop);
        };
        let transition = tracker.observe(count);
        let action = if tracker.needs_watch() {
            WatchAction::Rearm
        } else {
            WatchAction::Stop
        };

        let mut outcome = Outcome::new(action);
        let region = client.region();
        match transition {
            Some(GroupTransition::Completed) => {
                info!("All {} have joined on client {}", kind.plural(), client);
                standard::JOINED_CLIENTS.inc();
                outcome.effects.push(Effect::MarkClient {
                    kind,
                    client: client.clone(),
                });
                if let Some(GroupTransition::Completed) = self.groups.client_completed(kind, region) {
                    info!("All {} clients in region {} have joined", kind, region);
                    standard::JOINED_REGIONS.inc();
                    outcome.effects.push(Effect::MarkRegion {
                        kind,
                        region: region.clone(),
                    });
                }
            }
            Some(GroupTransition::Drained) => {
                info!("All {} have left client {}", kind.plural(), client);
                standard::JOINED_CLIENTS.dec();
                outcome.effects.push(Effect::UnmarkClient {
                    kind,
                    client: client.clone(),
                });
                if let Some(GroupTransition::Drained) = self.groups.client_drained(kind, region) {
                    info!("All {} clients in region {} have left", kind, region);
                    standard::JOINED_REGIONS.dec();
                    outcome.effects.push(Effect::UnmarkRegion {
                        kind,
                        region: region.clone(),
                    });
                }
            }
            None => {}
        }
        outcome
    }

    /// Apply the number of region markers under the joined path (level 2)
    pub fn on_joined(&mut self, kind: EndpointKind, regions: usize) -> Outcome {
        let mut outcome = Outcome::new(WatchAction::Rearm);
        match self.groups.observe_joined(kind, regions) {
            Some(GroupTransition::Completed) => {
                info!("All regions have joined {}", kind.plural());
                outcome.effects.push(Effect::OpenBarrier(BarrierKind::joined(kind)));
            }
            Some(GroupTransition::Drained) => {
                info!("All {} have left every region", kind.plural());
                outcome.effects.push(Effect::OpenBarrier(BarrierKind::Finished));
            }
            None => debug!(
                "{} of {} regions joined {}",
                regions,
                self.groups.global(kind).expected(),
                kind.plural()
            ),
        }

        // Publishers never drain, so their global group is done on completion
        let phase = self.groups.global(kind).phase();
        let done = match kind {
            EndpointKind::Publisher => phase != GroupPhase::Pending,
            EndpointKind::Subscriber => phase == GroupPhase::Drained,
        };
        if done {
            outcome.action = WatchAction::Stop;
        }
        outcome
    }

    /// Apply a snapshot of one broker type's monitor registrations
    pub fn on_monitors(&mut self, broker: BrokerKind, count: usize, cversion: u64) -> Outcome {
        let Some(tracker) = self.phases.monitor_mut(broker) else {
            return Outcome::new(WatchAction::Stop);
        };
        let exited = tracker.observe(count, cversion);
        let still_running = tracker.phase() == MonitorPhase::Running;

        let mut outcome = Outcome::new(if still_running {
            WatchAction::Rearm
        } else {
            WatchAction::Stop
        });
        if exited {
            info!("All {} monitors have exited", broker);
        }
        if exited && self.phases.monitoring_complete() {
            info!("Monitoring complete on every broker type");
            outcome.effects.push(Effect::OpenBarrier(BarrierKind::Monitoring));
        }
        outcome
    }

    /// Open the monitoring barrier if no broker type has anything to wait for
    pub fn initial_effects(&self) -> Vec<Effect> {
        if self.phases.monitoring_complete() {
            vec![Effect::OpenBarrier(BarrierKind::Monitoring)]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExperimentConfig {
        ExperimentConfig::parse(
            "rbs:rb1
ebs:eb1
clients:cliA-1,cliA-2,cliB-1
topics:t1
sub_distribution:cliA-1:t1:3,cliA-2:t1:2,cliB-1:t1:1
pub_distribution:cliA-1:t1:1",
        )
        .unwrap()
    }

    fn client(host: &str) -> ClientId {
        ClientId::parse(host).unwrap()
    }

    #[test]
    fn test_region_marker_after_last_client() {
        let mut state = RunState::new("r1", &config());
        let sub = EndpointKind::Subscriber;

        let outcome = state.on_endpoints(sub, &client("cliA-1"), 3);
        assert_eq!(
            outcome.effects,
            vec![Effect::MarkClient {
                kind: sub,
                client: client("cliA-1")
            }]
        );
        assert_eq!(outcome.action, WatchAction::Rearm);

        let outcome = state.on_endpoints(sub, &client("cliA-2"), 2);
        assert!(outcome.effects.contains(&Effect::MarkRegion {
            kind: sub,
            region: RegionId::new("A")
        }));

        assert!(state.on_joined(sub, 1).effects.is_empty());
        let outcome = state.on_endpoints(sub, &client("cliB-1"), 1);
        assert!(outcome.effects.contains(&Effect::MarkRegion {
            kind: sub,
            region: RegionId::new("B")
        }));
        let outcome = state.on_joined(sub, 2);
        assert_eq!(outcome.effects, vec![Effect::OpenBarrier(BarrierKind::Subscriber)]);
    }

    #[test]
    fn test_publisher_watch_stops_after_join() {
        let mut state = RunState::new("r1", &config());
        let outcome = state.on_endpoints(EndpointKind::Publisher, &client("cliA-1"), 1);
        assert_eq!(outcome.action, WatchAction::Stop);

        let outcome = state.on_joined(EndpointKind::Publisher, 1);
        assert_eq!(
            outcome.effects,
            vec![Effect::OpenBarrier(BarrierKind::Publisher)]
        );
        assert_eq!(outcome.action, WatchAction::Stop);
    }

    #[test]
    fn test_finished_after_subscribers_drain() {
        let mut state = RunState::new("r1", &config());
        let sub = EndpointKind::Subscriber;
        let opened = state.on_joined(sub, 2);
        assert_eq!(opened.effects, vec![Effect::OpenBarrier(BarrierKind::Subscriber)]);

        let outcome = state.on_joined(sub, 1);
        assert!(outcome.effects.is_empty());
        assert_eq!(outcome.action, WatchAction::Rearm);

        let outcome = state.on_joined(sub, 0);
        assert_eq!(outcome.effects, vec![Effect::OpenBarrier(BarrierKind::Finished)]);
        assert_eq!(outcome.action, WatchAction::Stop);
    }

    #[test]
    fn test_monitoring_in_either_order() {
        for order in [
            [BrokerKind::Edge, BrokerKind::Routing],
            [BrokerKind::Routing, BrokerKind::Edge],
        ] {
            let mut state = RunState::new("r1", &config());
            assert!(state.initial_effects().is_empty());
            for broker in order {
                assert!(state.on_monitors(broker, 1, 1).effects.is_empty());
            }

            let first = state.on_monitors(order[0], 0, 2);
            assert!(first.effects.is_empty());
            assert_eq!(first.action, WatchAction::Stop);

            let second = state.on_monitors(order[1], 0, 2);
            assert_eq!(second.effects, vec![Effect::OpenBarrier(BarrierKind::Monitoring)]);
        }
    }
}
