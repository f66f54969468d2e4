//! Group counting
//!
//! A [`GroupCount`] compares an observed member count with a fixed expected
//! count and reports each transition exactly once. The same logic runs at
//! three levels: endpoints per client, clients per region, regions overall.

use std::collections::BTreeMap;
use tracing::debug;

use crate::config::{EndpointKind, ExperimentConfig, RegionId};
use crate::metrics::standard;

/// Lifecycle of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    /// Not every expected member has arrived yet
    Pending,
    /// Reached the expected count
    Complete,
    /// Emptied after completing; terminal
    Drained,
}

/// A one-time change of [`GroupPhase`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupTransition {
    Completed,
    Drained,
}

/// Count of members against an expected total
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCount {
    expected: usize,
    count: usize,
    phase: GroupPhase,
}

impl GroupCount {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            count: 0,
            phase: GroupPhase::Pending,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn phase(&self) -> GroupPhase {
        self.phase
    }

    /// Apply an observed count.
    ///
    /// A group completes only on exactly `expected` members; an overfull
    /// group stays pending until it settles back to `expected`. A jump to
    /// zero drains a completed group as if it had stepped down one member
    /// at a time.
    pub fn observe(&mut self, count: usize) -> Option<GroupTransition> {
        self.count = count;
        match self.phase {
            GroupPhase::Pending if self.expected > 0 && count == self.expected => {
                self.phase = GroupPhase::Complete;
                Some(GroupTransition::Completed)
            }
            GroupPhase::Complete if count == 0 => {
                self.phase = GroupPhase::Drained;
                Some(GroupTransition::Drained)
            }
            _ => None,
        }
    }

    pub fn increment(&mut self) -> Option<GroupTransition> {
        self.observe(self.count + 1)
    }

    /// Decrement without going below zero
    pub fn decrement(&mut self) -> Option<GroupTransition> {
        if self.count == 0 {
            standard::DUPLICATE_TRANSITIONS.inc();
            debug!("Ignoring decrement of an empty group");
            return None;
        }
        self.observe(self.count - 1)
    }
}

/// Region and global counters for one endpoint kind
#[derive(Debug, Clone)]
pub struct KindGroups {
    /// Level 1: complete clients per region
    regions: BTreeMap<RegionId, GroupCount>,
    /// Level 2: complete regions
    global: GroupCount,
}

impl KindGroups {
    fn new(membership: BTreeMap<RegionId, usize>) -> Self {
        let global = GroupCount::new(membership.len());
        let regions = membership
            .into_iter()
            .map(|(region, clients)| (region, GroupCount::new(clients)))
            .collect();
        Self { regions, global }
    }
}

/// Two-level aggregation of client completion into region and global
/// completion
#[derive(Debug, Clone)]
pub struct GroupAggregator {
    subscribers: KindGroups,
    publishers: KindGroups,
}

impl GroupAggregator {
    pub fn new(config: &ExperimentConfig) -> Self {
        Self::from_membership(
            config.region_membership(EndpointKind::Subscriber),
            config.region_membership(EndpointKind::Publisher),
        )
    }

    pub fn from_membership(
        subscribers: BTreeMap<RegionId, usize>,
        publishers: BTreeMap<RegionId, usize>,
    ) -> Self {
        Self {
            subscribers: KindGroups::new(subscribers),
            publishers: KindGroups::new(publishers),
        }
    }

    fn groups(&self, kind: EndpointKind) -> &KindGroups {
        match kind {
            EndpointKind::Subscriber => &self.subscribers,
            EndpointKind::Publisher => &self.publishers,
        }
    }

    fn groups_mut(&mut self, kind: EndpointKind) -> &mut KindGroups {
        match kind {
            EndpointKind::Subscriber => &mut self.subscribers,
            EndpointKind::Publisher => &mut self.publishers,
        }
    }

    /// A client of `region` completed
    pub fn client_completed(
        &mut self,
        kind: EndpointKind,
        region: &RegionId,
    ) -> Option<GroupTransition> {
        self.groups_mut(kind)
            .regions
            .get_mut(region)
            .and_then(GroupCount::increment)
    }

    /// A completed client of `region` emptied
    pub fn client_drained(
        &mut self,
        kind: EndpointKind,
        region: &RegionId,
    ) -> Option<GroupTransition> {
        self.groups_mut(kind)
            .regions
            .get_mut(region)
            .and_then(GroupCount::decrement)
    }

    /// Apply the number of region markers seen under the joined path
    pub fn observe_joined(&mut self, kind: EndpointKind, regions: usize) -> Option<GroupTransition> {
        self.groups_mut(kind).global.observe(regions)
    }

    pub fn region(&self, kind: EndpointKind, region: &RegionId) -> Option<&GroupCount> {
        self.groups(kind).regions.get(region)
    }

    pub fn global(&self, kind: EndpointKind) -> &GroupCount {
        &self.groups(kind).global
    }

    /// Regions that have not completed yet
    pub fn pending_regions(&self, kind: EndpointKind) -> Vec<RegionId> {
        self.groups(kind)
            .regions
            .iter()
            .filter(|(_, group)| group.phase() == GroupPhase::Pending)
            .map(|(region, _)| region.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_once() {
        let mut group = GroupCount::new(3);
        assert_eq!(group.observe(1), None);
        assert_eq!(group.observe(3), Some(GroupTransition::Completed));
        assert_eq!(group.observe(3), None);
        assert_eq!(group.observe(2), None);
        assert_eq!(group.observe(3), None);
        assert_eq!(group.phase(), GroupPhase::Complete);
    }

    #[test]
    fn test_overfull_group_stays_pending() {
        let mut group = GroupCount::new(3);
        assert_eq!(group.observe(4), None);
        assert_eq!(group.phase(), GroupPhase::Pending);
        assert_eq!(group.observe(0), None);
        assert_eq!(group.observe(3), Some(GroupTransition::Completed));
    }

    #[test]
    fn test_jump_to_zero_drains() {
        let mut group = GroupCount::new(3);
        group.observe(3);
        assert_eq!(group.observe(0), Some(GroupTransition::Drained));
        assert_eq!(group.observe(3), None);
        assert_eq!(group.phase(), GroupPhase::Drained);
    }

    #[test]
    fn test_empty_before_complete_is_not_a_transition() {
        let mut group = GroupCount::new(2);
        group.observe(1);
        assert_eq!(group.observe(0), None);
        assert_eq!(group.decrement(), None);
        assert_eq!(group.count(), 0);
        assert_eq!(group.phase(), GroupPhase::Pending);
    }

    #[test]
    fn test_zero_expected_never_completes() {
        let mut group = GroupCount::new(0);
        assert_eq!(group.observe(0), None);
        assert_eq!(group.observe(1), None);
    }

    #[test]
    fn test_region_then_global() {
        let membership: BTreeMap<_, _> =
            [(RegionId::new("A"), 2), (RegionId::new("B"), 1)].into();
        let mut groups = GroupAggregator::from_membership(membership.clone(), membership);
        let a = RegionId::new("A");
        let b = RegionId::new("B");

        assert_eq!(groups.client_completed(EndpointKind::Subscriber, &a), None);
        assert_eq!(groups.pending_regions(EndpointKind::Subscriber), vec![a.clone(), b.clone()]);
        assert_eq!(
            groups.client_completed(EndpointKind::Subscriber, &a),
            Some(GroupTransition::Completed)
        );
        assert_eq!(
            groups.client_completed(EndpointKind::Subscriber, &b),
            Some(GroupTransition::Completed)
        );
        assert!(groups.pending_regions(EndpointKind::Subscriber).is_empty());

        assert_eq!(groups.observe_joined(EndpointKind::Subscriber, 1), None);
        assert_eq!(
            groups.observe_joined(EndpointKind::Subscriber, 2),
            Some(GroupTransition::Completed)
        );
        assert_eq!(
            groups.global(EndpointKind::Publisher).phase(),
            GroupPhase::Pending
        );
    }

    #[test]
    fn test_unknown_region_is_ignored() {
        let mut groups = GroupAggregator::from_membership(BTreeMap::new(), BTreeMap::new());
        assert_eq!(
            groups.client_completed(EndpointKind::Publisher, &RegionId::new("Z")),
            None
        );
    }
}
