//! Tree paths used by one experiment run

use crate::config::{BrokerKind, ClientId, EndpointKind, RegionId};
use crate::protocol::barrier::BarrierKind;
use crate::tree::join;

/// Root prefixes of the experiment namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLayout {
    /// Parent of every run
    pub root: String,
    /// External namespace removed by cleanup
    pub topics_root: String,
}

impl Default for TreeLayout {
    fn default() -> Self {
        Self {
            root: "/experiment".into(),
            topics_root: "/topics".into(),
        }
    }
}

impl TreeLayout {
    pub fn run(&self, run_id: &str) -> RunPaths {
        RunPaths {
            base: join(&self.root, run_id),
        }
    }
}

/// Paths under `/<root>/<run_id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    base: String,
}

impl RunPaths {
    pub fn base(&self) -> &str {
        &self.base
    }

    /// `…/sub` or `…/pub`
    pub fn registrations(&self, kind: EndpointKind) -> String {
        join(&self.base, kind.segment())
    }

    pub fn region_registrations(&self, kind: EndpointKind, region: &RegionId) -> String {
        join(&self.registrations(kind), &region.segment())
    }

    /// Parent of one client's endpoint registration nodes
    pub fn client_registrations(&self, kind: EndpointKind, client: &ClientId) -> String {
        join(
            &self.region_registrations(kind, client.region()),
            client.host(),
        )
    }

    /// `…/progress_sub` or `…/progress_pub`
    pub fn progress(&self, kind: EndpointKind) -> String {
        join(&self.base, &format!("progress_{}", kind.segment()))
    }

    pub fn region_progress(&self, kind: EndpointKind, region: &RegionId) -> String {
        join(&self.progress(kind), &region.segment())
    }

    /// Marker written once a client has all its endpoints registered
    pub fn client_marker(&self, kind: EndpointKind, client: &ClientId) -> String {
        join(&self.region_progress(kind, client.region()), client.host())
    }

    /// `…/joined_sub` or `…/joined_pub`
    pub fn joined(&self, kind: EndpointKind) -> String {
        join(&self.base, &format!("joined_{}", kind.segment()))
    }

    /// Marker written once every client of a region has joined
    pub fn region_marker(&self, kind: EndpointKind, region: &RegionId) -> String {
        join(&self.joined(kind), &region.segment())
    }

    pub fn monitoring(&self) -> String {
        join(&self.base, "monitoring")
    }

    pub fn monitors(&self, broker: BrokerKind) -> String {
        join(&self.monitoring(), broker.segment())
    }

    pub fn monitor_node(&self, broker: BrokerKind, host: &str) -> String {
        join(&self.monitors(broker), &monitor_node_name(host))
    }

    pub fn barriers(&self) -> String {
        join(&self.base, "barriers")
    }

    pub fn barrier(&self, kind: BarrierKind) -> String {
        join(&self.barriers(), kind.segment())
    }

    /// Every persistent directory a run needs before endpoints start
    pub fn directories<'a>(
        &self,
        clients: impl IntoIterator<Item = (EndpointKind, &'a ClientId)>,
    ) -> Vec<String> {
        let mut dirs = Vec::new();
        for kind in EndpointKind::ALL {
            dirs.push(self.registrations(kind));
            dirs.push(self.progress(kind));
            dirs.push(self.joined(kind));
        }
        for (kind, client) in clients {
            dirs.push(self.client_registrations(kind, client));
            dirs.push(self.region_progress(kind, client.region()));
        }
        for broker in BrokerKind::ALL {
            dirs.push(self.monitors(broker));
        }
        dirs.push(self.barriers());
        dirs.sort();
        dirs.dedup();
        dirs
    }
}

/// Name of one endpoint registration node
pub fn endpoint_node_name(topic: &str, client: &ClientId, pid: u32) -> String {
    format!("{}_{}_{}", topic, client.host(), pid)
}

pub fn monitor_node_name(host: &str) -> String {
    format!("monitor_{}", host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_paths() {
        let paths = TreeLayout::default().run("run7");
        let client = ClientId::parse("cli2-1").unwrap();

        assert_eq!(
            paths.client_registrations(EndpointKind::Publisher, &client),
            "/experiment/run7/pub/region_2/cli2-1"
        );
        assert_eq!(
            paths.client_marker(EndpointKind::Subscriber, &client),
            "/experiment/run7/progress_sub/region_2/cli2-1"
        );
        assert_eq!(
            paths.region_marker(EndpointKind::Subscriber, client.region()),
            "/experiment/run7/joined_sub/region_2"
        );
        assert_eq!(
            paths.monitor_node(BrokerKind::Routing, "rb1"),
            "/experiment/run7/monitoring/rb/monitor_rb1"
        );
        assert_eq!(
            paths.barrier(BarrierKind::Finished),
            "/experiment/run7/barriers/finished"
        );
        assert_eq!(endpoint_node_name("t1", &client, 42), "t1_cli2-1_42");
    }

    #[test]
    fn test_directories_are_unique() {
        let paths = TreeLayout::default().run("r");
        let a = ClientId::parse("cli1-1").unwrap();
        let b = ClientId::parse("cli1-2").unwrap();
        let dirs = paths.directories([
            (EndpointKind::Subscriber, &a),
            (EndpointKind::Subscriber, &b),
            (EndpointKind::Publisher, &a),
        ]);

        assert!(dirs.contains(&"/experiment/r/progress_sub/region_1".to_string()));
        assert!(dirs.contains(&"/experiment/r/monitoring/eb".to_string()));
        let region_progress = dirs
            .iter()
            .filter(|d| d.as_str() == "/experiment/r/progress_sub/region_1")
            .count();
        assert_eq!(region_progress, 1);
    }
}
