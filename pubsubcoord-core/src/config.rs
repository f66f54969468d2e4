//! Experiment configuration
//!
//! Parses the line-oriented experiment file (`key:value` per line) into a
//! typed [`ExperimentConfig`]. Client host names are validated here, once,
//! so the watch handlers never have to slice strings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::{CoordError, Result};

/// Host name prefix shared by every client machine
pub const CLIENT_PREFIX: &str = "cli";

/// Kind of endpoint process running on a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Subscriber,
    Publisher,
}

impl EndpointKind {
    /// Both kinds, subscribers first
    pub const ALL: [EndpointKind; 2] = [EndpointKind::Subscriber, EndpointKind::Publisher];

    /// Tree path segment for this kind
    pub fn segment(self) -> &'static str {
        match self {
            EndpointKind::Subscriber => "sub",
            EndpointKind::Publisher => "pub",
        }
    }

    /// Plural noun used in progress logs
    pub fn plural(self) -> &'static str {
        match self {
            EndpointKind::Subscriber => "subscribers",
            EndpointKind::Publisher => "publishers",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EndpointKind::Subscriber => "subscriber",
            EndpointKind::Publisher => "publisher",
        })
    }
}

impl FromStr for EndpointKind {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sub" | "subscriber" => Ok(EndpointKind::Subscriber),
            "pub" | "publisher" => Ok(EndpointKind::Publisher),
            other => Err(CoordError::InvalidConfig {
                reason: format!("unknown endpoint kind {:?}", other),
            }),
        }
    }
}

/// Broker type whose monitors report to the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Edge broker (eb)
    Edge,
    /// Routing broker (rb)
    Routing,
}

impl BrokerKind {
    pub const ALL: [BrokerKind; 2] = [BrokerKind::Edge, BrokerKind::Routing];

    /// Tree path segment for this broker type
    pub fn segment(self) -> &'static str {
        match self {
            BrokerKind::Edge => "eb",
            BrokerKind::Routing => "rb",
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

impl FromStr for BrokerKind {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "eb" | "edge" => Ok(BrokerKind::Edge),
            "rb" | "routing" => Ok(BrokerKind::Routing),
            other => Err(CoordError::InvalidConfig {
                reason: format!("unknown broker kind {:?}", other),
            }),
        }
    }
}

/// Logical region a client belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(String);

impl RegionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tree path segment (`region_<id>`)
    pub fn segment(&self) -> String {
        format!("region_{}", self.0)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client machine identity, `cli<region>-<index>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId {
    host: String,
    region: RegionId,
    index: u32,
}

impl ClientId {
    /// Parse and validate a client host name
    pub fn parse(host: &str) -> Result<Self> {
        let invalid = |reason: &str| CoordError::InvalidClientId {
            client: host.to_string(),
            reason: reason.to_string(),
        };

        let rest = host
            .strip_prefix(CLIENT_PREFIX)
            .ok_or_else(|| invalid("missing `cli` prefix"))?;
        let (region, index) = rest
            .split_once('-')
            .ok_or_else(|| invalid("expected `cli<region>-<index>`"))?;

        if region.is_empty() || !region.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("region must be a non-empty alphanumeric segment"));
        }
        let index = index
            .parse::<u32>()
            .map_err(|_| invalid("client index must be an unsigned integer"))?;

        Ok(Self {
            host: host.to_string(),
            region: RegionId::new(region),
            index,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn region(&self) -> &RegionId {
        &self.region
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)
    }
}

impl TryFrom<String> for ClientId {
    type Error = CoordError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ClientId> for String {
    fn from(value: ClientId) -> Self {
        value.host
    }
}

/// Topic → endpoint count for one client
pub type TopicCounts = BTreeMap<String, u32>;

/// Typed experiment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Run id embedded in the file, if any
    pub run_id: Option<String>,
    /// Routing broker hosts
    pub routing_brokers: Vec<String>,
    /// Edge broker hosts
    pub edge_brokers: Vec<String>,
    /// All client hosts
    pub clients: Vec<ClientId>,
    /// All topics
    pub topics: Vec<String>,
    /// Subscriber distribution per client
    pub subscribers: BTreeMap<ClientId, TopicCounts>,
    /// Publisher distribution per client
    pub publishers: BTreeMap<ClientId, TopicCounts>,
    /// Samples each publisher sends
    pub pub_sample_count: u64,
    /// Samples each subscriber waits for
    pub sub_sample_count: u64,
    /// Publisher send interval in milliseconds
    pub sleep_interval_ms: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            routing_brokers: Vec::new(),
            edge_brokers: Vec::new(),
            clients: Vec::new(),
            topics: Vec::new(),
            subscribers: BTreeMap::new(),
            publishers: BTreeMap::new(),
            pub_sample_count: 5000,
            sub_sample_count: 5000,
            sleep_interval_ms: 50,
        }
    }
}

impl ExperimentConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        debug!("Loaded experiment configuration from {}", path.display());
        Self::parse(&text)
    }

    /// Parse and validate configuration text
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = Self::default();
        let mut declared_subs = None;
        let mut declared_pubs = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (key, value) = line.split_once(':').ok_or_else(|| CoordError::InvalidConfig {
                reason: format!("expected `key:value`, got {:?}", line),
            })?;

            match key {
                "run_id" => config.run_id = Some(value.to_string()),
                "rbs" => config.routing_brokers = split_list(value),
                "ebs" => config.edge_brokers = split_list(value),
                "clients" => {
                    config.clients = split_list(value)
                        .iter()
                        .map(|host| ClientId::parse(host))
                        .collect::<Result<_>>()?;
                }
                "topics" => config.topics = split_list(value),
                "no_subs" => declared_subs = Some(parse_number::<u32>(key, value)?),
                "no_pubs" => declared_pubs = Some(parse_number::<u32>(key, value)?),
                "sub_distribution" => config.subscribers = parse_distribution(value)?,
                "pub_distribution" => config.publishers = parse_distribution(value)?,
                "pub_sample_count" => config.pub_sample_count = parse_number(key, value)?,
                "sub_sample_count" => config.sub_sample_count = parse_number(key, value)?,
                "sleep_interval" => config.sleep_interval_ms = parse_number(key, value)?,
                other => warn!("Ignoring unknown configuration key {:?}", other),
            }
        }

        config.validate(declared_subs, declared_pubs)?;
        Ok(config)
    }

    fn validate(&self, declared_subs: Option<u32>, declared_pubs: Option<u32>) -> Result<()> {
        for kind in EndpointKind::ALL {
            let distribution = self.distribution(kind);
            if distribution.is_empty() {
                return Err(CoordError::InvalidConfig {
                    reason: format!("no {} configured", kind.plural()),
                });
            }

            for (client, topics) in distribution {
                if !self.clients.contains(client) {
                    return Err(CoordError::InvalidConfig {
                        reason: format!("{} host {} is not listed under clients", kind, client),
                    });
                }
                if let Some((topic, _)) = topics.iter().find(|(_, count)| **count == 0) {
                    return Err(CoordError::InvalidConfig {
                        reason: format!("zero {} for topic {} on {}", kind.plural(), topic, client),
                    });
                }
                for topic in topics.keys() {
                    if !self.topics.is_empty() && !self.topics.contains(topic) {
                        warn!("Topic {} on {} is not listed under topics", topic, client);
                    }
                }
            }

            let declared = match kind {
                EndpointKind::Subscriber => declared_subs,
                EndpointKind::Publisher => declared_pubs,
            };
            let total = self.total_endpoints(kind);
            if let Some(declared) = declared {
                if declared != total {
                    warn!(
                        "Declared {} {} but distribution adds up to {}",
                        declared,
                        kind.plural(),
                        total
                    );
                }
            }
        }
        Ok(())
    }

    /// Per-client topic distribution for an endpoint kind
    pub fn distribution(&self, kind: EndpointKind) -> &BTreeMap<ClientId, TopicCounts> {
        match kind {
            EndpointKind::Subscriber => &self.subscribers,
            EndpointKind::Publisher => &self.publishers,
        }
    }

    /// Expected endpoint count per client
    pub fn endpoint_counts(&self, kind: EndpointKind) -> BTreeMap<ClientId, u32> {
        self.distribution(kind)
            .iter()
            .map(|(client, topics)| (client.clone(), topics.values().sum()))
            .collect()
    }

    /// Number of distinct clients per region that run this endpoint kind
    pub fn region_membership(&self, kind: EndpointKind) -> BTreeMap<RegionId, usize> {
        let mut membership = BTreeMap::new();
        for client in self.distribution(kind).keys() {
            *membership.entry(client.region().clone()).or_insert(0) += 1;
        }
        membership
    }

    /// Total endpoints of one kind across all clients
    pub fn total_endpoints(&self, kind: EndpointKind) -> u32 {
        self.distribution(kind)
            .values()
            .flat_map(|topics| topics.values())
            .sum()
    }

    /// Broker hosts of one type
    pub fn brokers(&self, kind: BrokerKind) -> &[String] {
        match kind {
            BrokerKind::Edge => &self.edge_brokers,
            BrokerKind::Routing => &self.routing_brokers,
        }
    }

    /// Every broker host, edge brokers first
    pub fn broker_hosts(&self) -> Vec<String> {
        self.edge_brokers
            .iter()
            .chain(self.routing_brokers.iter())
            .cloned()
            .collect()
    }

    /// Every host taking part in the experiment
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts = self.broker_hosts();
        hosts.extend(self.clients.iter().map(|c| c.host().to_string()));
        hosts
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| CoordError::InvalidConfig {
        reason: format!("{} must be a non-negative integer, got {:?}", key, value),
    })
}

/// `host:topic:count,host:topic:count,...`
fn parse_distribution(value: &str) -> Result<BTreeMap<ClientId, TopicCounts>> {
    let mut distribution: BTreeMap<ClientId, TopicCounts> = BTreeMap::new();
    for entry in split_list(value) {
        let mut parts = entry.split(':');
        let (Some(host), Some(topic), Some(count), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CoordError::InvalidConfig {
                reason: format!("expected `host:topic:count`, got {:?}", entry),
            });
        };
        let client = ClientId::parse(host)?;
        let count: u32 = parse_number("endpoint count", count)?;
        *distribution
            .entry(client)
            .or_default()
            .entry(topic.to_string())
            .or_insert(0) += count;
    }
    Ok(distribution)
}
