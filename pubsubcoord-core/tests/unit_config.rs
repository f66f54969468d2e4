//! Unit tests for experiment configuration loading
//!
//! Exercises the file format end to end through `ExperimentConfig::load`.

use std::io::Write;

use pubsubcoord_core::config::{BrokerKind, ClientId, EndpointKind, ExperimentConfig, RegionId};
use pubsubcoord_core::CoordError;

const EXPERIMENT: &str = "rbs:rb1
ebs:eb1,eb2
clients:cliA-1,cliA-2,cliB-1
topics:t1,t2
no_subs:6
no_pubs:2
sub_distribution:cliA-1:t1:3,cliA-2:t1:2,cliB-1:t2:1
pub_distribution:cliA-1:t1:1,cliB-1:t2:1
pub_sample_count:200
sub_sample_count:400
sleep_interval:25
run_id:nightly-7
";

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_from_file() {
    let file = write_config(EXPERIMENT);
    let config = ExperimentConfig::load(file.path()).unwrap();

    assert_eq!(config.run_id.as_deref(), Some("nightly-7"));
    assert_eq!(config.brokers(BrokerKind::Edge), ["eb1", "eb2"]);
    assert_eq!(config.brokers(BrokerKind::Routing), ["rb1"]);
    assert_eq!(config.pub_sample_count, 200);
    assert_eq!(config.sub_sample_count, 400);
    assert_eq!(config.sleep_interval_ms, 25);
    assert_eq!(config.hosts().len(), 6);
}

#[test]
fn test_two_level_membership() {
    let config = ExperimentConfig::parse(EXPERIMENT).unwrap();

    let subs = config.region_membership(EndpointKind::Subscriber);
    assert_eq!(subs[&RegionId::new("A")], 2);
    assert_eq!(subs[&RegionId::new("B")], 1);

    let counts = config.endpoint_counts(EndpointKind::Subscriber);
    assert_eq!(counts[&ClientId::parse("cliA-1").unwrap()], 3);
    assert_eq!(counts[&ClientId::parse("cliB-1").unwrap()], 1);
    assert_eq!(config.total_endpoints(EndpointKind::Publisher), 2);
}

#[test]
fn test_malformed_client_rejected_at_load() {
    let file = write_config(&EXPERIMENT.replace("clients:cliA-1", "clients:clientA1,cliA-1"));
    assert!(matches!(
        ExperimentConfig::load(file.path()),
        Err(CoordError::InvalidClientId { .. })
    ));
}

#[test]
fn test_malformed_distribution_entry() {
    let text = EXPERIMENT.replace("cliB-1:t2:1\n", "cliB-1:t2\n");
    assert!(matches!(
        ExperimentConfig::parse(&text),
        Err(CoordError::InvalidConfig { .. })
    ));
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = ExperimentConfig::load(dir.path().join("absent.conf"));
    assert!(matches!(result, Err(CoordError::Io(_))));
}
