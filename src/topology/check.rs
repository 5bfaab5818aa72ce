//! Topology validation.
//!
//! Every check runs and every violation is collected, so the user sees the
//! whole list in one pass. Nothing here touches kernel state except the
//! read-only lookup of bridge host interfaces.

use super::patterns::PATTERNS;
use super::types::{BridgeSpec, LinkSpec, NodeSpec, PeerRef, TopologyDescription};
use crate::errors::TopologyError;
use crate::link::{Netns, NetworkStack};
use log::debug;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Outcome of a topology check.
#[derive(Debug, Default)]
pub struct CheckReport {
    /// The parsed description, `None` when the file could not be parsed
    pub topology: Option<TopologyDescription>,
    pub errors: Vec<TopologyError>,
}

impl CheckReport {
    pub fn is_valid(&self) -> bool {
        self.topology.is_some() && self.errors.is_empty()
    }
}

/// Read, parse and check the topology file at `path`.
///
/// A read or parse failure yields a single error and no description.
pub fn check_topology(path: &Path, stack: &dyn NetworkStack) -> CheckReport {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            return CheckReport {
                topology: None,
                errors: vec![TopologyError::Read {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }],
            }
        }
    };

    let topology: TopologyDescription = match serde_yaml::from_str(&content) {
        Ok(topology) => topology,
        Err(e) => {
            return CheckReport {
                topology: None,
                errors: vec![TopologyError::Parse {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }],
            }
        }
    };

    let errors = check_description(&topology, |host| {
        stack.link_exists(host, &Netns::Root)
    });
    debug!("Checked {:?}: {} error(s)", path, errors.len());

    CheckReport {
        topology: Some(topology),
        errors,
    }
}

/// Check an already parsed description.
///
/// `host_link_exists` tells whether a bridge host interface is present in
/// the root namespace.
pub fn check_description<F>(topology: &TopologyDescription, host_link_exists: F) -> Vec<TopologyError>
where
    F: Fn(&str) -> bool,
{
    let mut errors = Vec::new();

    for (name, spec) in &topology.nodes {
        check_node(name, spec, &mut errors);
    }

    let mut used_peers: HashSet<PeerRef> = HashSet::new();
    for link in &topology.links {
        check_link(link, &topology.nodes, &mut used_peers, &mut errors);
    }

    for (name, spec) in &topology.bridges {
        check_bridge(
            name,
            spec,
            &topology.nodes,
            &mut used_peers,
            &host_link_exists,
            &mut errors,
        );
    }

    errors
}

fn check_node(name: &str, spec: &NodeSpec, errors: &mut Vec<TopologyError>) {
    if !PATTERNS.name.is_match(name) {
        errors.push(TopologyError::InvalidNodeName(name.to_string()));
    }

    if !PATTERNS.node_type.is_match(&spec.kind) {
        errors.push(TopologyError::InvalidNodeType {
            name: name.to_string(),
            kind: spec.kind.clone(),
        });
    }

    // more checks on switches
    if spec.kind == "ovs" {
        if PATTERNS.name.is_match(name) && !PATTERNS.switch_name.is_match(name) {
            errors.push(TopologyError::SwitchNameTooLong(name.to_string()));
        }
        if spec.mpls {
            errors.push(TopologyError::SwitchMpls(name.to_string()));
        }
    }

    for bind in &spec.volumes {
        if !PATTERNS.volume.is_match(bind) {
            errors.push(TopologyError::InvalidVolume {
                node: name.to_string(),
                bind: bind.clone(),
            });
            continue;
        }

        if let Some((host_path, _)) = bind.split_once(':') {
            if !Path::new(host_path).exists() {
                errors.push(TopologyError::MissingVolumePath {
                    node: name.to_string(),
                    path: host_path.to_string(),
                });
            }
        }
    }
}

/// Check one peer string; valid-format peers are returned for bookkeeping.
///
/// Reuse is tracked on the parsed `(node, ifIndex)` pair, so `A.0` and
/// `A.00` name the same interface.
fn check_peer(
    peer: &str,
    nodes: &BTreeMap<String, NodeSpec>,
    used_peers: &HashSet<PeerRef>,
    errors: &mut Vec<TopologyError>,
) -> Option<PeerRef> {
    let Some(peer_ref) = PeerRef::parse(peer) else {
        errors.push(TopologyError::InvalidPeer(peer.to_string()));
        return None;
    };

    if used_peers.contains(&peer_ref) {
        errors.push(TopologyError::PeerReused(peer.to_string()));
    } else if !nodes.contains_key(&peer_ref.node) {
        errors.push(TopologyError::UnknownNode(peer_ref.node.clone()));
    }

    Some(peer_ref)
}

fn check_link(
    link: &LinkSpec,
    nodes: &BTreeMap<String, NodeSpec>,
    used_peers: &mut HashSet<PeerRef>,
    errors: &mut Vec<TopologyError>,
) {
    let peer1 = check_peer(&link.peer1, nodes, used_peers, errors);
    let same_peer = match &peer1 {
        Some(p1) => PeerRef::parse(&link.peer2).as_ref() == Some(p1),
        None => link.peer1 == link.peer2,
    };
    let peer2 = if same_peer {
        if peer1.is_some() {
            errors.push(TopologyError::SamePeer(link.peer1.clone()));
        }
        None
    } else {
        check_peer(&link.peer2, nodes, used_peers, errors)
    };

    used_peers.extend(peer1);
    used_peers.extend(peer2);

    errors.extend(shaping_errors(link));
}

/// Violations of the shaping parameter rules of one link.
pub fn shaping_errors(link: &LinkSpec) -> Vec<TopologyError> {
    let mut errors = Vec::new();
    let label = link.label();
    let mut shaping = |reason: &str| {
        errors.push(TopologyError::InvalidShaping {
            link: label.clone(),
            reason: reason.to_string(),
        })
    };

    // netem parameters
    if link.delay < 0 {
        shaping("delay must be >= 0 and specified in ms");
    }
    if link.jitter < 0 {
        shaping("jitter must be >= 0 and specified in ms");
    }
    if link.loss < 0.0 {
        shaping("loss must be >= 0 and specified in percent");
    }
    if link.loss > 100.0 {
        shaping("loss must be <= 100 and specified in percent");
    }
    if link.jitter > 0 && link.delay == 0 {
        shaping("delay must be set with jitter");
    }

    // tbf parameters
    if link.rate < 0 {
        shaping("rate must be >= 0 and specified in kbps");
    }
    if link.rate > 0 && link.delay <= 0 {
        shaping("delay must be > 0 when rate is configured");
    }
    if link.buffer < 0.0 {
        shaping("buffer must be >= 0 and specified as a BDP scale factor");
    }
    if link.buffer > 0.0 && link.rate <= 0 {
        shaping("rate must be > 0 when buffer is configured");
    }

    errors
}

fn check_bridge<F>(
    name: &str,
    spec: &BridgeSpec,
    nodes: &BTreeMap<String, NodeSpec>,
    used_peers: &mut HashSet<PeerRef>,
    host_link_exists: &F,
    errors: &mut Vec<TopologyError>,
) where
    F: Fn(&str) -> bool,
{
    if !PATTERNS.name.is_match(name) {
        errors.push(TopologyError::InvalidBridgeName(name.to_string()));
    }

    if spec.host.is_empty() || !host_link_exists(&spec.host) {
        errors.push(TopologyError::MissingHostInterface {
            bridge: name.to_string(),
            host: spec.host.clone(),
        });
    }

    for peer in &spec.interfaces {
        if let Some(peer_ref) = check_peer(peer, nodes, used_peers, errors) {
            used_peers.insert(peer_ref);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNetwork;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(yaml: &str) -> TopologyDescription {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn check(yaml: &str) -> Vec<TopologyError> {
        check_description(&parse(yaml), |host| host == "eth0")
    }

    #[test]
    fn test_valid_topology() {
        let errors = check(
            r#"
nodes:
  switch: {type: ovs}
  R1: {type: docker.router, ipv6: true, mpls: true}
  host: {type: docker.host}
links:
  - {peer1: R1.0, peer2: switch.0, delay: 50, jitter: 5, loss: 2}
  - {peer1: host.0, peer2: switch.1, delay: 10, rate: 1000, buffer: 1.5}
bridges:
  lan: {host: eth0, interfaces: [R1.1]}
"#,
        );
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    }

    #[test]
    fn test_every_violation_is_reported() {
        let errors = check(
            r#"
nodes:
  R1: {type: docker.router}
  host: {type: test}
  verylongswitch: {type: ovs, mpls: true}
links:
  - {peer1: R1.0, peer2: R9.0}
  - {peer1: R1.0, peer2: host.x}
  - {peer1: host.1, peer2: host.1}
"#,
        );
        assert_eq!(
            errors,
            vec![
                TopologyError::InvalidNodeType {
                    name: "host".to_string(),
                    kind: "test".to_string()
                },
                TopologyError::SwitchNameTooLong("verylongswitch".to_string()),
                TopologyError::SwitchMpls("verylongswitch".to_string()),
                TopologyError::UnknownNode("R9".to_string()),
                TopologyError::PeerReused("R1.0".to_string()),
                TopologyError::InvalidPeer("host.x".to_string()),
                TopologyError::SamePeer("host.1".to_string()),
            ]
        );
    }

    #[test]
    fn test_reuse_reported_on_second_occurrence_only() {
        let errors = check(
            r#"
nodes:
  A: {type: docker.host}
  B: {type: docker.host}
  C: {type: docker.host}
links:
  - {peer1: A.0, peer2: B.0}
  - {peer1: C.0, peer2: B.0}
"#,
        );
        assert_eq!(errors, vec![TopologyError::PeerReused("B.0".to_string())]);
    }

    #[test]
    fn test_reuse_detected_across_index_spellings() {
        let errors = check(
            r#"
nodes:
  A: {type: docker.host}
  B: {type: docker.host}
  C: {type: docker.host}
links:
  - {peer1: A.0, peer2: B.0}
  - {peer1: A.00, peer2: C.0}
  - {peer1: C.1, peer2: C.01}
bridges:
  lan: {host: eth0, interfaces: [B.000]}
"#,
        );
        assert_eq!(
            errors,
            vec![
                TopologyError::PeerReused("A.00".to_string()),
                TopologyError::SamePeer("C.1".to_string()),
                TopologyError::PeerReused("B.000".to_string()),
            ]
        );
    }

    #[test]
    fn test_shaping_constraints() {
        let errors = check(
            r#"
nodes:
  A: {type: docker.host}
  B: {type: docker.host}
links:
  - {peer1: A.0, peer2: B.0, jitter: 5, loss: 120, rate: 100, buffer: -1}
"#,
        );
        let reasons: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        assert_eq!(errors.len(), 4, "{:?}", reasons);
        assert!(reasons.iter().any(|r| r.contains("loss must be <= 100")));
        assert!(reasons.iter().any(|r| r.contains("delay must be set with jitter")));
        assert!(reasons.iter().any(|r| r.contains("delay must be > 0 when rate")));
        assert!(reasons.iter().any(|r| r.contains("buffer must be >= 0")));
    }

    #[test]
    fn test_bridge_checks() {
        let errors = check(
            r#"
nodes:
  A: {type: docker.host}
links:
  - {peer1: A.0, peer2: A.1}
bridges:
  lan: {host: wlan9, interfaces: [A.1, A.2, B.0]}
"#,
        );
        assert_eq!(
            errors,
            vec![
                TopologyError::MissingHostInterface {
                    bridge: "lan".to_string(),
                    host: "wlan9".to_string()
                },
                TopologyError::PeerReused("A.1".to_string()),
                TopologyError::UnknownNode("B".to_string()),
            ]
        );
    }

    #[test]
    fn test_volume_checks() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
nodes:
  A:
    type: docker.host
    volumes: ["{}:/data", "/does/not/exist:/data", "nocolon"]
"#,
            dir.path().display()
        );
        let errors = check(&yaml);
        assert_eq!(
            errors,
            vec![
                TopologyError::MissingVolumePath {
                    node: "A".to_string(),
                    path: "/does/not/exist".to_string()
                },
                TopologyError::InvalidVolume {
                    node: "A".to_string(),
                    bind: "nocolon".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_failure_is_single_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "nodes: [unterminated").unwrap();

        let report = check_topology(temp_file.path(), &FakeNetwork::new());
        assert!(report.topology.is_none());
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], TopologyError::Parse { .. }));
    }

    #[test]
    fn test_missing_file_is_single_error() {
        let report = check_topology(Path::new("/nonexistent/network.yml"), &FakeNetwork::new());
        assert!(!report.is_valid());
        assert!(matches!(report.errors[..], [TopologyError::Read { .. }]));
    }

    #[test]
    fn test_host_interface_looked_up_in_root_namespace() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(
            temp_file,
            "nodes:\n  A: {{type: docker.host}}\nbridges:\n  lan: {{host: eth0, interfaces: [A.0]}}\n"
        )
        .unwrap();

        let network = FakeNetwork::new();
        assert!(!check_topology(temp_file.path(), &network).is_valid());

        network.add_host_interface("eth0");
        assert!(check_topology(temp_file.path(), &network).is_valid());
    }
}
