//! Topology description types.
//!
//! A topology file is a YAML document with three top-level keys:
//!
//! ```yaml
//! nodes:
//!   R1: {type: docker.router, ipv6: true, mpls: true}
//!   sw: {type: ovs}
//! links:
//!   - {peer1: R1.0, peer2: sw.0, delay: 50, loss: 2}
//! bridges:
//!   lan: {host: eth0, interfaces: [R1.1]}
//! ```

use super::patterns::PATTERNS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Declarative description of a whole topology.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyDescription {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    #[serde(default)]
    pub bridges: BTreeMap<String, BridgeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node kind: `docker.<kind>` or `ovs`
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default)]
    pub mpls: bool,
    /// Image override for container nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    /// Start the node automatically on run
    #[serde(default = "default_launch")]
    pub launch: bool,
}

fn default_launch() -> bool {
    true
}

impl Default for NodeSpec {
    fn default() -> Self {
        Self {
            kind: String::new(),
            ipv6: false,
            mpls: false,
            image: None,
            volumes: Vec::new(),
            launch: true,
        }
    }
}

/// A point-to-point link between two node interfaces.
///
/// Numeric fields are signed so that negative values survive parsing and
/// are reported by the validator instead of the YAML parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub peer1: String,
    pub peer2: String,
    /// Loss in percent (0-100)
    #[serde(default)]
    pub loss: f64,
    /// Delay in milliseconds
    #[serde(default)]
    pub delay: i64,
    /// Jitter in milliseconds
    #[serde(default)]
    pub jitter: i64,
    /// Rate in kbps
    #[serde(default)]
    pub rate: i64,
    /// Bandwidth-delay-product scale factor of the rate limiter queue
    #[serde(default)]
    pub buffer: f64,
}

impl LinkSpec {
    pub fn label(&self) -> String {
        format!("{}-{}", self.peer1, self.peer2)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeSpec {
    /// Host interface bridged with the topology
    pub host: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
}

/// A parsed `<node>.<ifIndex>` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerRef {
    pub node: String,
    pub if_index: u32,
}

impl PeerRef {
    /// Parse a peer string, `None` when it does not match `<node>.<ifIndex>`.
    pub fn parse(peer: &str) -> Option<PeerRef> {
        let caps = PATTERNS.peer.captures(peer)?;
        let if_index = caps.get(2)?.as_str().parse::<u32>().ok()?;
        Some(PeerRef {
            node: caps.get(1)?.as_str().to_string(),
            if_index,
        })
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.if_index)
    }
}

/// Shaping parameters of a link, in validated (non-negative) form.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Shaping {
    pub delay_ms: u32,
    pub jitter_ms: u32,
    pub loss_percent: f64,
    pub rate_kbps: u32,
    pub buffer: f64,
}

impl Shaping {
    pub fn from_spec(spec: &LinkSpec) -> Self {
        Self {
            delay_ms: clamp_u32(spec.delay),
            jitter_ms: clamp_u32(spec.jitter),
            loss_percent: spec.loss.clamp(0.0, 100.0),
            rate_kbps: clamp_u32(spec.rate),
            buffer: spec.buffer.max(0.0),
        }
    }

    /// True when a netem qdisc (delay/loss) is needed.
    pub fn has_delay_class(&self) -> bool {
        self.delay_ms > 0 || self.loss_percent > 0.0
    }

    pub fn has_rate_limit(&self) -> bool {
        self.rate_kbps > 0
    }
}

fn clamp_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}
