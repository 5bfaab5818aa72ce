//! Network topology module.
//!
//! Parsing and validation of topology descriptions, short identifier
//! generation, link/bridge wiring and the lifecycle manager driving a
//! whole topology.

pub mod check;
pub mod idgen;
pub mod manager;
pub mod patterns;
pub mod types;
pub mod wiring;

// Re-export key types and functions for easier access
pub use check::{check_description, check_topology, CheckReport};
pub use idgen::IdentifierGenerator;
pub use manager::{ManagedNode, NodeMessage, TopologyManager, TopologyState};
pub use types::{BridgeSpec, LinkSpec, NodeSpec, PeerRef, Shaping, TopologyDescription};
pub use wiring::{ResolvedBridge, ResolvedLink, ResolvedPeer};
