//! Link and bridge wiring.
//!
//! Links become veth pairs whose ends are created directly inside the peer
//! namespaces under temporary names, then renamed by the owning node.
//! Bridges live in the root namespace and reach every peer through a veth
//! whose root-side end is enslaved to the bridge.

use super::manager::ManagedNode;
use super::types::Shaping;
use crate::errors::{NetemError, Result};
use crate::link::{checked_ifname, IfState, NetemParams, Netns, NetworkStack, TbfParams};
use log::{debug, warn};

/// One end of a link or bridge port: a node (by index) and an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPeer {
    pub node: usize,
    pub if_index: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLink {
    pub peer1: ResolvedPeer,
    pub peer2: ResolvedPeer,
    pub shaping: Shaping,
    /// A netem qdisc is attached on both ends
    pub has_shaping: bool,
    /// A tbf qdisc is attached on both ends
    pub has_rate_limit: bool,
}

impl ResolvedLink {
    pub fn new(peer1: ResolvedPeer, peer2: ResolvedPeer, shaping: Shaping) -> Self {
        Self {
            peer1,
            peer2,
            shaping,
            has_shaping: false,
            has_rate_limit: false,
        }
    }

    pub fn involves(&self, node: usize) -> bool {
        self.peer1.node == node || self.peer2.node == node
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBridge {
    /// Kernel name of the bridge device
    pub name: String,
    pub host_interface: String,
    pub peers: Vec<ResolvedPeer>,
}

/// Temporary name of a link end: `<projectId><nodeShortId>.<ifIndex>`.
pub fn temp_ifname(project_id: &str, short_id: &str, if_index: u32) -> Result<String> {
    checked_ifname(format!("{}{}.{}", project_id, short_id, if_index))
}

/// Root-side name of a bridge port: `<projectId><nodeShortId>p<ifIndex>`.
pub fn bridge_port_name(project_id: &str, short_id: &str, if_index: u32) -> Result<String> {
    checked_ifname(format!("{}{}p{}", project_id, short_id, if_index))
}

fn peer_label(nodes: &[ManagedNode], peer: &ResolvedPeer) -> String {
    format!("{}.{}", nodes[peer.node].name(), peer.if_index)
}

/// Create the veth pair of `link` and hand each end to its node.
pub fn setup_link(
    project_id: &str,
    stack: &dyn NetworkStack,
    nodes: &[ManagedNode],
    link: &mut ResolvedLink,
) -> Result<()> {
    let node1 = &nodes[link.peer1.node];
    let node2 = &nodes[link.peer2.node];

    // one lock at a time: both ends may belong to the same node
    let ns1 = node1.lock().get_netns()?;
    let ns2 = node2.lock().get_netns()?;
    let name1 = temp_ifname(project_id, node1.short_id(), link.peer1.if_index)?;
    let name2 = temp_ifname(project_id, node2.short_id(), link.peer2.if_index)?;

    debug!(
        "[{}] Create link {}-{}",
        project_id,
        peer_label(nodes, &link.peer1),
        peer_label(nodes, &link.peer2)
    );
    stack
        .create_veth(&name1, &ns1, &name2, &ns2)
        .map_err(|source| NetemError::Wiring {
            action: format!(
                "create link {}-{}",
                peer_label(nodes, &link.peer1),
                peer_label(nodes, &link.peer2)
            ),
            source,
        })?;

    node1.lock().add_interface(&name1, link.peer1.if_index, &ns1)?;
    node2.lock().add_interface(&name2, link.peer2.if_index, &ns2)?;

    apply_shaping(stack, nodes, link)
}

/// Bring the qdiscs of both link ends in line with `link.shaping`.
///
/// The `has_*` flags tell whether a qdisc must be changed or added.
pub fn apply_shaping(
    stack: &dyn NetworkStack,
    nodes: &[ManagedNode],
    link: &mut ResolvedLink,
) -> Result<()> {
    for peer in [link.peer1, link.peer2] {
        shape_end(
            stack,
            &nodes[peer.node],
            peer.if_index,
            &link.shaping,
            link.has_shaping,
            link.has_rate_limit,
        )?;
    }

    link.has_shaping = link.shaping.has_delay_class() || link.shaping.has_rate_limit();
    link.has_rate_limit = link.shaping.has_rate_limit();
    Ok(())
}

/// Attach the shaping of a link on the end owned by `node`, from scratch.
///
/// Used after an interface changed namespace, which drops its qdiscs.
pub fn reshape_end(
    stack: &dyn NetworkStack,
    node: &ManagedNode,
    if_index: u32,
    shaping: &Shaping,
) -> Result<()> {
    shape_end(stack, node, if_index, shaping, false, false)
}

fn shape_end(
    stack: &dyn NetworkStack,
    node: &ManagedNode,
    if_index: u32,
    shaping: &Shaping,
    has_shaping: bool,
    has_rate_limit: bool,
) -> Result<()> {
    let (ifname, ns) = {
        let mut guard = node.lock();
        (guard.interface_name(if_index), guard.get_netns()?)
    };

    let netem = NetemParams {
        delay_ms: shaping.delay_ms,
        jitter_ms: shaping.jitter_ms,
        loss_percent: shaping.loss_percent,
    };
    // tbf hangs below netem, so a rate limit alone still needs it
    let needs_netem = netem.is_active() || shaping.has_rate_limit();

    // tbf can not be changed into nothing: start over
    if (has_rate_limit && !shaping.has_rate_limit()) || (has_shaping && !needs_netem) {
        stack.clear_qdisc(&ifname, &ns)?;
        if needs_netem {
            stack.netem(&ifname, &ns, &netem, false)?;
        }
        return Ok(());
    }

    if needs_netem {
        stack.netem(&ifname, &ns, &netem, has_shaping)?;
    }
    if shaping.has_rate_limit() {
        let tbf = TbfParams::new(shaping.rate_kbps, shaping.delay_ms, shaping.buffer);
        stack.tbf(&ifname, &ns, &tbf, has_rate_limit)?;
    }
    Ok(())
}

/// Create `bridge` in the root namespace and connect every peer to it.
pub fn setup_bridge(
    project_id: &str,
    stack: &dyn NetworkStack,
    nodes: &[ManagedNode],
    bridge: &ResolvedBridge,
) -> Result<()> {
    debug!("[{}] Create bridge {}", project_id, bridge.name);
    stack.create_bridge(&bridge.name, &Netns::Root)?;
    stack
        .attach_to_bridge(&bridge.name, &bridge.host_interface, &Netns::Root)
        .map_err(|source| NetemError::Wiring {
            action: format!("attach {} to bridge {}", bridge.host_interface, bridge.name),
            source,
        })?;

    for peer in &bridge.peers {
        let node = &nodes[peer.node];
        let ns = node.lock().get_netns()?;
        let port = bridge_port_name(project_id, node.short_id(), peer.if_index)?;
        let far_end = temp_ifname(project_id, node.short_id(), peer.if_index)?;

        stack
            .create_veth(&port, &Netns::Root, &far_end, &ns)
            .map_err(|source| NetemError::Wiring {
                action: format!("create link {}-{}", bridge.name, peer_label(nodes, peer)),
                source,
            })?;
        stack.attach_to_bridge(&bridge.name, &port, &Netns::Root)?;
        stack.set_interface_state(&port, &Netns::Root, IfState::Up)?;
        node.lock().add_interface(&far_end, peer.if_index, &ns)?;
    }
    Ok(())
}

/// Delete the bridge device and its root-side ports, logging failures.
pub fn teardown_bridge(
    project_id: &str,
    stack: &dyn NetworkStack,
    nodes: &[ManagedNode],
    bridge: &ResolvedBridge,
) {
    if stack.link_exists(&bridge.name, &Netns::Root) {
        if let Err(e) = stack.delete_link(&bridge.name, &Netns::Root) {
            warn!("[{}] Error when deleting bridge {}: {}", project_id, bridge.name, e);
        }
    }

    for peer in &bridge.peers {
        let Some(node) = nodes.get(peer.node) else {
            continue;
        };
        let port = match bridge_port_name(project_id, node.short_id(), peer.if_index) {
            Ok(port) => port,
            Err(e) => {
                warn!("[{}] {}", project_id, e);
                continue;
            }
        };
        // ports vanish with the namespace of their far end
        if !stack.link_exists(&port, &Netns::Root) {
            continue;
        }
        if let Err(e) = stack.delete_link(&port, &Netns::Root) {
            warn!("[{}] Error when deleting link {}: {}", project_id, port, e);
        }
    }
}
