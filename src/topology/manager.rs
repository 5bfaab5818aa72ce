//! Topology lifecycle manager.
//!
//! Drives one project's topology through `load -> run -> reload -> close`.
//! Node creation, node start, configuration push, bridge wiring and node
//! close fan out on the shared worker pool; links are wired one after the
//! other in declaration order.

use super::check::{check_topology, shaping_errors};
use super::idgen::IdentifierGenerator;
use super::types::{LinkSpec, PeerRef, Shaping, TopologyDescription};
use super::wiring::{
    apply_shaping, reshape_end, setup_bridge, setup_link, teardown_bridge, ResolvedBridge,
    ResolvedLink, ResolvedPeer,
};
use crate::config::{CONFIG_DIR, NETEM_ID, NETWORK_FILENAME};
use crate::errors::{NetemError, Result, TopologyError};
use crate::link::{checked_ifname, IfState};
use crate::node::{create_node, Node, NodeContext};
use crate::registry::EngineContext;
use crate::switch::SwitchInstance;
use crate::utils::copy::{copy_direction, split_copy_arg, CopyDirection};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// A node of a loaded topology.
pub struct ManagedNode {
    name: String,
    short_id: String,
    launch_at_startup: bool,
    node: Mutex<Node>,
}

impl ManagedNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    pub fn launch_at_startup(&self) -> bool {
        self.launch_at_startup
    }

    pub fn lock(&self) -> MutexGuard<'_, Node> {
        match self.node.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_running()
    }
}

impl std::fmt::Debug for ManagedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedNode")
            .field("name", &self.name)
            .field("short_id", &self.short_id)
            .field("launch_at_startup", &self.launch_at_startup)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyState {
    Unloaded,
    Loaded,
    Running,
    Closed,
}

/// Advisory output of a node's configuration push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeMessage {
    pub node: String,
    pub messages: Vec<String>,
}

pub struct TopologyManager {
    project_id: String,
    path: PathBuf,
    ctx: Arc<EngineContext>,
    ids: IdentifierGenerator,
    state: TopologyState,
    switch: Option<Arc<SwitchInstance>>,
    nodes: Vec<ManagedNode>,
    links: Vec<ResolvedLink>,
    bridges: Vec<ResolvedBridge>,
}

impl TopologyManager {
    /// Manager for the project stored in `path`; nothing is loaded yet.
    pub fn new(project_id: &str, path: &Path, ctx: Arc<EngineContext>) -> Self {
        Self {
            project_id: project_id.to_string(),
            path: path.to_path_buf(),
            ctx,
            ids: IdentifierGenerator::new(),
            state: TopologyState::Unloaded,
            switch: None,
            nodes: Vec::new(),
            links: Vec::new(),
            bridges: Vec::new(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn state(&self) -> TopologyState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == TopologyState::Running
    }

    pub fn network_file(&self) -> PathBuf {
        self.path.join(NETWORK_FILENAME)
    }

    fn config_dir(&self) -> PathBuf {
        self.path.join(CONFIG_DIR)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == TopologyState::Closed {
            return Err(NetemError::Closed(self.project_id.clone()));
        }
        Ok(())
    }

    /// Validate the project's topology file without touching any state.
    pub fn check(&self) -> Vec<TopologyError> {
        check_topology(&self.network_file(), self.ctx.stack.as_ref()).errors
    }

    /// Validate the topology and build its nodes, links and bridges.
    ///
    /// On failure the nodes created so far are kept so that
    /// [`TopologyManager::close`] can reclaim them.
    pub fn load(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.state != TopologyState::Unloaded {
            return Err(NetemError::Unsupported(format!(
                "Topology of project {} is already loaded",
                self.project_id
            )));
        }

        let report = check_topology(&self.network_file(), self.ctx.stack.as_ref());
        let topology = match report.topology {
            Some(topology) if report.errors.is_empty() => topology,
            _ => return Err(NetemError::InvalidTopology(report.errors)),
        };
        debug!(
            "[{}] Topo/Load: {} nodes, {} links, {} bridges",
            self.project_id,
            topology.nodes.len(),
            topology.links.len(),
            topology.bridges.len()
        );

        let switch =
            self.ctx
                .switches
                .create(&self.project_id, self.ctx.runtime.clone(), &self.ctx.config)?;
        self.switch = Some(switch.clone());

        self.create_nodes(&topology, switch)?;
        self.links = self.resolve_links(&topology)?;
        self.bridges = self.resolve_bridges(&topology)?;

        self.state = TopologyState::Loaded;
        info!("[{}] Topology loaded", self.project_id);
        Ok(())
    }

    fn create_nodes(
        &mut self,
        topology: &TopologyDescription,
        switch: Arc<SwitchInstance>,
    ) -> Result<()> {
        let node_ctx = NodeContext {
            project_id: &self.project_id,
            config: &self.ctx.config,
            runtime: self.ctx.runtime.clone(),
            stack: self.ctx.stack.clone(),
            switch,
        };
        let ids = &self.ids;
        let specs: Vec<_> = topology.nodes.iter().collect();

        let created = self.ctx.pool.map_all(&specs, |&(name, spec)| {
            debug!("[{}] Create node {}", node_ctx.project_id, name);
            let short_id = ids.get_id(name)?;
            let node = create_node(&node_ctx, name, &short_id, spec).map_err(|e| {
                NetemError::NodeCreate {
                    name: name.clone(),
                    source: Box::new(e),
                }
            })?;
            Ok::<_, NetemError>(ManagedNode {
                name: name.clone(),
                short_id,
                launch_at_startup: spec.launch,
                node: Mutex::new(node),
            })
        });

        let mut first_error = None;
        for result in created {
            match result {
                Ok(node) => self.nodes.push(node),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn node_index(&self, name: &str) -> Result<usize> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| NetemError::NodeNotFound {
                project: self.project_id.clone(),
                name: name.to_string(),
            })
    }

    fn resolve_peer(&self, peer: &str) -> Result<ResolvedPeer> {
        let peer_ref = PeerRef::parse(peer).ok_or_else(|| {
            NetemError::InvalidTopology(vec![TopologyError::InvalidPeer(peer.to_string())])
        })?;
        Ok(ResolvedPeer {
            node: self.node_index(&peer_ref.node)?,
            if_index: peer_ref.if_index,
        })
    }

    fn resolve_links(&self, topology: &TopologyDescription) -> Result<Vec<ResolvedLink>> {
        topology
            .links
            .iter()
            .map(|spec| {
                Ok(ResolvedLink::new(
                    self.resolve_peer(&spec.peer1)?,
                    self.resolve_peer(&spec.peer2)?,
                    Shaping::from_spec(spec),
                ))
            })
            .collect()
    }

    fn resolve_bridges(&self, topology: &TopologyDescription) -> Result<Vec<ResolvedBridge>> {
        topology
            .bridges
            .iter()
            .map(|(name, spec)| {
                let short_id = self.ids.get_id(name)?;
                Ok(ResolvedBridge {
                    name: checked_ifname(format!("{}{}.{}", NETEM_ID, self.project_id, short_id))?,
                    host_interface: spec.host.clone(),
                    peers: spec
                        .interfaces
                        .iter()
                        .map(|peer| self.resolve_peer(peer))
                        .collect::<Result<_>>()?,
                })
            })
            .collect()
    }

    /// Bring the loaded topology up.
    ///
    /// On failure the topology is left half wired and must be closed.
    pub fn run(&mut self) -> Result<Vec<NodeMessage>> {
        debug!("[{}] Topo/Run", self.project_id);
        self.ensure_open()?;
        match self.state {
            TopologyState::Running => {
                warn!("[{}] Topology is already running", self.project_id);
                return Ok(Vec::new());
            }
            TopologyState::Unloaded => {
                return Err(NetemError::Unsupported(format!(
                    "Topology of project {} is not loaded",
                    self.project_id
                )))
            }
            TopologyState::Loaded | TopologyState::Closed => {}
        }

        debug!("[{}] Topo/Run: start switch instance", self.project_id);
        if let Some(switch) = &self.switch {
            switch.start()?;
        }

        debug!("[{}] Topo/Run: start nodes", self.project_id);
        let nodes = &self.nodes;
        let launch: Vec<usize> = (0..nodes.len())
            .filter(|&i| nodes[i].launch_at_startup)
            .collect();
        self.ctx.pool.run_all(&launch, |&i| start_node(&nodes[i]))?;

        debug!("[{}] Topo/Run: setup links", self.project_id);
        let stack = self.ctx.stack.as_ref();
        for link in self.links.iter_mut() {
            setup_link(&self.project_id, stack, &self.nodes, link)?;
        }

        debug!("[{}] Topo/Run: setup bridges", self.project_id);
        let project_id = self.project_id.as_str();
        let nodes = &self.nodes;
        self.ctx
            .pool
            .run_all(&self.bridges, |bridge| setup_bridge(project_id, stack, nodes, bridge))?;

        debug!("[{}] Topo/Run: load configuration", self.project_id);
        let messages = self.load_configs(&(0..self.nodes.len()).collect::<Vec<_>>())?;

        self.state = TopologyState::Running;
        info!("[{}] Topology running", self.project_id);
        Ok(messages)
    }

    fn load_configs(&self, indices: &[usize]) -> Result<Vec<NodeMessage>> {
        let conf_dir = self.config_dir();
        let nodes = &self.nodes;
        let results = self.ctx.pool.map_all(indices, |&i| {
            let messages = nodes[i].lock().load_config(&conf_dir)?;
            Ok::<_, NetemError>(NodeMessage {
                node: nodes[i].name.clone(),
                messages,
            })
        });

        let mut messages = Vec::new();
        for result in results {
            let message = result?;
            if !message.messages.is_empty() {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Re-read the topology file and rebuild everything, running it again
    /// when it was running.
    pub fn reload(&mut self) -> Result<Vec<NodeMessage>> {
        self.ensure_open()?;
        let was_running = self.is_running();
        debug!("[{}] Topo/Reload (running: {})", self.project_id, was_running);

        self.teardown();
        self.state = TopologyState::Unloaded;
        self.load()?;
        if was_running {
            return self.run();
        }
        Ok(Vec::new())
    }

    /// Release every resource; the manager can not be used afterwards.
    pub fn close(&mut self) -> Result<()> {
        if self.state == TopologyState::Closed {
            return Ok(());
        }
        debug!("[{}] Topo/Close", self.project_id);
        self.teardown();
        self.state = TopologyState::Closed;
        info!("[{}] Topology closed", self.project_id);
        Ok(())
    }

    /// Best-effort release of nodes, bridges and the switch instance.
    fn teardown(&mut self) {
        let results = self.ctx.pool.map_all(&self.nodes, |node| node.lock().close());
        for (node, result) in self.nodes.iter().zip(results) {
            if let Err(e) = result {
                error!("[{}] Error when closing node {}: {}", self.project_id, node.name, e);
            }
        }

        for bridge in &self.bridges {
            teardown_bridge(&self.project_id, self.ctx.stack.as_ref(), &self.nodes, bridge);
        }

        self.nodes.clear();
        self.links.clear();
        self.bridges.clear();
        self.ids.reset();

        if let Some(switch) = self.switch.take() {
            self.ctx.switches.remove(&self.project_id);
            if let Err(e) = switch.close() {
                warn!("[{}] Error when closing switch instance: {}", self.project_id, e);
            }
        }
    }

    /// Index of the link joining `peer1` and `peer2`, in either order.
    fn link_index(&self, peer1: &str, peer2: &str) -> Result<usize> {
        let not_found = || NetemError::LinkNotFound {
            project: self.project_id.clone(),
            peer1: peer1.to_string(),
            peer2: peer2.to_string(),
        };
        let (Some(p1), Some(p2)) = (PeerRef::parse(peer1), PeerRef::parse(peer2)) else {
            return Err(not_found());
        };

        let matches = |peer: &ResolvedPeer, wanted: &PeerRef| {
            self.nodes[peer.node].name == wanted.node && peer.if_index == wanted.if_index
        };
        self.links
            .iter()
            .position(|link| {
                (matches(&link.peer1, &p1) && matches(&link.peer2, &p2))
                    || (matches(&link.peer1, &p2) && matches(&link.peer2, &p1))
            })
            .ok_or_else(not_found)
    }

    pub fn get_link(&self, peer1: &str, peer2: &str) -> Result<&ResolvedLink> {
        self.link_index(peer1, peer2).map(|idx| &self.links[idx])
    }

    /// Change the shaping parameters of an existing link in place.
    pub fn link_update(&mut self, spec: &LinkSpec) -> Result<()> {
        self.ensure_open()?;
        let errors = shaping_errors(spec);
        if !errors.is_empty() {
            return Err(NetemError::InvalidTopology(errors));
        }

        let idx = self.link_index(&spec.peer1, &spec.peer2)?;
        debug!("[{}] Update link {}", self.project_id, spec.label());

        let link = &mut self.links[idx];
        link.shaping = Shaping::from_spec(spec);
        if self.state == TopologyState::Running {
            apply_shaping(self.ctx.stack.as_ref(), &self.nodes, link)?;
        }
        Ok(())
    }

    pub fn get_node(&self, name: &str) -> Result<&ManagedNode> {
        self.node_index(name).map(|idx| &self.nodes[idx])
    }

    pub fn get_all_nodes(&self) -> &[ManagedNode] {
        &self.nodes
    }

    pub fn links(&self) -> &[ResolvedLink] {
        &self.links
    }

    pub fn bridges(&self) -> &[ResolvedBridge] {
        &self.bridges
    }

    /// Re-attach link shaping on the interfaces of node `idx`, which lost
    /// their qdiscs when they changed namespace.
    fn reshape_node(&self, idx: usize) -> Result<()> {
        let stack = self.ctx.stack.as_ref();
        for link in self.links.iter().filter(|l| l.involves(idx) && l.has_shaping) {
            for peer in [link.peer1, link.peer2] {
                if peer.node == idx {
                    reshape_end(stack, &self.nodes[idx], peer.if_index, &link.shaping)?;
                }
            }
        }
        Ok(())
    }

    /// Start one node and push its configuration.
    pub fn start(&self, name: &str) -> Result<Vec<String>> {
        if !self.is_running() {
            warn!("[{}] Start {}: topology not running", self.project_id, name);
            return Ok(Vec::new());
        }
        let idx = self.node_index(name)?;
        let node = &self.nodes[idx];
        if node.is_running() {
            return Ok(Vec::new());
        }

        start_node(node)?;
        if matches!(*node.lock(), Node::Container(_)) {
            self.reshape_node(idx)?;
        }
        Ok(self
            .load_configs(&[idx])?
            .into_iter()
            .flat_map(|m| m.messages)
            .collect())
    }

    pub fn stop(&self, name: &str) -> Result<()> {
        if !self.is_running() {
            warn!("[{}] Stop {}: topology not running", self.project_id, name);
            return Ok(());
        }
        let idx = self.node_index(name)?;
        let node = &self.nodes[idx];
        if !node.is_running() {
            return Ok(());
        }

        node.lock().stop()?;
        if matches!(*node.lock(), Node::Container(_)) {
            self.reshape_node(idx)?;
        }
        Ok(())
    }

    /// Save the configuration of every node into the project directory.
    pub fn save(&self) -> Result<()> {
        let dest = self.config_dir();
        if !dest.exists() {
            std::fs::create_dir_all(&dest).map_err(|e| {
                NetemError::io(format!("Unable to create configs dir {}", dest.display()), e)
            })?;
        }
        self.ctx
            .pool
            .run_all(&self.nodes, |node| node.lock().save(&dest))
    }

    pub fn read_network_file(&self) -> Result<Vec<u8>> {
        let path = self.network_file();
        std::fs::read(&path)
            .map_err(|e| NetemError::io(format!("Unable to read {}", path.display()), e))
    }

    pub fn write_network_file(&self, data: &[u8]) -> Result<()> {
        let path = self.network_file();
        std::fs::write(&path, data)
            .map_err(|e| NetemError::io(format!("Unable to write {}", path.display()), e))
    }

    /// Copy a file between the host and a container node; one side is
    /// written `node:path`.
    pub fn copy(&self, source: &str, dest: &str) -> Result<()> {
        let (src_node, src_path) = split_copy_arg(source);
        let (dest_node, dest_path) = split_copy_arg(dest);

        match copy_direction(src_node, dest_node) {
            CopyDirection::FromNode => {
                let node = self.get_node(src_node.unwrap_or_default())?;
                node.lock().copy_from(src_path, Path::new(dest_path))
            }
            CopyDirection::ToNode => {
                let node = self.get_node(dest_node.unwrap_or_default())?;
                node.lock().copy_to(Path::new(src_path), dest_path)
            }
            CopyDirection::AcrossNodes => Err(NetemError::Unsupported(
                "copying between containers is not supported".to_string(),
            )),
            CopyDirection::Local => Err(NetemError::Unsupported(
                "must specify at least one container source".to_string(),
            )),
        }
    }

    pub fn set_interface_state(&self, name: &str, if_index: u32, state: IfState) -> Result<()> {
        self.get_node(name)?
            .lock()
            .set_interface_state(if_index, state)
    }

    /// Interactive session on a node, attached to the caller's terminal.
    pub fn console(&self, name: &str, shell: bool) -> Result<()> {
        self.get_node(name)?.lock().console(shell)
    }
}

fn start_node(node: &ManagedNode) -> Result<()> {
    node.lock().start().map_err(|e| {
        error!("Unable to start node {}: {}", node.name, e);
        e
    })
}

impl std::fmt::Debug for TopologyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyManager")
            .field("project_id", &self.project_id)
            .field("path", &self.path)
            .field("state", &self.state)
            .field("nodes", &self.nodes)
            .finish()
    }
}
