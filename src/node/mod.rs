//! Polymorphic topology nodes.
//!
//! The set of node kinds is closed: the `type` field of a node spec selects
//! a [`Node`] variant and every capability dispatches on it.

pub mod container;
pub mod switch;

pub use container::{ContainerKind, ContainerNode};
pub use switch::SwitchNode;

use crate::config::ServerConfig;
use crate::errors::{NetemError, Result};
use crate::link::{IfState, Netns, NetworkStack};
use crate::runtime::ContainerRuntime;
use crate::switch::SwitchInstance;
use crate::topology::patterns::PATTERNS;
use crate::topology::NodeSpec;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Collaborators handed to node constructors.
pub struct NodeContext<'a> {
    pub project_id: &'a str,
    pub config: &'a ServerConfig,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub stack: Arc<dyn NetworkStack>,
    pub switch: Arc<SwitchInstance>,
}

#[derive(Debug)]
pub enum Node {
    Container(ContainerNode),
    Switch(SwitchNode),
}

/// Build the node declared as `name` by `spec`.
pub fn create_node(
    ctx: &NodeContext<'_>,
    name: &str,
    short_id: &str,
    spec: &NodeSpec,
) -> Result<Node> {
    let caps = PATTERNS
        .node_type
        .captures(&spec.kind)
        .ok_or_else(|| NetemError::Unsupported(format!("Unknown node type {}", spec.kind)))?;

    // group 2 holds the container kind, absent for switches
    match caps.get(2) {
        None => Ok(Node::Switch(SwitchNode::new(
            ctx.project_id,
            name,
            short_id,
            ctx.switch.clone(),
            ctx.stack.clone(),
        ))),
        Some(kind) => {
            let kind = ContainerKind::parse(kind.as_str()).ok_or_else(|| {
                NetemError::Unsupported(format!("Unknown docker node type {}", kind.as_str()))
            })?;
            ContainerNode::create(ctx, name, short_id, kind, spec).map(Node::Container)
        }
    }
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Container(n) => n.name(),
            Node::Switch(n) => n.name(),
        }
    }

    pub fn short_id(&self) -> &str {
        match self {
            Node::Container(n) => n.short_id(),
            Node::Switch(n) => n.short_id(),
        }
    }

    /// The `type` tag the node was declared with.
    pub fn kind(&self) -> String {
        match self {
            Node::Container(n) => format!("docker.{}", n.kind().as_str()),
            Node::Switch(_) => "ovs".to_string(),
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            Node::Container(n) => n.is_running(),
            Node::Switch(n) => n.is_running(),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        match self {
            Node::Container(n) => n.start(),
            Node::Switch(n) => n.start(),
        }
    }

    pub fn stop(&mut self) -> Result<()> {
        match self {
            Node::Container(n) => n.stop(),
            Node::Switch(n) => n.stop(),
        }
    }

    pub fn load_config(&mut self, conf_dir: &Path) -> Result<Vec<String>> {
        match self {
            Node::Container(n) => n.load_config(conf_dir),
            Node::Switch(n) => n.load_config(conf_dir),
        }
    }

    pub fn save(&self, dest_dir: &Path) -> Result<()> {
        match self {
            Node::Container(n) => n.save(dest_dir),
            Node::Switch(n) => n.save(dest_dir),
        }
    }

    pub fn console(&self, shell: bool) -> Result<()> {
        match self {
            Node::Container(n) => n.console(shell),
            Node::Switch(n) => n.console(shell),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            Node::Container(n) => n.close(),
            Node::Switch(n) => n.close(),
        }
    }

    /// Namespace currently holding the node's interfaces.
    pub fn get_netns(&mut self) -> Result<Netns> {
        match self {
            Node::Container(n) => n.get_netns(),
            Node::Switch(n) => n.get_netns(),
        }
    }

    pub fn interface_name(&self, if_index: u32) -> String {
        match self {
            Node::Container(n) => n.interface_name(if_index),
            Node::Switch(n) => n.interface_name(if_index),
        }
    }

    pub fn add_interface(&mut self, ifname: &str, if_index: u32, ns: &Netns) -> Result<()> {
        match self {
            Node::Container(n) => n.add_interface(ifname, if_index, ns),
            Node::Switch(n) => n.add_interface(ifname, if_index, ns),
        }
    }

    pub fn interfaces_state(&self) -> BTreeMap<u32, IfState> {
        match self {
            Node::Container(n) => n.interfaces_state(),
            Node::Switch(n) => n.interfaces_state(),
        }
    }

    pub fn set_interface_state(&mut self, if_index: u32, state: IfState) -> Result<()> {
        match self {
            Node::Container(n) => n.set_interface_state(if_index, state),
            Node::Switch(n) => n.set_interface_state(if_index, state),
        }
    }

    pub fn copy_to(&self, source: &Path, dest: &str) -> Result<()> {
        match self {
            Node::Container(n) => n.copy_to(source, dest),
            Node::Switch(_) => Err(NetemError::Unsupported(
                "Selected node does not support copy".to_string(),
            )),
        }
    }

    pub fn copy_from(&self, source: &str, dest: &Path) -> Result<()> {
        match self {
            Node::Container(n) => n.copy_from(source, dest),
            Node::Switch(_) => Err(NetemError::Unsupported(
                "Selected node does not support copy".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeNetwork, FakeRuntime};

    struct Fixture {
        config: ServerConfig,
        runtime: Arc<FakeRuntime>,
        network: Arc<FakeNetwork>,
        switch: Arc<SwitchInstance>,
    }

    impl Fixture {
        fn new() -> Self {
            let network = Arc::new(FakeNetwork::new());
            let runtime = Arc::new(FakeRuntime::with_network(network.clone()));
            let config = ServerConfig::default();
            let switch =
                Arc::new(SwitchInstance::create("abcd", runtime.clone(), &config).unwrap());
            Self {
                config,
                runtime,
                network,
                switch,
            }
        }

        fn node(&self, name: &str, spec: &NodeSpec) -> Result<Node> {
            let ctx = NodeContext {
                project_id: "abcd",
                config: &self.config,
                runtime: self.runtime.clone(),
                stack: self.network.clone(),
                switch: self.switch.clone(),
            };
            create_node(&ctx, name, "0node", spec)
        }
    }

    fn spec(kind: &str) -> NodeSpec {
        NodeSpec {
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_dispatch_on_type() {
        let fx = Fixture::new();
        let router = fx.node("R1", &spec("docker.router")).unwrap();
        assert!(matches!(router, Node::Container(_)));
        assert_eq!(router.kind(), "docker.router");
        assert_eq!(router.interface_name(2), "eth2");

        let sw = fx.node("sw", &spec("ovs")).unwrap();
        assert!(matches!(sw, Node::Switch(_)));
        assert_eq!(sw.interface_name(2), "sw.2");

        for kind in ["docker.host", "docker.server"] {
            let name = kind.replace('.', "_");
            let node = fx.node(&name, &spec(kind)).unwrap();
            assert_eq!(node.kind(), kind);
        }

        let err = fx.node("X", &spec("docker.toaster")).unwrap_err();
        assert!(err.to_string().contains("toaster"), "{}", err);
        assert!(fx.runtime.container_by_name("ntmabcd.R1").is_some());
    }

    #[test]
    fn test_interfaces_follow_container_state() {
        let fx = Fixture::new();
        let mut node = fx.node("R1", &spec("docker.router")).unwrap();

        let parked = node.get_netns().unwrap();
        assert_eq!(parked, Netns::Named("abcdR1".to_string()));
        fx.network
            .create_veth("abcd0node.0", &parked, "peer", &Netns::Root)
            .unwrap();
        node.add_interface("abcd0node.0", 0, &parked).unwrap();
        assert_eq!(fx.network.interfaces(&parked), vec!["eth0"]);

        node.start().unwrap();
        let running = node.get_netns().unwrap();
        assert!(matches!(running, Netns::Pid(_)));
        assert_eq!(fx.network.interfaces(&running), vec!["eth0"]);
        assert_eq!(
            fx.network.interface_state(&running, "eth0"),
            Some(IfState::Up)
        );
        assert!(fx
            .runtime
            .calls()
            .iter()
            .any(|c| c.ends_with("ethtool -K eth0 tx off")));

        node.stop().unwrap();
        assert_eq!(fx.network.interfaces(&parked), vec!["eth0"]);

        node.close().unwrap();
        assert!(fx.network.residue().is_empty());
    }

    #[test]
    fn test_set_interface_state() {
        let fx = Fixture::new();
        let mut node = fx.node("h1", &spec("docker.host")).unwrap();
        let ns = node.get_netns().unwrap();
        fx.network
            .create_veth("tmp", &ns, "peer", &Netns::Root)
            .unwrap();
        node.add_interface("tmp", 1, &ns).unwrap();

        node.set_interface_state(1, IfState::Down).unwrap();
        assert_eq!(fx.network.interface_state(&ns, "eth1"), Some(IfState::Down));
        assert_eq!(node.interfaces_state().get(&1), Some(&IfState::Down));

        let err = node.set_interface_state(7, IfState::Up).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_load_config_pushes_files() {
        let fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("h1.net.conf"), "eth0: dhcp\n").unwrap();
        fx.runtime
            .set_exec_output("network-config.py -l /tmp/custom.net.conf", "eth0 configured\n");

        let mut node = fx.node("h1", &spec("docker.host")).unwrap();
        assert!(node.load_config(dir.path()).unwrap().is_empty());

        node.start().unwrap();
        let messages = node.load_config(dir.path()).unwrap();
        assert_eq!(messages, vec!["eth0 configured"]);
        let container = fx.runtime.container_by_name("ntmabcd.h1").unwrap();
        assert!(container.files.contains("/tmp/custom.net.conf"));

        // already loaded
        assert!(node.load_config(dir.path()).unwrap().is_empty());

        let save_dir = tempfile::tempdir().unwrap();
        node.save(save_dir.path()).unwrap();
        assert!(save_dir.path().join("h1.net.conf").exists());
    }

    #[test]
    fn test_switch_ports_follow_bridge() {
        let fx = Fixture::new();
        fx.switch.start().unwrap();
        let mut sw = fx.node("sw", &spec("ovs")).unwrap();

        let ns = sw.get_netns().unwrap();
        fx.network.create_veth("tmp0", &ns, "peer0", &Netns::Root).unwrap();
        sw.add_interface("tmp0", 0, &ns).unwrap();
        assert!(!fx.runtime.calls().iter().any(|c| c.contains("add-port")));

        sw.start().unwrap();
        assert!(fx.switch.has_bridge("sw"));
        assert!(fx
            .runtime
            .calls()
            .iter()
            .any(|c| c.ends_with("ovs-vsctl add-port sw sw.0")));

        fx.network.create_veth("tmp1", &ns, "peer1", &Netns::Root).unwrap();
        sw.add_interface("tmp1", 1, &ns).unwrap();
        assert!(fx
            .runtime
            .calls()
            .iter()
            .any(|c| c.ends_with("ovs-vsctl add-port sw sw.1")));

        assert!(sw.copy_to(Path::new("/etc/hosts"), "/tmp/hosts").is_err());

        sw.close().unwrap();
        assert!(!fx.switch.has_bridge("sw"));
    }
}
