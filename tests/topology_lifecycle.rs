//! End-to-end lifecycle tests driven against the in-memory network and
//! container runtime.

use netemu::config::ServerConfig;
use netemu::errors::NetemError;
use netemu::link::{IfState, Netns};
use netemu::registry::{EngineContext, ProjectRegistry};
use netemu::testing::{FakeNetwork, FakeQdiscs, FakeRuntime};
use netemu::topology::{LinkSpec, TopologyManager, TopologyState};
use std::sync::Arc;
use tempfile::TempDir;

const PROJECT: &str = "abcd";

const SCENARIO: &str = r#"
nodes:
  switch:
    type: ovs
  R1:
    type: docker.router
    ipv6: true
    mpls: true
  host:
    type: docker.host
  hostNotLaunch:
    type: docker.host
    launch: false
links:
  - {peer1: R1.0, peer2: switch.0, delay: 50, loss: 2}
  - {peer1: host.0, peer2: switch.1}
  - {peer1: hostNotLaunch.0, peer2: switch.2, delay: 10}
"#;

struct Harness {
    net: Arc<FakeNetwork>,
    runtime: Arc<FakeRuntime>,
    ctx: Arc<EngineContext>,
    dir: TempDir,
}

impl Harness {
    fn new(topology: &str) -> Self {
        let net = Arc::new(FakeNetwork::new());
        net.add_host_interface("eth0");
        let runtime = Arc::new(FakeRuntime::with_network(net.clone()));
        let ctx = EngineContext::new(ServerConfig::default(), runtime.clone(), net.clone())
            .expect("default config is valid");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("network.yml"), topology).unwrap();
        Self {
            net,
            runtime,
            ctx: Arc::new(ctx),
            dir,
        }
    }

    fn manager(&self) -> TopologyManager {
        TopologyManager::new(PROJECT, self.dir.path(), self.ctx.clone())
    }

    fn netns_of(&self, manager: &TopologyManager, node: &str) -> Netns {
        manager.get_node(node).unwrap().lock().get_netns().unwrap()
    }
}

fn update(peer1: &str, peer2: &str) -> LinkSpec {
    LinkSpec {
        peer1: peer1.to_string(),
        peer2: peer2.to_string(),
        ..LinkSpec::default()
    }
}

#[test]
fn test_load_keeps_launch_flags() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();

    assert_eq!(manager.state(), TopologyState::Loaded);
    assert_eq!(manager.get_all_nodes().len(), 4);
    assert!(!manager.get_node("hostNotLaunch").unwrap().launch_at_startup());
    assert!(manager.get_node("R1").unwrap().launch_at_startup());
    assert_eq!(manager.links().len(), 3);
    assert!(!manager.is_running());

    manager.close().unwrap();
}

#[test]
fn test_run_starts_launch_nodes_only() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();
    manager.run().unwrap();

    assert!(manager.is_running());
    assert!(manager.get_node("R1").unwrap().is_running());
    assert!(manager.get_node("host").unwrap().is_running());
    assert!(manager.get_node("switch").unwrap().is_running());
    assert!(!manager.get_node("hostNotLaunch").unwrap().is_running());

    // ovs instance plus R1 and host
    assert_eq!(h.runtime.running_count(), 3);

    let r1 = h.netns_of(&manager, "R1");
    assert!(matches!(r1, Netns::Pid(_)));
    assert_eq!(h.net.interfaces(&r1), vec!["eth0"]);

    let idle = h.netns_of(&manager, "hostNotLaunch");
    assert_eq!(idle, Netns::Named(format!("{}hostNotLaunch", PROJECT)));
    assert_eq!(h.net.interfaces(&idle), vec!["eth0"]);

    let switch = h.netns_of(&manager, "switch");
    assert_eq!(
        h.net.interfaces(&switch),
        vec!["switch.0", "switch.1", "switch.2"]
    );

    manager.close().unwrap();
}

#[test]
fn test_run_twice_is_noop() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();
    manager.run().unwrap();
    let veths = h
        .net
        .calls()
        .iter()
        .filter(|c| c.starts_with("create_veth"))
        .count();

    assert!(manager.run().unwrap().is_empty());
    let after = h
        .net
        .calls()
        .iter()
        .filter(|c| c.starts_with("create_veth"))
        .count();
    assert_eq!(veths, after);

    manager.close().unwrap();
}

#[test]
fn test_run_requires_load() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    assert!(manager.run().is_err());
}

#[test]
fn test_link_shaping_flags() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();
    manager.run().unwrap();

    let link = manager.get_link("R1.0", "switch.0").unwrap();
    assert!(link.has_shaping);
    assert!(!link.has_rate_limit);

    let unshaped = manager.get_link("host.0", "switch.1").unwrap();
    assert!(!unshaped.has_shaping);

    let r1 = h.netns_of(&manager, "R1");
    let qdiscs = h.net.qdiscs(&r1, "eth0");
    let netem = qdiscs.netem.expect("netem attached");
    assert_eq!(netem.delay_ms, 50);
    assert_eq!(netem.loss_percent, 2.0);
    assert!(qdiscs.tbf.is_none());

    manager.close().unwrap();
}

#[test]
fn test_link_update_adds_rate_limit_in_place() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();
    manager.run().unwrap();

    let r1 = h.netns_of(&manager, "R1");
    let switch = h.netns_of(&manager, "switch");
    let veths_before = h
        .net
        .calls()
        .iter()
        .filter(|c| c.starts_with("create_veth"))
        .count();

    // peers given in reverse order
    let mut spec = update("switch.0", "R1.0");
    spec.delay = 50;
    spec.loss = 2.0;
    spec.rate = 1000;
    manager.link_update(&spec).unwrap();

    let link = manager.get_link("R1.0", "switch.0").unwrap();
    assert!(link.has_shaping);
    assert!(link.has_rate_limit);
    assert_eq!(link.shaping.rate_kbps, 1000);

    assert_eq!(h.net.interfaces(&r1), vec!["eth0"]);
    assert!(h.net.interfaces(&switch).contains(&"switch.0".to_string()));
    assert!(h.net.qdiscs(&r1, "eth0").tbf.is_some());
    assert!(h.net.qdiscs(&switch, "switch.0").tbf.is_some());

    let veths_after = h
        .net
        .calls()
        .iter()
        .filter(|c| c.starts_with("create_veth"))
        .count();
    assert_eq!(veths_before, veths_after);

    manager.close().unwrap();
}

#[test]
fn test_link_update_removes_shaping() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();
    manager.run().unwrap();

    let mut spec = update("R1.0", "switch.0");
    spec.delay = 30;
    spec.rate = 500;
    manager.link_update(&spec).unwrap();
    manager.link_update(&update("R1.0", "switch.0")).unwrap();

    let link = manager.get_link("R1.0", "switch.0").unwrap();
    assert!(!link.has_shaping);
    assert!(!link.has_rate_limit);

    let r1 = h.netns_of(&manager, "R1");
    assert_eq!(h.net.qdiscs(&r1, "eth0"), FakeQdiscs::default());

    manager.close().unwrap();
}

#[test]
fn test_link_update_before_run_is_stored() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();

    let mut spec = update("host.0", "switch.1");
    spec.delay = 20;
    manager.link_update(&spec).unwrap();
    assert!(!h.net.calls().iter().any(|c| c.starts_with("netem")));

    manager.run().unwrap();
    assert!(manager.get_link("host.0", "switch.1").unwrap().has_shaping);

    manager.close().unwrap();
}

#[test]
fn test_link_update_errors() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();

    let err = manager.link_update(&update("R1.5", "switch.0")).unwrap_err();
    assert!(err.is_not_found());

    let mut spec = update("R1.0", "switch.0");
    spec.delay = -1;
    let err = manager.link_update(&spec).unwrap_err();
    assert!(matches!(err, NetemError::InvalidTopology(ref errors) if errors.len() == 1));

    manager.close().unwrap();
}

#[test]
fn test_reload_keeps_running_state() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();
    manager.run().unwrap();

    manager.reload().unwrap();
    assert_eq!(manager.state(), TopologyState::Running);
    assert!(manager.get_node("R1").unwrap().is_running());
    assert_eq!(h.runtime.container_count(), 4);

    manager.close().unwrap();
    assert!(h.net.residue().is_empty(), "{:?}", h.net.residue());
}

#[test]
fn test_reload_keeps_stopped_state() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();

    manager.reload().unwrap();
    assert_eq!(manager.state(), TopologyState::Loaded);
    assert!(!manager.get_node("R1").unwrap().is_running());
    assert_eq!(h.runtime.running_count(), 0);

    manager.close().unwrap();
}

#[test]
fn test_reload_picks_up_new_file() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();

    manager
        .write_network_file(b"nodes:\n  R2:\n    type: docker.router\n")
        .unwrap();
    manager.reload().unwrap();
    assert_eq!(manager.get_all_nodes().len(), 1);
    assert!(manager.get_node("R1").unwrap_err().is_not_found());

    manager.close().unwrap();
    assert_eq!(h.runtime.container_count(), 0);
}

#[test]
fn test_close_leaves_no_residue() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();
    manager.close().unwrap();

    assert!(h.net.residue().is_empty(), "{:?}", h.net.residue());
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(manager.state(), TopologyState::Closed);
}

#[test]
fn test_close_after_run_leaves_no_residue() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();
    manager.run().unwrap();
    manager.close().unwrap();

    assert!(h.net.residue().is_empty(), "{:?}", h.net.residue());
    assert_eq!(h.runtime.container_count(), 0);
    assert!(h.ctx.switches.is_empty());

    // closing twice is harmless, anything else is refused
    manager.close().unwrap();
    assert!(matches!(manager.load(), Err(NetemError::Closed(_))));
}

#[test]
fn test_invalid_topology_reports_every_error() {
    let h = Harness::new(
        r#"
nodes:
  R1: {type: docker.router}
  bad: {type: toaster}
links:
  - {peer1: R1.0, peer2: R9.0}
  - {peer1: R1.0, peer2: R1.1}
  - {peer1: R1.x, peer2: R1.2, delay: -3}
"#,
    );
    let mut manager = h.manager();
    let expected = manager.check();
    assert_eq!(expected.len(), 5, "{:?}", expected);

    match manager.load() {
        Err(NetemError::InvalidTopology(errors)) => assert_eq!(errors, expected),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(manager.state(), TopologyState::Unloaded);
    assert_eq!(h.runtime.container_count(), 0);
}

#[test]
fn test_node_create_failure_is_reclaimed() {
    let h = Harness::new(SCENARIO);
    h.runtime.set_image_missing("netemu/host:0.2.0");
    let mut manager = h.manager();

    let err = manager.load().unwrap_err();
    assert!(matches!(err, NetemError::NodeCreate { .. }), "{}", err);
    assert_eq!(manager.state(), TopologyState::Unloaded);

    manager.close().unwrap();
    assert_eq!(h.runtime.container_count(), 0);
    assert!(h.net.residue().is_empty(), "{:?}", h.net.residue());
}

#[test]
fn test_unknown_container_kind_is_reclaimed() {
    let h = Harness::new(
        r#"
nodes:
  R1:
    type: docker.router
  odd:
    type: docker.foo
links:
  - {peer1: R1.0, peer2: odd.0}
"#,
    );
    let mut manager = h.manager();

    let err = manager.load().unwrap_err();
    match &err {
        NetemError::NodeCreate { name, .. } => assert_eq!(name, "odd"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(manager.state(), TopologyState::Unloaded);

    manager.close().unwrap();
    assert_eq!(h.runtime.container_count(), 0);
    assert!(h.net.residue().is_empty(), "{:?}", h.net.residue());
}

#[test]
fn test_run_failure_is_propagated() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();
    h.net.fail_on("create_veth");

    let err = manager.run().unwrap_err();
    assert!(matches!(err, NetemError::Wiring { .. }), "{}", err);
    assert!(!manager.is_running());

    manager.close().unwrap();
    assert_eq!(h.runtime.container_count(), 0);
}

#[test]
fn test_node_start_failure_is_propagated() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();
    let host = h.runtime.container_by_name("ntmabcd.host").unwrap();
    assert!(!host.running);

    h.runtime.fail_on("start c");
    assert!(manager.run().is_err());
    manager.close().unwrap();
}

#[test]
fn test_start_stop_node_reapplies_shaping() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();
    manager.run().unwrap();

    manager.start("hostNotLaunch").unwrap();
    assert!(manager.get_node("hostNotLaunch").unwrap().is_running());
    let pid_ns = h.netns_of(&manager, "hostNotLaunch");
    assert!(matches!(pid_ns, Netns::Pid(_)));
    assert_eq!(h.net.interfaces(&pid_ns), vec!["eth0"]);
    assert_eq!(h.net.qdiscs(&pid_ns, "eth0").netem.unwrap().delay_ms, 10);

    manager.stop("hostNotLaunch").unwrap();
    assert!(!manager.get_node("hostNotLaunch").unwrap().is_running());
    let local = Netns::Named(format!("{}hostNotLaunch", PROJECT));
    assert_eq!(h.net.interfaces(&local), vec!["eth0"]);
    assert!(h.net.qdiscs(&local, "eth0").netem.is_some());

    // starting a running node twice does nothing
    manager.start("R1").unwrap();
    assert!(manager.start("nobody").unwrap_err().is_not_found());

    manager.close().unwrap();
    assert!(h.net.residue().is_empty(), "{:?}", h.net.residue());
}

#[test]
fn test_start_stop_ignored_when_topology_stopped() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();

    assert!(manager.start("R1").unwrap().is_empty());
    manager.stop("R1").unwrap();
    assert!(!manager.get_node("R1").unwrap().is_running());

    manager.close().unwrap();
}

#[test]
fn test_interface_state_follows_node() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();
    manager.run().unwrap();

    manager.set_interface_state("R1", 0, IfState::Down).unwrap();
    let r1 = h.netns_of(&manager, "R1");
    assert_eq!(h.net.interface_state(&r1, "eth0"), Some(IfState::Down));

    let err = manager.set_interface_state("R1", 7, IfState::Up).unwrap_err();
    assert!(err.is_not_found());

    manager.close().unwrap();
}

#[test]
fn test_bridge_wiring() {
    let h = Harness::new(
        r#"
nodes:
  R1: {type: docker.router}
  R2: {type: docker.router}
links:
  - {peer1: R1.0, peer2: R2.0}
bridges:
  lan:
    host: eth0
    interfaces: [R1.1, R2.1]
"#,
    );
    let mut manager = h.manager();
    manager.load().unwrap();
    manager.run().unwrap();

    let bridge = &manager.bridges()[0];
    assert!(bridge.name.starts_with("ntmabcd."));
    assert_eq!(
        h.net.bridge_of(&Netns::Root, "eth0").as_deref(),
        Some(bridge.name.as_str())
    );

    let r1 = h.netns_of(&manager, "R1");
    assert_eq!(h.net.interfaces(&r1), vec!["eth0", "eth1"]);
    let ports: Vec<String> = h
        .net
        .interfaces(&Netns::Root)
        .into_iter()
        .filter(|name| h.net.bridge_of(&Netns::Root, name).is_some() && name != "eth0")
        .collect();
    assert_eq!(ports.len(), 2);

    manager.close().unwrap();
    assert!(h.net.residue().is_empty(), "{:?}", h.net.residue());
}

#[test]
fn test_bridge_with_unknown_host_interface_rejected() {
    let h = Harness::new(
        r#"
nodes:
  R1: {type: docker.router}
bridges:
  lan:
    host: eth9
    interfaces: [R1.0]
"#,
    );
    let mut manager = h.manager();
    assert!(matches!(manager.load(), Err(NetemError::InvalidTopology(_))));
}

#[test]
fn test_config_files_pushed_on_run_and_saved() {
    let h = Harness::new(
        r#"
nodes:
  R1: {type: docker.router}
  host: {type: docker.host}
links:
  - {peer1: R1.0, peer2: host.0}
"#,
    );
    let configs = h.dir.path().join("configs");
    std::fs::create_dir_all(&configs).unwrap();
    std::fs::write(configs.join("R1.frr.conf"), "hostname R1\n").unwrap();

    let mut manager = h.manager();
    manager.load().unwrap();
    manager.run().unwrap();

    let r1 = h.runtime.container_by_name("ntmabcd.R1").unwrap();
    assert!(r1.files.contains("/etc/frr/frr.conf"), "{:?}", r1.files);

    std::fs::remove_file(configs.join("R1.frr.conf")).unwrap();
    manager.save().unwrap();
    assert!(configs.join("R1.frr.conf").exists());
    assert!(!configs.join("host.net.conf").exists());
    manager.close().unwrap();
}

#[test]
fn test_copy_between_host_and_node() {
    let h = Harness::new(SCENARIO);
    let mut manager = h.manager();
    manager.load().unwrap();
    manager.run().unwrap();

    let source = h.dir.path().join("payload.txt");
    std::fs::write(&source, "data").unwrap();
    manager
        .copy(source.to_str().unwrap(), "host:/tmp/payload.txt")
        .unwrap();
    let host = h.runtime.container_by_name("ntmabcd.host").unwrap();
    assert!(host.files.contains("/tmp/payload.txt"));

    let back = h.dir.path().join("back.txt");
    manager
        .copy("host:/tmp/payload.txt", back.to_str().unwrap())
        .unwrap();
    assert!(back.exists());

    assert!(manager.copy("host:/a", "R1:/b").is_err());
    assert!(manager.copy("/a", "/b").is_err());
    assert!(manager.copy("/a", "switch:/b").is_err());

    manager.close().unwrap();
}

#[test]
fn test_registry_open_and_close() {
    let h = Harness::new(SCENARIO);
    let registry = ProjectRegistry::new(h.ctx.clone());

    let project = registry.open(h.dir.path()).unwrap();
    project.topology().run().unwrap();
    assert!(registry.get(&project.id).unwrap().topology().is_running());
    assert_eq!(registry.list().len(), 1);

    registry.close(&project.id).unwrap();
    assert!(registry.get(&project.id).unwrap_err().is_not_found());
    assert_eq!(h.runtime.container_count(), 0);
    assert!(h.net.residue().is_empty(), "{:?}", h.net.residue());
}

#[test]
fn test_network_file_round_trip() {
    let h = Harness::new(SCENARIO);
    let manager = h.manager();
    assert_eq!(manager.read_network_file().unwrap(), SCENARIO.as_bytes());
    assert_eq!(manager.network_file(), h.dir.path().join("network.yml"));
}
