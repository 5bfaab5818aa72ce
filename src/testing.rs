//! In-memory collaborators.
//!
//! [`FakeNetwork`] and [`FakeRuntime`] model just enough kernel and
//! container behaviour for the lifecycle manager to be driven end to end
//! without root privileges or a container daemon. Both record every call
//! and accept injected failures.

use crate::errors::{LinkError, RuntimeError};
use crate::link::{IfState, NetemParams, Netns, NetworkStack, TbfParams, Veth};
use crate::runtime::{ContainerRuntime, CreateOptions};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type Key = (Netns, String);

/// Queueing disciplines attached to one fake interface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FakeQdiscs {
    pub netem: Option<NetemParams>,
    pub tbf: Option<TbfParams>,
}

#[derive(Debug, Default)]
struct NetState {
    namespaces: BTreeSet<String>,
    host_interfaces: BTreeSet<String>,
    links: BTreeSet<Key>,
    peers: HashMap<Key, Key>,
    bridges: HashSet<Key>,
    attachments: HashMap<Key, String>,
    states: HashMap<Key, IfState>,
    qdiscs: HashMap<Key, FakeQdiscs>,
    calls: Vec<String>,
    failures: Vec<String>,
}

impl NetState {
    fn record(&mut self, call: String) -> Result<(), LinkError> {
        let failed = self.failures.iter().any(|f| call.starts_with(f.as_str()));
        self.calls.push(call.clone());
        if failed {
            return Err(command_error(&call, "injected failure"));
        }
        Ok(())
    }

    fn ns_exists(&self, ns: &Netns) -> bool {
        match ns {
            Netns::Named(name) => self.namespaces.contains(name),
            Netns::Root | Netns::Pid(_) => true,
        }
    }

    fn require_ns(&self, call: &str, ns: &Netns) -> Result<(), LinkError> {
        if self.ns_exists(ns) {
            Ok(())
        } else {
            Err(command_error(call, &format!("namespace {} does not exist", ns)))
        }
    }

    fn require_link(&self, call: &str, key: &Key) -> Result<(), LinkError> {
        if self.links.contains(key) {
            Ok(())
        } else {
            Err(command_error(call, "Cannot find device"))
        }
    }

    fn remove(&mut self, key: &Key) {
        self.links.remove(key);
        self.bridges.remove(key);
        self.attachments.remove(key);
        self.states.remove(key);
        self.qdiscs.remove(key);
        if let Some(peer) = self.peers.remove(key) {
            self.peers.remove(&peer);
            self.links.remove(&peer);
            self.attachments.remove(&peer);
            self.states.remove(&peer);
            self.qdiscs.remove(&peer);
        }
    }

    fn rekey(&mut self, from: &Key, to: Key) {
        self.links.remove(from);
        self.links.insert(to.clone());
        if let Some(state) = self.states.remove(from) {
            self.states.insert(to.clone(), state);
        }
        if let Some(qdiscs) = self.qdiscs.remove(from) {
            self.qdiscs.insert(to.clone(), qdiscs);
        }
        if let Some(bridge) = self.attachments.remove(from) {
            self.attachments.insert(to.clone(), bridge);
        }
        if let Some(peer) = self.peers.remove(from) {
            self.peers.insert(peer.clone(), to.clone());
            self.peers.insert(to, peer);
        }
    }

    fn drop_namespace(&mut self, ns: &Netns) {
        let keys: Vec<Key> = self.links.iter().filter(|(n, _)| n == ns).cloned().collect();
        for key in keys {
            self.remove(&key);
        }
    }
}

fn command_error(call: &str, stderr: &str) -> LinkError {
    LinkError::Command {
        op: call.split_whitespace().next().unwrap_or_default().to_string(),
        command: call.to_string(),
        stderr: stderr.to_string(),
    }
}

/// In-memory [`NetworkStack`].
#[derive(Debug, Default)]
pub struct FakeNetwork {
    state: Mutex<NetState>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Declare a physical interface of the host.
    pub fn add_host_interface(&self, name: &str) {
        let mut state = self.state();
        state.host_interfaces.insert(name.to_string());
        state.links.insert((Netns::Root, name.to_string()));
    }

    /// Make every later call whose description starts with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) {
        self.state().failures.push(prefix.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Sorted interface names living in `ns`.
    pub fn interfaces(&self, ns: &Netns) -> Vec<String> {
        self.state()
            .links
            .iter()
            .filter(|(n, _)| n == ns)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn qdiscs(&self, ns: &Netns, ifname: &str) -> FakeQdiscs {
        self.state()
            .qdiscs
            .get(&(ns.clone(), ifname.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn interface_state(&self, ns: &Netns, ifname: &str) -> Option<IfState> {
        self.state().states.get(&(ns.clone(), ifname.to_string())).copied()
    }

    pub fn bridge_of(&self, ns: &Netns, ifname: &str) -> Option<String> {
        self.state()
            .attachments
            .get(&(ns.clone(), ifname.to_string()))
            .cloned()
    }

    /// Interfaces and named namespaces left behind, host interfaces aside.
    pub fn residue(&self) -> Vec<String> {
        let state = self.state();
        let mut residue: Vec<String> = state
            .links
            .iter()
            .filter(|(ns, name)| !(*ns == Netns::Root && state.host_interfaces.contains(name)))
            .map(|(ns, name)| format!("link {} in {}", name, ns))
            .collect();
        residue.extend(state.namespaces.iter().map(|ns| format!("netns {}", ns)));
        residue
    }

    /// Simulate the end of a process: its namespace vanishes with every
    /// interface inside.
    pub fn destroy_pid_namespace(&self, pid: u32) {
        self.state().drop_namespace(&Netns::Pid(pid));
    }
}

impl NetworkStack for FakeNetwork {
    fn create_netns(&self, name: &str) -> Result<Netns, LinkError> {
        let mut state = self.state();
        let call = format!("create_netns {}", name);
        state.record(call.clone())?;
        if !state.namespaces.insert(name.to_string()) {
            return Err(command_error(&call, "File exists"));
        }
        Ok(Netns::Named(name.to_string()))
    }

    fn delete_netns(&self, name: &str) -> Result<(), LinkError> {
        let mut state = self.state();
        let call = format!("delete_netns {}", name);
        state.record(call.clone())?;
        if !state.namespaces.remove(name) {
            return Err(command_error(&call, "No such file or directory"));
        }
        state.drop_namespace(&Netns::Named(name.to_string()));
        Ok(())
    }

    fn link_exists(&self, name: &str, ns: &Netns) -> bool {
        self.state().links.contains(&(ns.clone(), name.to_string()))
    }

    fn create_veth(
        &self,
        name: &str,
        ns: &Netns,
        peer_name: &str,
        peer_ns: &Netns,
    ) -> Result<Veth, LinkError> {
        let mut state = self.state();
        let call = format!("create_veth {} {} {} {}", name, ns, peer_name, peer_ns);
        state.record(call.clone())?;
        state.require_ns(&call, ns)?;
        state.require_ns(&call, peer_ns)?;

        let key = (ns.clone(), name.to_string());
        let peer_key = (peer_ns.clone(), peer_name.to_string());
        if key == peer_key || state.links.contains(&key) || state.links.contains(&peer_key) {
            return Err(command_error(&call, "File exists"));
        }

        state.links.insert(key.clone());
        state.links.insert(peer_key.clone());
        state.states.insert(key.clone(), IfState::Down);
        state.states.insert(peer_key.clone(), IfState::Down);
        state.peers.insert(key.clone(), peer_key.clone());
        state.peers.insert(peer_key, key);

        Ok(Veth {
            name: name.to_string(),
            peer_name: peer_name.to_string(),
        })
    }

    fn create_bridge(&self, name: &str, ns: &Netns) -> Result<(), LinkError> {
        let mut state = self.state();
        let call = format!("create_bridge {} {}", name, ns);
        state.record(call.clone())?;
        state.require_ns(&call, ns)?;
        let key = (ns.clone(), name.to_string());
        if !state.links.insert(key.clone()) {
            return Err(command_error(&call, "File exists"));
        }
        state.bridges.insert(key.clone());
        state.states.insert(key, IfState::Up);
        Ok(())
    }

    fn attach_to_bridge(&self, bridge: &str, ifname: &str, ns: &Netns) -> Result<(), LinkError> {
        let mut state = self.state();
        let call = format!("attach_to_bridge {} {} {}", bridge, ifname, ns);
        state.record(call.clone())?;
        if !state.bridges.contains(&(ns.clone(), bridge.to_string())) {
            return Err(command_error(&call, "bridge not found"));
        }
        let key = (ns.clone(), ifname.to_string());
        state.require_link(&call, &key)?;
        state.attachments.insert(key.clone(), bridge.to_string());
        state.states.insert(key, IfState::Up);
        Ok(())
    }

    fn delete_link(&self, name: &str, ns: &Netns) -> Result<(), LinkError> {
        let mut state = self.state();
        let call = format!("delete_link {} {}", name, ns);
        state.record(call.clone())?;
        let key = (ns.clone(), name.to_string());
        state.require_link(&call, &key)?;
        state.remove(&key);
        // interfaces enslaved to a deleted bridge are released
        state.attachments.retain(|(n, _), b| !(n == ns && b == name));
        Ok(())
    }

    fn rename_link(&self, name: &str, target: &str, ns: &Netns) -> Result<(), LinkError> {
        let mut state = self.state();
        let call = format!("rename_link {} {} {}", name, target, ns);
        state.record(call.clone())?;
        let from = (ns.clone(), name.to_string());
        let to = (ns.clone(), target.to_string());
        state.require_link(&call, &from)?;
        if from != to && state.links.contains(&to) {
            return Err(command_error(&call, "File exists"));
        }
        state.rekey(&from, to.clone());
        state.states.insert(to, IfState::Up);
        Ok(())
    }

    fn set_interface_state(
        &self,
        name: &str,
        ns: &Netns,
        if_state: IfState,
    ) -> Result<(), LinkError> {
        let mut state = self.state();
        let call = format!("set_interface_state {} {} {}", name, ns, if_state);
        state.record(call.clone())?;
        let key = (ns.clone(), name.to_string());
        state.require_link(&call, &key)?;
        state.states.insert(key, if_state);
        Ok(())
    }

    fn move_interface(&self, name: &str, from: &Netns, to: &Netns) -> Result<(), LinkError> {
        let mut state = self.state();
        let call = format!("move_interface {} {} {}", name, from, to);
        state.record(call.clone())?;
        state.require_ns(&call, to)?;
        let from_key = (from.clone(), name.to_string());
        let to_key = (to.clone(), name.to_string());
        state.require_link(&call, &from_key)?;
        if state.links.contains(&to_key) {
            return Err(command_error(&call, "File exists"));
        }
        // moving a device resets its qdiscs and takes it down
        state.rekey(&from_key, to_key.clone());
        state.qdiscs.remove(&to_key);
        state.states.insert(to_key, IfState::Down);
        Ok(())
    }

    fn netem(
        &self,
        ifname: &str,
        ns: &Netns,
        params: &NetemParams,
        change: bool,
    ) -> Result<(), LinkError> {
        let mut state = self.state();
        let verb = if change { "change" } else { "add" };
        let call = format!("netem {} {} {}", verb, ifname, ns);
        state.record(call.clone())?;
        let key = (ns.clone(), ifname.to_string());
        state.require_link(&call, &key)?;
        let qdiscs = state.qdiscs.entry(key).or_default();
        match (change, qdiscs.netem.is_some()) {
            (false, true) => Err(command_error(&call, "Exclusivity flag on, cannot modify")),
            (true, false) => Err(command_error(&call, "Cannot find specified qdisc")),
            _ => {
                qdiscs.netem = Some(params.clone());
                Ok(())
            }
        }
    }

    fn tbf(
        &self,
        ifname: &str,
        ns: &Netns,
        params: &TbfParams,
        change: bool,
    ) -> Result<(), LinkError> {
        let mut state = self.state();
        let verb = if change { "change" } else { "add" };
        let call = format!("tbf {} {} {}", verb, ifname, ns);
        state.record(call.clone())?;
        let key = (ns.clone(), ifname.to_string());
        state.require_link(&call, &key)?;
        let qdiscs = state.qdiscs.entry(key).or_default();
        if qdiscs.netem.is_none() {
            return Err(command_error(&call, "parent 1:1 not found"));
        }
        match (change, qdiscs.tbf.is_some()) {
            (false, true) => Err(command_error(&call, "Exclusivity flag on, cannot modify")),
            (true, false) => Err(command_error(&call, "Cannot find specified qdisc")),
            _ => {
                qdiscs.tbf = Some(params.clone());
                Ok(())
            }
        }
    }

    fn clear_qdisc(&self, ifname: &str, ns: &Netns) -> Result<(), LinkError> {
        let mut state = self.state();
        let call = format!("clear_qdisc {} {}", ifname, ns);
        state.record(call.clone())?;
        let key = (ns.clone(), ifname.to_string());
        state.require_link(&call, &key)?;
        match state.qdiscs.remove(&key) {
            Some(qdiscs) if qdiscs.netem.is_some() => Ok(()),
            _ => Err(command_error(&call, "Cannot delete qdisc with handle of zero")),
        }
    }
}

/// One container known to the [`FakeRuntime`].
#[derive(Debug, Clone, PartialEq)]
pub struct FakeContainer {
    pub options: CreateOptions,
    pub running: bool,
    pub pid: u32,
    /// Paths present inside the container
    pub files: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct RuntimeState {
    containers: HashMap<String, FakeContainer>,
    missing_images: HashSet<String>,
    outputs: HashMap<String, String>,
    next_id: u32,
    next_pid: u32,
    calls: Vec<String>,
    failures: Vec<String>,
}

impl RuntimeState {
    fn record(&mut self, call: String) -> Result<(), RuntimeError> {
        let failed = self.failures.iter().any(|f| call.starts_with(f.as_str()));
        self.calls.push(call.clone());
        if failed {
            return Err(RuntimeError::Failed {
                command: call,
                status: 1,
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn container(&mut self, id: &str) -> Result<&mut FakeContainer, RuntimeError> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::UnknownContainer(id.to_string()))
    }
}

/// In-memory [`ContainerRuntime`].
///
/// When built with [`FakeRuntime::with_network`], stopping a container
/// destroys its network namespace in the fake network, like the kernel
/// does when the last process of a namespace exits.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    network: Option<Arc<FakeNetwork>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network(network: Arc<FakeNetwork>) -> Self {
        Self {
            state: Mutex::default(),
            network: Some(network),
        }
    }

    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_image_missing(&self, image: &str) {
        self.state().missing_images.insert(image.to_string());
    }

    /// Output returned by `exec` for the exact command line `cmd`.
    pub fn set_exec_output(&self, cmd: &str, output: &str) {
        self.state().outputs.insert(cmd.to_string(), output.to_string());
    }

    /// Make every later call whose description starts with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) {
        self.state().failures.push(prefix.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Container registered under `name`, if any.
    pub fn container_by_name(&self, name: &str) -> Option<FakeContainer> {
        self.state()
            .containers
            .values()
            .find(|c| c.options.name == name)
            .cloned()
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    pub fn running_count(&self) -> usize {
        self.state().containers.values().filter(|c| c.running).count()
    }
}

impl ContainerRuntime for FakeRuntime {
    fn is_image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        let mut state = self.state();
        state.record(format!("image {}", image))?;
        Ok(!state.missing_images.contains(image))
    }

    fn create(&self, opts: &CreateOptions) -> Result<String, RuntimeError> {
        let mut state = self.state();
        state.record(format!("create {}", opts.name))?;
        if state.containers.values().any(|c| c.options.name == opts.name) {
            return Err(RuntimeError::Failed {
                command: format!("create {}", opts.name),
                status: 125,
                stderr: format!("container name {} is already in use", opts.name),
            });
        }
        state.next_id += 1;
        let id = format!("c{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                options: opts.clone(),
                running: false,
                pid: 0,
                files: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.record(format!("start {}", id))?;
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        let container = state.container(id)?;
        container.running = true;
        container.pid = pid;
        Ok(())
    }

    fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let pid = {
            let mut state = self.state();
            state.record(format!("stop {}", id))?;
            let container = state.container(id)?;
            let pid = container.pid;
            container.running = false;
            container.pid = 0;
            pid
        };
        if let Some(network) = &self.network {
            if pid != 0 {
                network.destroy_pid_namespace(pid);
            }
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let pid = {
            let mut state = self.state();
            state.record(format!("remove {}", id))?;
            state
                .containers
                .remove(id)
                .map(|c| c.pid)
                .ok_or_else(|| RuntimeError::UnknownContainer(id.to_string()))?
        };
        if let Some(network) = &self.network {
            if pid != 0 {
                network.destroy_pid_namespace(pid);
            }
        }
        Ok(())
    }

    fn pid(&self, id: &str) -> Result<u32, RuntimeError> {
        let mut state = self.state();
        state.record(format!("pid {}", id))?;
        let container = state.container(id)?;
        if !container.running {
            return Err(RuntimeError::BadOutput {
                command: format!("inspect {}", id),
                output: "0".to_string(),
            });
        }
        Ok(container.pid)
    }

    fn exec(
        &self,
        id: &str,
        cmd: &[&str],
        _timeout: Option<Duration>,
    ) -> Result<String, RuntimeError> {
        let mut state = self.state();
        let line = cmd.join(" ");
        state.record(format!("exec {} {}", id, line))?;
        if !state.container(id)?.running {
            return Err(RuntimeError::Failed {
                command: line,
                status: 1,
                stderr: format!("container {} is not running", id),
            });
        }
        Ok(state.outputs.get(&line).cloned().unwrap_or_default())
    }

    fn exec_tty(&self, id: &str, cmd: &[&str]) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.record(format!("exec_tty {} {}", id, cmd.join(" ")))?;
        state.container(id).map(|_| ())
    }

    fn is_file_exist(&self, id: &str, path: &str) -> bool {
        let mut state = self.state();
        let _ = state.record(format!("test {} {}", id, path));
        state
            .containers
            .get(id)
            .map(|c| c.files.contains(path))
            .unwrap_or(false)
    }

    fn copy_to(&self, id: &str, source: &Path, dest: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.record(format!("copy_to {} {} {}", id, source.display(), dest))?;
        state.container(id)?.files.insert(dest.to_string());
        Ok(())
    }

    fn copy_from(&self, id: &str, source: &str, dest: &Path) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.record(format!("copy_from {} {} {}", id, source, dest.display()))?;
        if !state.container(id)?.files.contains(source) {
            return Err(RuntimeError::Failed {
                command: format!("cp {}:{}", id, source),
                status: 1,
                stderr: format!("Could not find the file {}", source),
            });
        }
        std::fs::write(dest, format!("# copied from {}:{}\n", id, source)).map_err(|e| {
            RuntimeError::Spawn {
                command: format!("cp {}:{}", id, source),
                source: e,
            }
        })
    }
}
