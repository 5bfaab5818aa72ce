//! Container-backed nodes (routers, hosts and servers).
//!
//! A container node keeps its interfaces in a private named namespace
//! (`<projectId><nodeName>`) while stopped, and moves them into the
//! container namespace when it starts.

use super::NodeContext;
use crate::config::{ImageKind, NETEM_ID};
use crate::errors::{NetemError, Result, RuntimeError};
use crate::link::{IfState, Netns, NetworkStack};
use crate::runtime::{output_lines, ContainerRuntime, CreateOptions};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Init script pushed from `<name>.init.conf` and run after configuration.
pub const INIT_SCRIPT: &str = "/netemu-init.sh";

/// Network configuration file consumed by `network-config.py`.
const NET_CONF: &str = "/tmp/custom.net.conf";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Router,
    Host,
    Server,
}

impl ContainerKind {
    pub fn parse(kind: &str) -> Option<ContainerKind> {
        match kind {
            "router" => Some(ContainerKind::Router),
            "host" => Some(ContainerKind::Host),
            "server" => Some(ContainerKind::Server),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::Router => "router",
            ContainerKind::Host => "host",
            ContainerKind::Server => "server",
        }
    }

    fn image_kind(&self) -> ImageKind {
        match self {
            ContainerKind::Router => ImageKind::Router,
            ContainerKind::Host => ImageKind::Host,
            ContainerKind::Server => ImageKind::Server,
        }
    }

    /// `(host file suffix, container path)` pairs pushed on load and
    /// pulled on save.
    fn config_files(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            ContainerKind::Router => &[("frr.conf", "/etc/frr/frr.conf")],
            ContainerKind::Host => &[("net.conf", NET_CONF), ("ntp.conf", "/etc/ntp.conf")],
            ContainerKind::Server => &[
                ("net.conf", NET_CONF),
                ("ntp.conf", "/etc/ntp.conf"),
                ("dhcpd.conf", "/etc/dhcp/dhcpd.conf"),
                ("tftpd-hpa.default", "/etc/default/tftpd-hpa"),
                ("isc-relay.default", "/etc/default/isc-dhcp-relay"),
                ("bind.default", "/etc/default/named"),
            ],
        }
    }

    /// `(host archive suffix, container folder)` pairs.
    fn config_folders(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            ContainerKind::Server => &[
                ("tftp-data.tgz", "/srv/tftp"),
                ("bind-etc.tgz", "/etc/bind"),
            ],
            ContainerKind::Router | ContainerKind::Host => &[],
        }
    }
}

pub struct ContainerNode {
    project_id: String,
    name: String,
    short_id: String,
    kind: ContainerKind,
    id: String,
    mpls: bool,
    interfaces: BTreeMap<u32, IfState>,
    local_netns: Option<String>,
    running: bool,
    config_loaded: bool,
    op_timeout: Option<Duration>,
    runtime: Arc<dyn ContainerRuntime>,
    stack: Arc<dyn NetworkStack>,
}

impl ContainerNode {
    /// Create the backing container of node `name`.
    pub fn create(
        ctx: &NodeContext<'_>,
        name: &str,
        short_id: &str,
        kind: ContainerKind,
        spec: &crate::topology::NodeSpec,
    ) -> Result<Self> {
        let image = spec
            .image
            .clone()
            .unwrap_or_else(|| ctx.config.image_id(kind.image_kind()));
        if !ctx.runtime.is_image_present(&image)? {
            return Err(RuntimeError::ImageMissing(image).into());
        }

        let opts = CreateOptions {
            image,
            name: format!("{}{}.{}", NETEM_ID, ctx.project_id, name),
            hostname: name.to_string(),
            volumes: spec.volumes.clone(),
            ipv6: spec.ipv6,
            mpls: spec.mpls,
        };
        let id = ctx.runtime.create(&opts)?;
        debug!("[{}] Node {} created: container {}", ctx.project_id, name, id);

        Ok(Self {
            project_id: ctx.project_id.to_string(),
            name: name.to_string(),
            short_id: short_id.to_string(),
            kind,
            id,
            mpls: spec.mpls,
            interfaces: BTreeMap::new(),
            local_netns: None,
            running: false,
            config_loaded: false,
            op_timeout: ctx.config.op_timeout(),
            runtime: ctx.runtime.clone(),
            stack: ctx.stack.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    pub fn container_id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn interface_name(&self, if_index: u32) -> String {
        format!("eth{}", if_index)
    }

    pub fn interfaces_state(&self) -> BTreeMap<u32, IfState> {
        self.interfaces.clone()
    }

    fn running_netns(&self) -> Result<Netns> {
        if !self.running {
            return Err(NetemError::NotRunning(format!("node {}", self.name)));
        }
        Ok(Netns::Pid(self.runtime.pid(&self.id)?))
    }

    /// Named namespace parking the interfaces of the stopped container,
    /// created on first use.
    fn local_netns(&mut self) -> Result<Netns> {
        if let Some(name) = &self.local_netns {
            return Ok(Netns::Named(name.clone()));
        }

        let name = format!("{}{}", self.project_id, self.name);
        let ns = self.stack.create_netns(&name)?;
        self.local_netns = Some(name);
        Ok(ns)
    }

    pub fn get_netns(&mut self) -> Result<Netns> {
        if self.running {
            self.running_netns()
        } else {
            self.local_netns()
        }
    }

    /// Adopt a freshly created interface living in `ns`.
    pub fn add_interface(&mut self, ifname: &str, if_index: u32, ns: &Netns) -> Result<()> {
        let target = self.interface_name(if_index);
        self.stack.rename_link(ifname, &target, ns)?;
        self.interfaces.insert(if_index, IfState::Up);
        if self.running {
            self.prepare_interface(&target);
        }
        Ok(())
    }

    /// Disable TX offloading and, for MPLS nodes, enable label input.
    fn prepare_interface(&self, ifname: &str) {
        if let Err(e) = self
            .runtime
            .exec(&self.id, &["ethtool", "-K", ifname, "tx", "off"], None)
        {
            warn!("[{}] Unable to disable tcp offloading on {}: {}", self.name, ifname, e);
        }

        if self.mpls {
            let sysctl = format!("net.mpls.conf.{}.input=1", ifname);
            if let Err(e) = self.runtime.exec(&self.id, &["sysctl", "-w", &sysctl], None) {
                warn!("[{}] Unable to enable MPLS on {}: {}", self.name, ifname, e);
            }
        }
    }

    /// Move every interface from `from` to `to`, keeping its admin state.
    fn move_interfaces(&self, from: &Netns, to: &Netns) -> Result<()> {
        for (&idx, &state) in &self.interfaces {
            let ifname = self.interface_name(idx);
            self.stack.move_interface(&ifname, from, to)?;
            self.stack.set_interface_state(&ifname, to, state)?;
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        debug!("[{}] Start node {}", self.project_id, self.name);

        self.runtime.start(&self.id)?;
        self.running = true;

        let local = self.local_netns()?;
        let target = self.running_netns()?;
        self.move_interfaces(&local, &target)?;

        for &idx in self.interfaces.keys() {
            self.prepare_interface(&self.interface_name(idx));
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        debug!("[{}] Stop node {}", self.project_id, self.name);

        let current = self.running_netns()?;
        let local = self.local_netns()?;
        self.move_interfaces(&current, &local)?;

        self.runtime.stop(&self.id)?;
        self.running = false;
        self.config_loaded = false;
        Ok(())
    }

    fn exec_output(&self, cmd: &[&str], context: &str) -> Result<String> {
        self.runtime
            .exec(&self.id, cmd, self.op_timeout)
            .map_err(|source| NetemError::NodeCommand {
                node: self.name.clone(),
                context: context.to_string(),
                source,
            })
    }

    /// Push the configuration files found in `conf_dir` and start the
    /// node's services. Returns advisory output lines.
    pub fn load_config(&mut self, conf_dir: &Path) -> Result<Vec<String>> {
        let mut messages = Vec::new();
        if !self.running {
            info!("[{}] LoadConfig: node not running", self.name);
            return Ok(messages);
        }
        if self.config_loaded {
            return Ok(messages);
        }

        if conf_dir.exists() {
            let files = self
                .kind
                .config_files()
                .iter()
                .copied()
                .chain(std::iter::once(("init.conf", INIT_SCRIPT)));
            for (suffix, dest) in files {
                let source = conf_dir.join(format!("{}.{}", self.name, suffix));
                if !source.exists() {
                    continue;
                }
                self.runtime.copy_to(&self.id, &source, dest)?;
            }

            for &(suffix, folder) in self.kind.config_folders() {
                let archive = format!("{}.{}", self.name, suffix);
                let source = conf_dir.join(&archive);
                if !source.exists() {
                    continue;
                }
                let tmp = format!("/tmp/{}", archive);
                self.runtime.copy_to(&self.id, &source, &tmp)?;
                self.exec_output(
                    &["tar", "xzf", &tmp, "-C", "/"],
                    &format!("unable to extract {} into {}", archive, folder),
                )?;
            }
        }

        match self.kind {
            ContainerKind::Router => {
                self.exec_output(
                    &["/usr/lib/frr/frrinit.sh", "start"],
                    "unable to start router process",
                )?;
            }
            ContainerKind::Host | ContainerKind::Server => {
                if conf_dir.join(format!("{}.net.conf", self.name)).exists() {
                    let output = self.exec_output(
                        &["network-config.py", "-l", NET_CONF],
                        "unable to load network config",
                    )?;
                    messages.extend(output_lines(&output));
                }
            }
        }

        if self.runtime.is_file_exist(&self.id, INIT_SCRIPT) {
            let output = self.exec_output(&["sh", INIT_SCRIPT], "init script failed")?;
            messages.extend(output_lines(&output));
        }

        self.config_loaded = true;
        Ok(messages)
    }

    /// Pull the node configuration back into `dest_dir`.
    pub fn save(&self, dest_dir: &Path) -> Result<()> {
        if !self.running || !self.config_loaded {
            info!("[{}] Save: node not running", self.name);
            return Ok(());
        }

        match self.kind {
            ContainerKind::Router => {
                self.exec_output(&["vtysh", "-w"], "unable to save router config")?;
                self.exec_output(&["chmod", "+r", "/etc/frr/frr.conf"], "unable to read router config")?;
            }
            ContainerKind::Host | ContainerKind::Server => {
                self.exec_output(&["network-config.py", "-s", NET_CONF], "unable to save network config")?;
            }
        }

        let files = self
            .kind
            .config_files()
            .iter()
            .copied()
            .chain(std::iter::once(("init.conf", INIT_SCRIPT)));
        for (suffix, source) in files {
            if !self.runtime.is_file_exist(&self.id, source) {
                continue;
            }
            let dest = dest_dir.join(format!("{}.{}", self.name, suffix));
            self.runtime.copy_from(&self.id, source, &dest)?;
        }

        for &(suffix, folder) in self.kind.config_folders() {
            if !self.runtime.is_file_exist(&self.id, folder) {
                continue;
            }
            let tmp = format!("/tmp/{}.{}", self.name, suffix);
            self.exec_output(&["tar", "czf", &tmp, folder], "unable to archive folder")?;
            let dest = dest_dir.join(format!("{}.{}", self.name, suffix));
            self.runtime.copy_from(&self.id, &tmp, &dest)?;
        }
        Ok(())
    }

    pub fn console(&self, shell: bool) -> Result<()> {
        if !self.running {
            return Err(NetemError::NotRunning(format!("node {}", self.name)));
        }
        let cmd: &[&str] = match (shell, self.kind) {
            (false, ContainerKind::Router) => &["/usr/bin/vtysh"],
            _ => &["/bin/bash"],
        };
        Ok(self.runtime.exec_tty(&self.id, cmd)?)
    }

    pub fn copy_to(&self, source: &Path, dest: &str) -> Result<()> {
        Ok(self.runtime.copy_to(&self.id, source, dest)?)
    }

    pub fn copy_from(&self, source: &str, dest: &Path) -> Result<()> {
        Ok(self.runtime.copy_from(&self.id, source, dest)?)
    }

    pub fn set_interface_state(&mut self, if_index: u32, state: IfState) -> Result<()> {
        let Some(&current) = self.interfaces.get(&if_index) else {
            return Err(NetemError::InterfaceNotFound {
                node: self.name.clone(),
                index: if_index,
            });
        };
        if current == state {
            return Ok(());
        }

        let ns = self.get_netns()?;
        self.stack
            .set_interface_state(&self.interface_name(if_index), &ns, state)?;
        self.interfaces.insert(if_index, state);
        Ok(())
    }

    /// Remove the container and the parking namespace.
    pub fn close(&mut self) -> Result<()> {
        debug!("[{}] Close node {}", self.project_id, self.name);
        if self.running {
            if let Err(e) = self.runtime.stop(&self.id) {
                warn!("[{}] Unable to stop node {}: {}", self.project_id, self.name, e);
            }
            self.running = false;
        }
        let removed = self.runtime.remove(&self.id);

        self.config_loaded = false;
        self.interfaces.clear();
        if let Some(name) = self.local_netns.take() {
            self.stack.delete_netns(&name)?;
        }
        Ok(removed?)
    }
}

impl std::fmt::Debug for ContainerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerNode")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("running", &self.running)
            .finish()
    }
}
