//! Switch-backed nodes.
//!
//! A switch node is one bridge of the project's switching instance; its
//! interfaces live in the instance namespace as bridge ports.

use crate::errors::{NetemError, Result};
use crate::link::{checked_ifname, IfState, Netns, NetworkStack};
use crate::switch::SwitchInstance;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub struct SwitchNode {
    project_id: String,
    name: String,
    short_id: String,
    running: bool,
    interfaces: BTreeMap<u32, IfState>,
    instance: Arc<SwitchInstance>,
    stack: Arc<dyn NetworkStack>,
}

impl SwitchNode {
    pub fn new(
        project_id: &str,
        name: &str,
        short_id: &str,
        instance: Arc<SwitchInstance>,
        stack: Arc<dyn NetworkStack>,
    ) -> Self {
        Self {
            project_id: project_id.to_string(),
            name: name.to_string(),
            short_id: short_id.to_string(),
            running: false,
            interfaces: BTreeMap::new(),
            instance,
            stack,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn bridge_name(&self) -> &str {
        &self.name
    }

    pub fn interface_name(&self, if_index: u32) -> String {
        format!("{}.{}", self.bridge_name(), if_index)
    }

    pub fn interfaces_state(&self) -> BTreeMap<u32, IfState> {
        self.interfaces.clone()
    }

    pub fn get_netns(&self) -> Result<Netns> {
        self.instance.netns()
    }

    pub fn add_interface(&mut self, ifname: &str, if_index: u32, ns: &Netns) -> Result<()> {
        let target = checked_ifname(self.interface_name(if_index))?;
        self.stack.rename_link(ifname, &target, ns)?;
        if self.running {
            self.instance.add_port(self.bridge_name(), &target)?;
        }
        self.interfaces.insert(if_index, IfState::Up);
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        debug!("[{}] Start switch {}", self.project_id, self.name);

        self.instance.add_br(self.bridge_name())?;
        self.running = true;
        for &idx in self.interfaces.keys() {
            self.instance
                .add_port(self.bridge_name(), &self.interface_name(idx))?;
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        debug!("[{}] Stop switch {}", self.project_id, self.name);

        for &idx in self.interfaces.keys() {
            self.instance
                .del_port(self.bridge_name(), &self.interface_name(idx))?;
        }
        self.instance.del_br(self.bridge_name())?;
        self.running = false;
        Ok(())
    }

    pub fn load_config(&self, conf_dir: &Path) -> Result<Vec<String>> {
        if !self.running {
            warn!("[{}] LoadConfig: switch not running", self.name);
            return Ok(Vec::new());
        }
        self.instance
            .load_config(&self.name, self.bridge_name(), conf_dir)
    }

    pub fn save(&self, dest_dir: &Path) -> Result<()> {
        if !self.running {
            warn!("[{}] Save: switch not running", self.name);
            return Ok(());
        }
        self.instance
            .save_config(&self.name, self.bridge_name(), dest_dir)
    }

    pub fn console(&self, shell: bool) -> Result<()> {
        if !self.running {
            return Err(NetemError::NotRunning(format!("switch {}", self.name)));
        }
        if shell {
            self.instance.console(&["/bin/bash"])
        } else {
            self.instance
                .console(&["/usr/bin/ovs-console.py", self.bridge_name()])
        }
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

    pub fn close(&mut self) -> Result<()> {
        debug!("[{}] Close switch {}", self.project_id, self.name);
        self.running = false;
        self.interfaces.clear();
        self.instance.del_br(self.bridge_name())
    }
}

impl std::fmt::Debug for SwitchNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchNode")
            .field("name", &self.name)
            .field("running", &self.running)
            .field("interfaces", &self.interfaces)
            .finish()
    }
}
