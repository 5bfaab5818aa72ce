//! Per-project auxiliary switching instance.
//!
//! Every switch node of a project is a bridge inside one software-switch
//! container. The instance is created during load, started (and probed for
//! readiness) at the beginning of run, and removed on close.

use crate::config::{ImageKind, ServerConfig, NETEM_ID};
use crate::errors::{NetemError, Result, RuntimeError};
use crate::link::Netns;
use crate::runtime::{output_lines, ContainerRuntime, CreateOptions};
use log::{debug, info, warn};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Readiness probe attempts after the container starts.
const PROBE_ATTEMPTS: u32 = 10;
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct InstanceState {
    started: bool,
    bridges: Vec<String>,
}

pub struct SwitchInstance {
    project_id: String,
    container_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    op_timeout: Option<Duration>,
    state: Mutex<InstanceState>,
}

/// Container name of the switching instance of `project_id`.
pub fn container_name(project_id: &str) -> String {
    format!("{}{}.ovs", NETEM_ID, project_id)
}

impl SwitchInstance {
    /// Create (but do not start) the switch container of a project.
    pub fn create(
        project_id: &str,
        runtime: Arc<dyn ContainerRuntime>,
        config: &ServerConfig,
    ) -> Result<Self> {
        let image = config.image_id(ImageKind::Ovs);
        if !runtime.is_image_present(&image)? {
            return Err(RuntimeError::ImageMissing(image).into());
        }

        let opts = CreateOptions {
            image,
            name: container_name(project_id),
            hostname: "ovs".to_string(),
            ..Default::default()
        };
        let container_id = runtime.create(&opts)?;
        debug!("[{}] Switch instance created: {}", project_id, container_id);

        Ok(Self {
            project_id: project_id.to_string(),
            container_id,
            runtime,
            op_timeout: config.op_timeout(),
            state: Mutex::new(InstanceState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, InstanceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    /// Start the container and wait until the switch daemon answers.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state();
        if state.started {
            return Ok(());
        }

        self.runtime.start(&self.container_id)?;

        let mut last_error = None;
        for attempt in 0..PROBE_ATTEMPTS {
            debug!(
                "[{}] Wait for switch daemon - attempt {}",
                self.project_id, attempt
            );
            match self.exec(&["ovs-vsctl", "show"]) {
                Ok(_) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    last_error = Some(e);
                    thread::sleep(PROBE_INTERVAL);
                }
            }
        }
        if let Some(e) = last_error {
            return Err(e);
        }

        state.started = true;
        info!("[{}] Switch instance ready", self.project_id);
        Ok(())
    }

    /// Namespace of the switch container; only valid once started.
    pub fn netns(&self) -> Result<Netns> {
        if !self.is_started() {
            return Err(NetemError::NotRunning(format!(
                "switch instance of project {}",
                self.project_id
            )));
        }
        Ok(Netns::Pid(self.runtime.pid(&self.container_id)?))
    }

    fn exec(&self, cmd: &[&str]) -> Result<String> {
        Ok(self.runtime.exec(&self.container_id, cmd, None)?)
    }

    pub fn add_br(&self, bridge: &str) -> Result<()> {
        let mut state = self.state();
        if state.bridges.iter().any(|b| b == bridge) {
            return Err(NetemError::Unsupported(format!(
                "switch {} already exists",
                bridge
            )));
        }
        self.exec(&["ovs-vsctl", "add-br", bridge])?;
        state.bridges.push(bridge.to_string());
        Ok(())
    }

    /// Delete `bridge`; unknown bridges are ignored.
    pub fn del_br(&self, bridge: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(pos) = state.bridges.iter().position(|b| b == bridge) {
            self.exec(&["ovs-vsctl", "del-br", bridge])?;
            state.bridges.swap_remove(pos);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn has_bridge(&self, bridge: &str) -> bool {
        self.state().bridges.iter().any(|b| b == bridge)
    }

    pub fn add_port(&self, bridge: &str, ifname: &str) -> Result<()> {
        self.exec(&["ovs-vsctl", "add-port", bridge, ifname])
            .map(|_| ())
    }

    pub fn del_port(&self, bridge: &str, ifname: &str) -> Result<()> {
        self.exec(&["ovs-vsctl", "del-port", bridge, ifname])
            .map(|_| ())
    }

    /// Push `<name>.conf` from `conf_dir` into `bridge`, if the file exists.
    pub fn load_config(&self, name: &str, bridge: &str, conf_dir: &Path) -> Result<Vec<String>> {
        let conf_file = conf_dir.join(format!("{}.conf", name));
        if !conf_file.exists() {
            return Ok(Vec::new());
        }

        let tmp_file = format!("/tmp/{}.conf", name);
        self.runtime
            .copy_to(&self.container_id, &conf_file, &tmp_file)?;
        let output = self.runtime.exec(
            &self.container_id,
            &["ovs-config.py", "-a", "load", "-c", &tmp_file, bridge],
            self.op_timeout,
        )?;
        Ok(output_lines(&output))
    }

    /// Dump the configuration of `bridge` into `<dest_dir>/<name>.conf`.
    pub fn save_config(&self, name: &str, bridge: &str, dest_dir: &Path) -> Result<()> {
        let tmp_file = format!("/tmp/{}.conf", name);
        self.runtime.exec(
            &self.container_id,
            &["ovs-config.py", "-a", "save", "-c", &tmp_file, bridge],
            self.op_timeout,
        )?;
        self.runtime.copy_from(
            &self.container_id,
            &tmp_file,
            &dest_dir.join(format!("{}.conf", name)),
        )?;
        Ok(())
    }

    pub fn console(&self, cmd: &[&str]) -> Result<()> {
        if !self.is_started() {
            return Err(NetemError::NotRunning(format!(
                "switch instance of project {}",
                self.project_id
            )));
        }
        Ok(self.runtime.exec_tty(&self.container_id, cmd)?)
    }

    /// Stop and remove the container.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state();
        if state.started {
            if let Err(e) = self.runtime.stop(&self.container_id) {
                warn!("[{}] Unable to stop switch instance: {}", self.project_id, e);
            }
            state.started = false;
        }
        state.bridges.clear();
        self.runtime.remove(&self.container_id)?;
        debug!("[{}] Switch instance removed", self.project_id);
        Ok(())
    }
}

impl std::fmt::Debug for SwitchInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchInstance")
            .field("project_id", &self.project_id)
            .field("container_id", &self.container_id)
            .finish()
    }
}
