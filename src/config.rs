//! Server configuration.
//!
//! The server reads a small YAML document describing where projects are
//! unpacked, how many operations may run against the container runtime at
//! once, and which images back each node kind. A default document is
//! embedded so the engine runs without any file on disk.

use crate::errors::{NetemError, Result};
use log::info;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

static IMAGE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\S+:[\w.]+$").expect("Invalid image tag regex"));

/// Prefix of every kernel/container object created by the engine.
pub const NETEM_ID: &str = "ntm";

/// Tag appended to configured images that do not carry one.
pub const IMG_VERSION: &str = "0.2.0";

/// Default location of the server configuration file.
pub const SERVER_CONFIG_FILE: &str = "/etc/netemu/config.yaml";

/// Name of the topology file inside a project directory.
pub const NETWORK_FILENAME: &str = "network.yml";

/// Name of the per-node configuration folder inside a project directory.
pub const CONFIG_DIR: &str = "configs";

pub const INITIAL_SERVER_CONFIG: &str = r#"workdir: /tmp
workers: 30
docker:
  timeout_op: 60s
  images:
    server: netemu/server
    host: netemu/host
    router: netemu/frr
    ovs: netemu/ovs
"#;

/// Image families known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Router,
    Host,
    Server,
    Ovs,
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory where temporary project data is written
    pub workdir: String,
    /// Ceiling of concurrent operations against the container runtime
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub docker: DockerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Timeout applied to configuration push/save operations (0s disables it)
    #[serde(with = "humantime_serde", default = "default_timeout_op")]
    pub timeout_op: Duration,
    pub images: DockerImages,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerImages {
    pub server: String,
    pub host: String,
    pub router: String,
    pub ovs: String,
}

fn default_workers() -> usize {
    30
}

fn default_timeout_op() -> Duration {
    Duration::from_secs(60)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workdir: "/tmp".to_string(),
            workers: default_workers(),
            docker: DockerConfig {
                timeout_op: default_timeout_op(),
                images: DockerImages {
                    server: "netemu/server".to_string(),
                    host: "netemu/host".to_string(),
                    router: "netemu/frr".to_string(),
                    ovs: "netemu/ovs".to_string(),
                },
            },
        }
    }
}

impl ServerConfig {
    /// Parse a configuration document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ServerConfig =
            serde_yaml::from_str(content).map_err(|e| NetemError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate the configuration stored at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading server configuration from: {:?}", path);
        let content = std::fs::read_to_string(path)
            .map_err(|e| NetemError::io(format!("unable to read {}", path.display()), e))?;
        Self::from_yaml(&content)
    }

    /// Write the embedded default document to `path`.
    pub fn write_default(path: &Path) -> Result<()> {
        std::fs::write(path, INITIAL_SERVER_CONFIG)
            .map_err(|e| NetemError::io(format!("unable to write {}", path.display()), e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(NetemError::Config("workers must be greater than 0".to_string()));
        }
        if self.workdir.is_empty() {
            return Err(NetemError::Config("workdir cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Timeout for config push/save, `None` when disabled.
    pub fn op_timeout(&self) -> Option<Duration> {
        if self.docker.timeout_op.is_zero() {
            None
        } else {
            Some(self.docker.timeout_op)
        }
    }

    /// Full image reference for `kind`, tagged with [`IMG_VERSION`] when the
    /// configured name has no tag.
    pub fn image_id(&self, kind: ImageKind) -> String {
        let images = &self.docker.images;
        let name = match kind {
            ImageKind::Router => &images.router,
            ImageKind::Host => &images.host,
            ImageKind::Server => &images.server,
            ImageKind::Ovs => &images.ovs,
        };

        if IMAGE_TAG.is_match(name) {
            name.clone()
        } else {
            format!("{}:{}", name, IMG_VERSION)
        }
    }
}
