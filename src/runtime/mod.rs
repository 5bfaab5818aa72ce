//! Container runtime collaborator.
//!
//! The engine never manipulates containers directly: node kinds go through
//! [`ContainerRuntime`], realised by [`DockerCli`] in production and by
//! `crate::testing::FakeRuntime` in tests.

pub mod docker;

pub use docker::DockerCli;

use crate::errors::RuntimeError;
use std::path::Path;
use std::time::Duration;

/// Parameters of a container creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOptions {
    pub image: String,
    pub name: String,
    pub hostname: String,
    /// `hostPath:containerPath` bind mounts
    pub volumes: Vec<String>,
    pub ipv6: bool,
    pub mpls: bool,
}

pub trait ContainerRuntime: Send + Sync {
    fn is_image_present(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Create a container and return its id.
    fn create(&self, opts: &CreateOptions) -> Result<String, RuntimeError>;

    fn start(&self, id: &str) -> Result<(), RuntimeError>;

    fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Pid of the container's init process, used to reach its namespace.
    fn pid(&self, id: &str) -> Result<u32, RuntimeError>;

    /// Run `cmd` and return its standard output, trimmed.
    fn exec(
        &self,
        id: &str,
        cmd: &[&str],
        timeout: Option<Duration>,
    ) -> Result<String, RuntimeError>;

    /// Run `cmd` attached to the caller's terminal.
    fn exec_tty(&self, id: &str, cmd: &[&str]) -> Result<(), RuntimeError>;

    fn is_file_exist(&self, id: &str, path: &str) -> bool;

    fn copy_to(&self, id: &str, source: &Path, dest: &str) -> Result<(), RuntimeError>;

    fn copy_from(&self, id: &str, source: &str, dest: &Path) -> Result<(), RuntimeError>;
}

/// Split command output into advisory message lines.
pub fn output_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_lines_skips_blank() {
        let lines = output_lines("eth0 configured\n\n  \neth1 configured\n");
        assert_eq!(lines, vec!["eth0 configured", "eth1 configured"]);
        assert!(output_lines("").is_empty());
    }
}
