//! [`ContainerRuntime`] backed by the `docker` command line client.

use super::{ContainerRuntime, CreateOptions};
use crate::errors::RuntimeError;
use log::{debug, warn};
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Talks to the local daemon through the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    /// Run `docker <args>`, bailing with stderr on failure.
    fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let command = self.describe(args);
        debug!("{}", command);
        let output = self
            .command(args)
            .output()
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;
        check_output(command, output)
    }

    /// Same as [`DockerCli::run`] but kills the client once `timeout` expires.
    fn run_with_timeout(&self, args: &[&str], timeout: Duration) -> Result<String, RuntimeError> {
        let command = self.describe(args);
        debug!("{} (timeout {:?})", command, timeout);

        let mut child = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            let finished = child.try_wait().map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;
            if finished.is_some() {
                break;
            }
            if Instant::now() >= deadline {
                if let Err(e) = child.kill() {
                    warn!("Unable to kill '{}': {}", command, e);
                }
                let _ = child.wait();
                return Err(RuntimeError::Timeout {
                    command,
                    seconds: timeout.as_secs(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }

        let output = child
            .wait_with_output()
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;
        check_output(command, output)
    }
}

fn check_output(command: String, output: Output) -> Result<String, RuntimeError> {
    if !output.status.success() {
        return Err(RuntimeError::Failed {
            command,
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Arguments of `docker create` for `opts`.
pub fn create_args(opts: &CreateOptions) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--name".into(),
        opts.name.clone(),
        "--hostname".into(),
        opts.hostname.clone(),
        "--privileged".into(),
        "--network".into(),
        "none".into(),
    ];
    for volume in &opts.volumes {
        args.push("-v".into());
        args.push(volume.clone());
    }
    if opts.ipv6 {
        args.push("--sysctl".into());
        args.push("net.ipv6.conf.all.disable_ipv6=0".into());
    }
    if opts.mpls {
        args.push("--sysctl".into());
        args.push("net.mpls.platform_labels=100000".into());
    }
    args.push(opts.image.clone());
    args
}

impl ContainerRuntime for DockerCli {
    fn is_image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        let command = self.describe(&["image", "inspect", image]);
        let output = self
            .command(&["image", "inspect", image])
            .output()
            .map_err(|source| RuntimeError::Spawn { command, source })?;
        Ok(output.status.success())
    }

    fn create(&self, opts: &CreateOptions) -> Result<String, RuntimeError> {
        let args = create_args(opts);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.run(&args)?;
        if id.is_empty() {
            return Err(RuntimeError::BadOutput {
                command: self.describe(&args),
                output: id,
            });
        }
        Ok(id)
    }

    fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&["start", id]).map(|_| ())
    }

    fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&["stop", "-t", "1", id]).map(|_| ())
    }

    fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&["rm", "-f", id]).map(|_| ())
    }

    fn pid(&self, id: &str) -> Result<u32, RuntimeError> {
        let args = ["inspect", "-f", "{{.State.Pid}}", id];
        let output = self.run(&args)?;
        match output.parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(pid),
            _ => Err(RuntimeError::BadOutput {
                command: self.describe(&args),
                output,
            }),
        }
    }

    fn exec(
        &self,
        id: &str,
        cmd: &[&str],
        timeout: Option<Duration>,
    ) -> Result<String, RuntimeError> {
        let mut args = vec!["exec", id];
        args.extend_from_slice(cmd);
        match timeout {
            Some(timeout) => self.run_with_timeout(&args, timeout),
            None => self.run(&args),
        }
    }

    fn exec_tty(&self, id: &str, cmd: &[&str]) -> Result<(), RuntimeError> {
        let mut args = vec!["exec", "-it", id];
        args.extend_from_slice(cmd);
        let command = self.describe(&args);
        let status = self
            .command(&args)
            .status()
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !status.success() {
            return Err(RuntimeError::Failed {
                command,
                status: status.code().unwrap_or(-1),
                stderr: String::new(),
            });
        }
        Ok(())
    }

    fn is_file_exist(&self, id: &str, path: &str) -> bool {
        self.command(&["exec", id, "test", "-e", path])
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn copy_to(&self, id: &str, source: &Path, dest: &str) -> Result<(), RuntimeError> {
        let source = source.to_string_lossy();
        let target = format!("{}:{}", id, dest);
        self.run(&["cp", &source, &target]).map(|_| ())
    }

    fn copy_from(&self, id: &str, source: &str, dest: &Path) -> Result<(), RuntimeError> {
        let origin = format!("{}:{}", id, source);
        let dest = dest.to_string_lossy();
        self.run(&["cp", &origin, &dest]).map(|_| ())
    }
}
