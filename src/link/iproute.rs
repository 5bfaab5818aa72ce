//! [`NetworkStack`] backed by the iproute2 tools.

use super::{IfState, NetemParams, Netns, NetworkStack, TbfParams, Veth};
use crate::errors::LinkError;
use log::debug;
use std::process::{Command, Output};

/// Drives `ip` and `tc`; must run with CAP_NET_ADMIN in the root namespace.
#[derive(Debug, Default, Clone)]
pub struct IpRoute2;

impl IpRoute2 {
    pub fn new() -> Self {
        Self
    }
}

fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().to_string()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().to_string()));
    parts.join(" ")
}

/// Run `cmd`, failing with its stderr when it exits non-zero.
fn run(op: &str, mut cmd: Command) -> Result<Output, LinkError> {
    let command = describe(&cmd);
    debug!("{}: {}", op, command);

    let output = cmd.output().map_err(|source| LinkError::Spawn {
        command: command.clone(),
        source,
    })?;
    if !output.status.success() {
        return Err(LinkError::Command {
            op: op.to_string(),
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

fn ip(ns: &Netns, args: &[&str]) -> Command {
    let mut cmd = ns.command("ip");
    cmd.args(args);
    cmd
}

impl NetworkStack for IpRoute2 {
    fn create_netns(&self, name: &str) -> Result<Netns, LinkError> {
        run("create netns", ip(&Netns::Root, &["netns", "add", name]))?;
        Ok(Netns::Named(name.to_string()))
    }

    fn delete_netns(&self, name: &str) -> Result<(), LinkError> {
        run("delete netns", ip(&Netns::Root, &["netns", "del", name]))?;
        Ok(())
    }

    fn link_exists(&self, name: &str, ns: &Netns) -> bool {
        ip(ns, &["link", "show", "dev", name])
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn create_veth(
        &self,
        name: &str,
        ns: &Netns,
        peer_name: &str,
        peer_ns: &Netns,
    ) -> Result<Veth, LinkError> {
        let target = ns.target();
        let peer_target = peer_ns.target();
        run(
            "create veth",
            ip(
                &Netns::Root,
                &[
                    "link", "add", name, "netns", &target, "mtu", "1500", "type", "veth", "peer",
                    "name", peer_name, "netns", &peer_target,
                ],
            ),
        )?;

        Ok(Veth {
            name: name.to_string(),
            peer_name: peer_name.to_string(),
        })
    }

    fn create_bridge(&self, name: &str, ns: &Netns) -> Result<(), LinkError> {
        run("create bridge", ip(ns, &["link", "add", "name", name, "type", "bridge"]))?;
        run("set bridge up", ip(ns, &["link", "set", "dev", name, "up"]))?;
        Ok(())
    }

    fn attach_to_bridge(&self, bridge: &str, ifname: &str, ns: &Netns) -> Result<(), LinkError> {
        run(
            "attach to bridge",
            ip(ns, &["link", "set", "dev", ifname, "master", bridge]),
        )?;
        Ok(())
    }

    fn delete_link(&self, name: &str, ns: &Netns) -> Result<(), LinkError> {
        run("delete link", ip(ns, &["link", "del", "dev", name]))?;
        Ok(())
    }

    fn rename_link(&self, name: &str, target: &str, ns: &Netns) -> Result<(), LinkError> {
        run("rename link", ip(ns, &["link", "set", "dev", name, "name", target]))?;
        run("set link up", ip(ns, &["link", "set", "dev", target, "up"]))?;
        Ok(())
    }

    fn set_interface_state(
        &self,
        name: &str,
        ns: &Netns,
        state: IfState,
    ) -> Result<(), LinkError> {
        let state = state.to_string();
        run("set link state", ip(ns, &["link", "set", "dev", name, &state]))?;
        Ok(())
    }

    fn move_interface(&self, name: &str, from: &Netns, to: &Netns) -> Result<(), LinkError> {
        let target = to.target();
        run(
            "move link",
            ip(from, &["link", "set", "dev", name, "netns", &target]),
        )?;
        Ok(())
    }

    fn netem(
        &self,
        ifname: &str,
        ns: &Netns,
        params: &NetemParams,
        change: bool,
    ) -> Result<(), LinkError> {
        let mut cmd = ns.command("tc");
        cmd.args(["qdisc", if change { "change" } else { "add" }]);
        cmd.args(params.args(ifname));
        run("netem qdisc", cmd)?;
        Ok(())
    }

    fn tbf(
        &self,
        ifname: &str,
        ns: &Netns,
        params: &TbfParams,
        change: bool,
    ) -> Result<(), LinkError> {
        let mut cmd = ns.command("tc");
        cmd.args(["qdisc", if change { "change" } else { "add" }]);
        cmd.args(params.args(ifname));
        run("tbf qdisc", cmd)?;
        Ok(())
    }

    fn clear_qdisc(&self, ifname: &str, ns: &Netns) -> Result<(), LinkError> {
        let mut cmd = ns.command("tc");
        cmd.args(["qdisc", "del", "dev", ifname, "root"]);
        run("delete qdisc", cmd)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_root() -> bool {
        Command::new("id")
            .arg("-u")
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim() == "0")
            .unwrap_or(false)
    }

    #[test]
    fn test_describe_joins_program_and_args() {
        let cmd = ip(&Netns::Root, &["link", "show"]);
        assert_eq!(describe(&cmd), "ip link show");
    }

    #[test]
    fn test_failed_command_reports_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let err = run("probe", cmd).unwrap_err();
        match err {
            LinkError::Command { op, stderr, .. } => {
                assert_eq!(op, "probe");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_veth_in_scratch_namespace() {
        if !is_root() {
            eprintln!("Skipping: requires root privileges");
            return;
        }

        let stack = IpRoute2::new();
        let ns_name = format!("ntmt{}", std::process::id() % 100_000);
        let ns = stack.create_netns(&ns_name).expect("create netns");

        let veth = stack
            .create_veth("ntmtva", &ns, "ntmtvb", &ns)
            .expect("create veth");
        assert!(stack.link_exists(&veth.name, &ns));
        assert!(stack.link_exists(&veth.peer_name, &ns));
        stack
            .set_interface_state(&veth.name, &ns, IfState::Up)
            .expect("set up");

        stack.delete_netns(&ns_name).expect("delete netns");
    }
}
