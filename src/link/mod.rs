//! Kernel networking primitives.
//!
//! Every operation the engine performs against the network stack goes
//! through the [`NetworkStack`] trait: namespaces, veth pairs, bridges,
//! interface state and queueing disciplines. [`IpRoute2`] implements it
//! with the `ip` and `tc` tools; `crate::testing::FakeNetwork` records the
//! calls in memory.

pub mod iproute;
pub mod tc;

pub use iproute::IpRoute2;
pub use tc::{NetemParams, TbfParams};

use crate::errors::{LinkError, NetemError};
use std::fmt;
use std::process::Command;

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL).
pub const IFNAME_MAX_LEN: usize = 15;

/// Administrative state of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IfState {
    Up,
    Down,
}

impl fmt::Display for IfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IfState::Up => write!(f, "up"),
            IfState::Down => write!(f, "down"),
        }
    }
}

/// Handle on a network namespace.
///
/// Handles are plain descriptors: nothing is held open, so releasing one is
/// just dropping it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Netns {
    /// The namespace of the host (pid 1).
    Root,
    /// A namespace created with `ip netns add`.
    Named(String),
    /// The namespace of a running process, typically a container.
    Pid(u32),
}

impl Netns {
    /// Value accepted by `ip link ... netns <target>`.
    pub fn target(&self) -> String {
        match self {
            Netns::Root => "1".to_string(),
            Netns::Named(name) => name.clone(),
            Netns::Pid(pid) => pid.to_string(),
        }
    }

    /// Build a command running `program` inside this namespace.
    pub fn command(&self, program: &str) -> Command {
        match self {
            Netns::Root => Command::new(program),
            Netns::Named(name) => {
                let mut cmd = Command::new("ip");
                cmd.args(["netns", "exec", name, program]);
                cmd
            }
            Netns::Pid(pid) => {
                let mut cmd = Command::new("nsenter");
                cmd.args(["-t", &pid.to_string(), "-n", program]);
                cmd
            }
        }
    }
}

impl fmt::Display for Netns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Netns::Root => write!(f, "root"),
            Netns::Named(name) => write!(f, "netns:{}", name),
            Netns::Pid(pid) => write!(f, "pid:{}", pid),
        }
    }
}

/// The two names of a freshly created veth pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Veth {
    pub name: String,
    pub peer_name: String,
}

/// Imperative operations against the kernel network stack.
pub trait NetworkStack: Send + Sync {
    fn create_netns(&self, name: &str) -> Result<Netns, LinkError>;

    fn delete_netns(&self, name: &str) -> Result<(), LinkError>;

    fn link_exists(&self, name: &str, ns: &Netns) -> bool;

    /// Create a veth pair with `name` living in `ns` and `peer_name` in
    /// `peer_ns`.
    fn create_veth(
        &self,
        name: &str,
        ns: &Netns,
        peer_name: &str,
        peer_ns: &Netns,
    ) -> Result<Veth, LinkError>;

    /// Create a bridge device and set it up.
    fn create_bridge(&self, name: &str, ns: &Netns) -> Result<(), LinkError>;

    fn attach_to_bridge(&self, bridge: &str, ifname: &str, ns: &Netns) -> Result<(), LinkError>;

    fn delete_link(&self, name: &str, ns: &Netns) -> Result<(), LinkError>;

    /// Rename an interface and set it up.
    fn rename_link(&self, name: &str, target: &str, ns: &Netns) -> Result<(), LinkError>;

    fn set_interface_state(&self, name: &str, ns: &Netns, state: IfState)
        -> Result<(), LinkError>;

    fn move_interface(&self, name: &str, from: &Netns, to: &Netns) -> Result<(), LinkError>;

    /// Attach (or change, when `change` is set) the root netem qdisc.
    fn netem(
        &self,
        ifname: &str,
        ns: &Netns,
        params: &NetemParams,
        change: bool,
    ) -> Result<(), LinkError>;

    /// Attach (or change) the token bucket filter below the netem qdisc.
    fn tbf(&self, ifname: &str, ns: &Netns, params: &TbfParams, change: bool)
        -> Result<(), LinkError>;

    /// Remove every qdisc attached to `ifname`.
    fn clear_qdisc(&self, ifname: &str, ns: &Netns) -> Result<(), LinkError>;
}

/// Validate a generated interface name against the kernel limit.
pub fn checked_ifname(name: String) -> Result<String, NetemError> {
    if name.is_empty() || name.len() > IFNAME_MAX_LEN {
        return Err(NetemError::InterfaceName(name));
    }
    Ok(name)
}
