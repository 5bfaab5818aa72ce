//! Error types shared by the engine.
//!
//! Validation problems are collected as [`TopologyError`] lists and never
//! abort early. Wiring and container failures propagate immediately as
//! [`LinkError`] / [`RuntimeError`], wrapped into the engine-level
//! [`NetemError`].

use std::path::PathBuf;

/// A single problem found while checking a topology description.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TopologyError {
    #[error("Unable to read topology file '{path}': {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Unable to parse topology file '{path}': {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Node: '{0}' name field is not valid")]
    InvalidNodeName(String),

    #[error("Node '{name}': type field '{kind}' is not valid")]
    InvalidNodeType { name: String, kind: String },

    #[error("Switch node '{0}': name must have at most 10 characters")]
    SwitchNameTooLong(String),

    #[error("Switch node '{0}': MPLS can not be enabled on a switch")]
    SwitchMpls(String),

    #[error("[{node}/volumes] volume bind '{bind}' is not valid")]
    InvalidVolume { node: String, bind: String },

    #[error("[{node}/volumes] host path '{path}' does not exist")]
    MissingVolumePath { node: String, path: String },

    #[error("Link: invalid format for peer '{0}' (<node>.<ifIndex> required)")]
    InvalidPeer(String),

    #[error("Link: peer '{0}' is already used")]
    PeerReused(String),

    #[error("Link: node '{0}' does not exist")]
    UnknownNode(String),

    #[error("Link: a link can not have the same peer '{0}' twice")]
    SamePeer(String),

    #[error("Link {link}: {reason}")]
    InvalidShaping { link: String, reason: String },

    #[error("Bridge: '{0}' name field is not valid")]
    InvalidBridgeName(String),

    #[error("Bridge {bridge}: host interface {host} not found")]
    MissingHostInterface { bridge: String, host: String },
}

/// Failure of a kernel networking primitive.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("unable to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} failed ({command}): {stderr}")]
    Command {
        op: String,
        command: String,
        stderr: String,
    },
}

/// Failure reported by the container runtime collaborator.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("unable to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with status {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("'{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("container image {0} not present")]
    ImageMissing(String),

    #[error("unexpected output from '{command}': {output}")]
    BadOutput { command: String, output: String },

    #[error("container {0} not found")]
    UnknownContainer(String),
}

/// Engine-level error returned by the topology manager and registries.
#[derive(Debug, thiserror::Error)]
pub enum NetemError {
    #[error("Topology is not valid:{}", format_errors(.0))]
    InvalidTopology(Vec<TopologyError>),

    #[error("Node {name} not found in project {project}")]
    NodeNotFound { project: String, name: String },

    #[error("Project {0}: not found")]
    ProjectNotFound(String),

    #[error("Link {peer1}-{peer2} not found in project {project}")]
    LinkNotFound {
        project: String,
        peer1: String,
        peer2: String,
    },

    #[error("Interface {node}.{index} not found")]
    InterfaceNotFound { node: String, index: u32 },

    #[error("Topology of project {0} is closed")]
    Closed(String),

    #[error("Unable to create node {name}: {source}")]
    NodeCreate {
        name: String,
        #[source]
        source: Box<NetemError>,
    },

    #[error("Unable to generate a short id for {0}: all attempts fail")]
    IdExhausted(String),

    #[error("Interface name '{0}' exceeds the kernel limit of 15 bytes")]
    InterfaceName(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("Unable to {action}: {source}")]
    Wiring {
        action: String,
        #[source]
        source: LinkError,
    },

    #[error("Node {node} - {context}: {source}")]
    NodeCommand {
        node: String,
        context: String,
        #[source]
        source: RuntimeError,
    },

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("Invalid server configuration: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl NetemError {
    /// True for errors a caller should surface as "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            NetemError::NodeNotFound { .. }
                | NetemError::ProjectNotFound(_)
                | NetemError::LinkNotFound { .. }
                | NetemError::InterfaceNotFound { .. }
        )
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        NetemError::Io {
            context: context.into(),
            source,
        }
    }
}

fn format_errors(errors: &[TopologyError]) -> String {
    errors.iter().map(|e| format!("\n\t{e}")).collect()
}

pub type Result<T, E = NetemError> = std::result::Result<T, E>;
