//! # Netemu - Network emulation engine
//!
//! This library turns a declarative topology description into live
//! kernel networking state: container and software-switch nodes joined by
//! veth links, host bridges and traffic impairment (delay, jitter, loss,
//! rate limiting).
//!
//! ## Overview
//!
//! A project is a directory holding a `network.yml` topology file and an
//! optional `configs/` folder with per-node configuration files. The
//! [`topology::TopologyManager`] validates the topology, creates the nodes,
//! wires links and bridges, pushes configuration and tears everything down
//! again on close.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - `config`: server configuration (YAML) and image naming
//! - `errors`: validation, wiring, runtime and engine error types
//! - `link`: kernel networking primitives behind the `NetworkStack` trait
//! - `runtime`: container runtime collaborator behind `ContainerRuntime`
//! - `switch`: per-project software switching instance
//! - `node`: container-backed and switch-backed nodes
//! - `topology`: description types, validator, identifier generator,
//!   wiring and the lifecycle manager
//! - `registry`: open projects, switching instances and shared context
//! - `utils`: worker pool, random ids, copy argument parsing
//! - `testing`: in-memory collaborators for tests
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use netemu::config::ServerConfig;
//! use netemu::registry::{EngineContext, ProjectRegistry};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let ctx = EngineContext::system(ServerConfig::default())?;
//! let registry = ProjectRegistry::new(Arc::new(ctx));
//!
//! let project = registry.open(Path::new("/srv/labs/ospf"))?;
//! let messages = project.topology().run()?;
//! for msg in messages {
//!     println!("{}: {:?}", msg.node, msg.messages);
//! }
//! registry.close(&project.id)?;
//! # Ok::<(), netemu::errors::NetemError>(())
//! ```
//!
//! ## Topology Format
//!
//! ```yaml
//! nodes:
//!   R1: {type: docker.router, ipv6: true, mpls: true}
//!   host: {type: docker.host}
//!   switch: {type: ovs}
//! links:
//!   - {peer1: R1.0, peer2: switch.0, delay: 50, loss: 2}
//!   - {peer1: host.0, peer2: switch.1, delay: 10, rate: 1000}
//! bridges:
//!   lan: {host: eth0, interfaces: [R1.1]}
//! ```

pub mod config;
pub mod errors;
pub mod link;
pub mod node;
pub mod registry;
pub mod runtime;
pub mod switch;
pub mod testing;
pub mod topology;
pub mod utils;

// Re-export commonly used types for convenience
pub use config::ServerConfig;
pub use errors::{NetemError, Result};
pub use registry::{EngineContext, ProjectRegistry};
pub use topology::{TopologyDescription, TopologyManager};
