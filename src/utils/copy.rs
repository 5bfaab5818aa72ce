//! Parsing of `node:path` copy arguments.

use std::path::Path;

/// Which side(s) of a copy live inside a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    FromNode,
    ToNode,
    AcrossNodes,
    Local,
}

/// Split `node:path` into its node and path parts.
///
/// Absolute paths, arguments without `:` and explicit relative paths such as
/// `./file:name.txt` are local.
pub fn split_copy_arg(arg: &str) -> (Option<&str>, &str) {
    if Path::new(arg).is_absolute() {
        return (None, arg);
    }

    match arg.split_once(':') {
        Some((node, path)) if !node.starts_with('.') => (Some(node), path),
        _ => (None, arg),
    }
}

pub fn copy_direction(source: Option<&str>, dest: Option<&str>) -> CopyDirection {
    match (source, dest) {
        (Some(_), Some(_)) => CopyDirection::AcrossNodes,
        (Some(_), None) => CopyDirection::FromNode,
        (None, Some(_)) => CopyDirection::ToNode,
        (None, None) => CopyDirection::Local,
    }
}
