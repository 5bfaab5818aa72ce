//! Compiled patterns used to validate topology descriptions.

use regex::Regex;
use std::sync::LazyLock;

pub struct TopologyPatterns {
    /// Node and bridge names (ASCII only, they end up in interface names)
    pub name: Regex,
    /// Switch names, short enough for `<switch>.<idx>` interface names
    pub switch_name: Regex,
    /// `docker.<kind>` or `ovs`
    pub node_type: Regex,
    /// `<node>.<ifIndex>`
    pub peer: Regex,
    /// `hostPath:containerPath`
    pub volume: Regex,
}

impl TopologyPatterns {
    pub fn new() -> Self {
        Self {
            name: Regex::new(r"^[A-Za-z0-9_]+$").expect("Invalid name regex"),
            switch_name: Regex::new(r"^[A-Za-z0-9_]{1,10}$").expect("Invalid switch_name regex"),
            node_type: Regex::new(r"^(docker\.([A-Za-z0-9_]+)|ovs)$")
                .expect("Invalid node_type regex"),
            peer: Regex::new(r"^([A-Za-z0-9_]+)\.([0-9]+)$").expect("Invalid peer regex"),
            volume: Regex::new(r"^[^\x00:]+:[^\x00]+$").expect("Invalid volume regex"),
        }
    }
}

impl Default for TopologyPatterns {
    fn default() -> Self {
        Self::new()
    }
}

/// Global patterns instance
pub static PATTERNS: LazyLock<TopologyPatterns> = LazyLock::new(TopologyPatterns::new);
