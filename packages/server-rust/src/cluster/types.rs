//! Controller configuration and small shared domain types.

use std::path::Path;

use anyhow::Context;
use fleetctl_core::{NodeIdentity, NodeType};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Configured topology
// ---------------------------------------------------------------------------

/// A configured node index. Each index hosts one distributor and one storage
/// node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfiguredNode {
    pub index: u16,
    #[serde(default)]
    pub retired: bool,
}

impl ConfiguredNode {
    #[must_use]
    pub fn new(index: u16) -> Self {
        Self {
            index,
            retired: false,
        }
    }

    #[must_use]
    pub fn retired(index: u16) -> Self {
        Self {
            index,
            retired: true,
        }
    }
}

/// A redundancy group of storage node indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub name: String,
    pub nodes: Vec<u16>,
}

/// How long a node that lost contact may stay in an implicit maintenance
/// state before it is marked Down. Zero disables the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaxTransitionTimes {
    pub storage_ms: u64,
    pub distributor_ms: u64,
}

impl Default for MaxTransitionTimes {
    fn default() -> Self {
        Self {
            storage_ms: 5000,
            distributor_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// FleetControllerConfig
// ---------------------------------------------------------------------------

/// Configuration of one controller replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FleetControllerConfig {
    pub cluster_name: String,
    /// Index of this controller replica.
    pub index: u16,
    pub fleet_controller_count: u16,
    pub nodes: Vec<ConfiguredNode>,
    pub groups: Vec<GroupConfig>,
    pub min_node_ratio_per_group: f64,
    pub min_storage_nodes_up: u16,
    pub min_distributor_nodes_up: u16,
    pub min_ratio_of_storage_nodes_up: f64,
    pub min_ratio_of_distributor_nodes_up: f64,
    pub max_transition_time: MaxTransitionTimes,
    pub max_init_progress_time_ms: u64,
    /// Zero disables the crash ceiling.
    pub max_premature_crashes: u32,
    pub stable_state_time_period_ms: u64,
    pub node_state_request_timeout_ms: u64,
    pub node_state_request_timeout_earliest_percentage: u32,
    pub node_state_request_timeout_latest_percentage: u32,
    pub max_slobrok_disconnect_grace_period_ms: u64,
    pub min_time_before_first_system_state_broadcast_ms: u64,
    pub min_time_between_new_system_states_ms: u64,
    pub ideal_distribution_bits: u32,
    pub master_lease_ms: u64,
    pub master_cooldown_ms: u64,
    pub tick_interval_ms: u64,
    pub event_log_capacity: usize,
}

impl Default for FleetControllerConfig {
    fn default() -> Self {
        Self {
            cluster_name: "cluster".to_string(),
            index: 0,
            fleet_controller_count: 1,
            nodes: Vec::new(),
            groups: Vec::new(),
            min_node_ratio_per_group: 0.0,
            min_storage_nodes_up: 1,
            min_distributor_nodes_up: 1,
            min_ratio_of_storage_nodes_up: 0.0,
            min_ratio_of_distributor_nodes_up: 0.0,
            max_transition_time: MaxTransitionTimes::default(),
            max_init_progress_time_ms: 5000,
            max_premature_crashes: 4,
            stable_state_time_period_ms: 2 * 60 * 60 * 1000,
            node_state_request_timeout_ms: 5 * 60 * 1000,
            node_state_request_timeout_earliest_percentage: 80,
            node_state_request_timeout_latest_percentage: 95,
            max_slobrok_disconnect_grace_period_ms: 1000,
            min_time_before_first_system_state_broadcast_ms: 0,
            min_time_between_new_system_states_ms: 0,
            ideal_distribution_bits: fleetctl_core::DEFAULT_DISTRIBUTION_BITS,
            master_lease_ms: 10_000,
            master_cooldown_ms: 0,
            tick_interval_ms: 100,
            event_log_capacity: 1000,
        }
    }
}

impl FleetControllerConfig {
    /// A flat cluster of `count` nodes, indices `0..count`, with defaults for
    /// everything else.
    #[must_use]
    pub fn flat(cluster_name: impl Into<String>, count: u16) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            nodes: (0..count).map(ConfiguredNode::new).collect(),
            ..Self::default()
        }
    }

    /// Reads a JSON configuration file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    #[must_use]
    pub fn max_transition_time_ms(&self, node_type: NodeType) -> u64 {
        match node_type {
            NodeType::Storage => self.max_transition_time.storage_ms,
            NodeType::Distributor => self.max_transition_time.distributor_ms,
        }
    }

    /// Every configured node of both types, in wire order.
    pub fn node_identities(&self) -> impl Iterator<Item = NodeIdentity> + '_ {
        NodeType::ALL.into_iter().flat_map(move |node_type| {
            self.nodes
                .iter()
                .map(move |n| NodeIdentity::new(node_type, n.index))
        })
    }

    #[must_use]
    pub fn is_configured(&self, node: NodeIdentity) -> bool {
        self.nodes.iter().any(|n| n.index == node.index)
    }

    #[must_use]
    pub fn is_retired(&self, index: u16) -> bool {
        self.nodes.iter().any(|n| n.index == index && n.retired)
    }

    /// Lower and upper bound of the per-request timeout handed to nodes.
    #[must_use]
    pub fn request_timeout_bounds_ms(&self) -> (u64, u64) {
        let base = self.node_state_request_timeout_ms;
        let earliest = base * u64::from(self.node_state_request_timeout_earliest_percentage) / 100;
        let latest = base * u64::from(self.node_state_request_timeout_latest_percentage) / 100;
        (earliest.min(latest), earliest.max(latest))
    }
}
