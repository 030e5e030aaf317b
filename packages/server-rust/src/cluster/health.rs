//! Node Health Tracker: everything the controller knows about each node.

use std::collections::BTreeMap;

use fleetctl_core::{NodeIdentity, NodeState, State};

use super::types::FleetControllerConfig;

/// Description of a node that has not (or no longer) been seen in the
/// registry.
pub const NOT_SEEN_IN_REGISTRY: &str = "Node not seen in slobrok.";

/// Per-node reports, wanted states and timers.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    node: NodeIdentity,
    configured_retired: bool,
    /// Operator wanted state. Plain Up unless an operator set something else.
    pub(crate) operator_wanted: NodeState,
    pub(crate) reported: NodeState,
    pub(crate) has_reported: bool,
    pub(crate) in_registry: bool,
    pub(crate) last_seen_in_registry_ms: Option<u64>,
    pub(crate) missing_with_pending_request_reported: bool,
    /// Time of the last edge into a reported Up.
    pub(crate) up_since_ms: Option<u64>,
    /// Time of the last edge out of an available generated state.
    pub(crate) transition_time_ms: Option<u64>,
    pub(crate) init_progress_time_ms: u64,
    /// Latest start timestamp every node has seen in a published state.
    pub(crate) observed_start_timestamp: u64,
    pub(crate) premature_crash_count: u32,
    pub(crate) unstable_during_init: bool,
    pub(crate) timed_out_without_contact_reported: bool,
    pub(crate) init_timeout_reported: bool,
}

impl NodeInfo {
    #[must_use]
    pub fn new(node: NodeIdentity, configured_retired: bool) -> Self {
        Self {
            node,
            configured_retired,
            operator_wanted: NodeState::up(),
            reported: NodeState::down().with_description(NOT_SEEN_IN_REGISTRY),
            has_reported: false,
            in_registry: false,
            last_seen_in_registry_ms: None,
            missing_with_pending_request_reported: false,
            up_since_ms: None,
            transition_time_ms: None,
            init_progress_time_ms: 0,
            observed_start_timestamp: 0,
            premature_crash_count: 0,
            unstable_during_init: false,
            timed_out_without_contact_reported: false,
            init_timeout_reported: false,
        }
    }

    #[must_use]
    pub fn node(&self) -> NodeIdentity {
        self.node
    }

    #[must_use]
    pub fn reported_state(&self) -> &NodeState {
        &self.reported
    }

    /// Whether the node has answered at least one state request.
    #[must_use]
    pub fn has_reported(&self) -> bool {
        self.has_reported
    }

    /// The operator wanted state, or Retired for an Up node configured as
    /// retired.
    #[must_use]
    pub fn wanted_state(&self) -> NodeState {
        if self.operator_wanted.state == State::Up && self.configured_retired {
            return NodeState::new(State::Retired);
        }
        self.operator_wanted.clone()
    }

    #[must_use]
    pub fn operator_wanted_state(&self) -> &NodeState {
        &self.operator_wanted
    }

    #[must_use]
    pub fn premature_crash_count(&self) -> u32 {
        self.premature_crash_count
    }

    #[must_use]
    pub fn transition_time_ms(&self) -> Option<u64> {
        self.transition_time_ms
    }

    #[must_use]
    pub fn init_progress_time_ms(&self) -> u64 {
        self.init_progress_time_ms
    }

    #[must_use]
    pub fn observed_start_timestamp(&self) -> u64 {
        self.observed_start_timestamp
    }

    #[must_use]
    pub fn recently_observed_unstable_during_init(&self) -> bool {
        self.unstable_during_init
    }

    #[must_use]
    pub fn in_registry(&self) -> bool {
        self.in_registry
    }

    /// Crashed prematurely more often than `max_premature_crashes` allows.
    #[must_use]
    pub fn is_too_unstable(&self, max_premature_crashes: u32) -> bool {
        max_premature_crashes != 0 && self.premature_crash_count > max_premature_crashes
    }
}

/// All tracked nodes, keyed by identity.
///
/// Owned by the Fleet Controller and handed by reference to the State Change
/// Handler and the Cluster State Generator.
#[derive(Debug, Clone, Default)]
pub struct ClusterHealthStore {
    nodes: BTreeMap<NodeIdentity, NodeInfo>,
}

impl ClusterHealthStore {
    /// One entry per configured node of each type.
    #[must_use]
    pub fn from_config(config: &FleetControllerConfig) -> Self {
        let nodes = config
            .node_identities()
            .map(|node| (node, NodeInfo::new(node, config.is_retired(node.index))))
            .collect();
        Self { nodes }
    }

    #[must_use]
    pub fn get(&self, node: NodeIdentity) -> Option<&NodeInfo> {
        self.nodes.get(&node)
    }

    pub fn get_mut(&mut self, node: NodeIdentity) -> Option<&mut NodeInfo> {
        self.nodes.get_mut(&node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeInfo> {
        self.nodes.values_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn all_reported(&self) -> bool {
        self.nodes.values().all(NodeInfo::has_reported)
    }

    /// Operator wanted states that differ from plain Up, for persistence.
    #[must_use]
    pub fn wanted_states(&self) -> Vec<(NodeIdentity, NodeState)> {
        self.nodes
            .values()
            .filter(|info| !info.operator_wanted.is_default_up())
            .map(|info| (info.node, info.operator_wanted.clone()))
            .collect()
    }

    /// Replaces all operator wanted states. Unknown nodes are skipped.
    pub fn apply_wanted_states(&mut self, states: &[(NodeIdentity, NodeState)]) {
        for info in self.nodes.values_mut() {
            info.operator_wanted = NodeState::up();
        }
        for (node, state) in states {
            if let Some(info) = self.nodes.get_mut(node) {
                info.operator_wanted = state.clone();
            } else {
                tracing::warn!(node = %node, "ignoring stored wanted state for unknown node");
            }
        }
    }

    /// Non-zero premature crash counts, for persistence.
    #[must_use]
    pub fn crash_counts(&self) -> Vec<(NodeIdentity, u32)> {
        self.nodes
            .values()
            .filter(|info| info.premature_crash_count > 0)
            .map(|info| (info.node, info.premature_crash_count))
            .collect()
    }

    /// Replaces all premature crash counts. Unknown nodes are skipped.
    pub fn apply_crash_counts(&mut self, counts: &[(NodeIdentity, u32)]) {
        for info in self.nodes.values_mut() {
            info.premature_crash_count = 0;
        }
        for (node, count) in counts {
            if let Some(info) = self.nodes.get_mut(node) {
                info.premature_crash_count = *count;
            }
        }
    }
}
