//! Cluster State Generator: derives a complete cluster state from the Node
//! Health Tracker.
//!
//! Generation is a pure function of the tracked nodes, the configuration, the
//! current time and the published distribution bit count. It never assigns a
//! version; that is left to the version tracker.

use fleetctl_core::{
    AnnotatedClusterState, ClusterState, ClusterStateReason, NodeIdentity, NodeState,
    NodeStateReason, NodeType, State, DEFAULT_DISTRIBUTION_BITS,
};

use super::health::{ClusterHealthStore, NodeInfo};
use super::types::{FleetControllerConfig, GroupConfig};

const GROUP_DOWN_DESCRIPTION: &str = "group node availability below configured threshold";

/// Aggregates per-node information into an [`AnnotatedClusterState`].
#[derive(Debug, Clone)]
pub struct ClusterStateGenerator {
    config: FleetControllerConfig,
}

impl ClusterStateGenerator {
    #[must_use]
    pub fn new(config: FleetControllerConfig) -> Self {
        Self { config }
    }

    /// Generates the candidate cluster state.
    ///
    /// `published_bits` is the distribution bit count of the currently
    /// published state, used to hold back bit count increases.
    #[must_use]
    pub fn generate(
        &self,
        health: &ClusterHealthStore,
        now_ms: u64,
        published_bits: u32,
    ) -> AnnotatedClusterState {
        let mut annotated = AnnotatedClusterState::new(ClusterState::empty());
        for info in health.iter() {
            let (state, reason) = self.effective_node_state(info, now_ms);
            annotated.state.set_node_state(info.node(), state);
            if let Some(reason) = reason {
                annotated.node_reasons.insert(info.node(), reason);
            }
        }
        self.take_down_groups_with_too_low_availability(&mut annotated);

        let reason = self.cluster_down_reason(&annotated.state);
        if reason.is_some() {
            annotated.state.set_cluster_state(State::Down);
        }
        annotated.cluster_reason = reason;

        let bits = self.infer_distribution_bits(health, &annotated.state, published_bits);
        annotated.state.set_distribution_bits(bits);
        annotated
    }

    fn effective_node_state(
        &self,
        info: &NodeInfo,
        now_ms: u64,
    ) -> (NodeState, Option<NodeStateReason>) {
        let reported = info.reported_state();
        let wanted = info.wanted_state();
        let mut baseline = reported.clone();
        baseline.min_used_bits = DEFAULT_DISTRIBUTION_BITS;
        if reported.start_timestamp <= info.observed_start_timestamp() {
            baseline.start_timestamp = 0;
        }
        let mut reason = None;

        if info.is_too_unstable(self.config.max_premature_crashes) {
            baseline.state = State::Down;
            reason = Some(NodeStateReason::NodeTooUnstable);
        } else if info.node().is_storage() && reported.is_listing_buckets() {
            baseline.state = State::Down;
        }
        if info.node().is_storage()
            && self.apply_storage_transforms(info, reported, &wanted, &mut baseline, now_ms)
        {
            reason = reason.or(Some(NodeStateReason::NodeInitStalled));
        }
        if reported.state.above(wanted.state) {
            baseline.state = wanted.state;
            baseline.description.clone_from(&wanted.description);
        }
        if baseline.state != State::Initializing {
            baseline.init_progress = 0.0;
        }
        if baseline.state != State::Down {
            reason = None;
        }
        (baseline, reason)
    }

    /// Returns `true` if the node was taken down for stalling during
    /// initialization.
    fn apply_storage_transforms(
        &self,
        info: &NodeInfo,
        reported: &NodeState,
        wanted: &NodeState,
        baseline: &mut NodeState,
        now_ms: u64,
    ) -> bool {
        let mut init_stalled = false;
        if reported.state == State::Initializing {
            let timed_out = info
                .init_progress_time_ms()
                .saturating_add(self.config.max_init_progress_time_ms)
                <= now_ms;
            if timed_out || info.recently_observed_unstable_during_init() {
                baseline.state = State::Down;
                init_stalled = true;
            }
            // A retired node published as Initializing would start receiving
            // feed, so it is kept in maintenance until it is done.
            if wanted.state == State::Retired {
                baseline.state = State::Maintenance;
            }
        }
        if self.within_temporal_maintenance_period(info, baseline, now_ms)
            && wanted.state != State::Down
        {
            baseline.state = State::Maintenance;
        }
        init_stalled
    }

    /// A storage node that just lost contact is kept in maintenance for the
    /// configured transition time before it is taken down.
    fn within_temporal_maintenance_period(
        &self,
        info: &NodeInfo,
        baseline: &NodeState,
        now_ms: u64,
    ) -> bool {
        let transition_time_ms = self.config.max_transition_time_ms(info.node().node_type);
        if transition_time_ms == 0 || !matches!(baseline.state, State::Down | State::Stopping) {
            return false;
        }
        info.transition_time_ms()
            .is_some_and(|t| t.saturating_add(transition_time_ms) > now_ms)
    }

    fn take_down_groups_with_too_low_availability(&self, annotated: &mut AnnotatedClusterState) {
        let min_ratio = self.config.min_node_ratio_per_group;
        if self.config.groups.len() <= 1 || min_ratio <= 0.0 {
            return;
        }
        let mut to_take_down = Vec::new();
        for group in &self.config.groups {
            if group_availability(group, &annotated.state) < min_ratio {
                to_take_down.extend(group.nodes.iter().copied().filter(|&index| {
                    annotated
                        .state
                        .node_state(NodeIdentity::storage(index))
                        .state
                        .is_available()
                }));
            }
        }
        for index in to_take_down {
            let node = NodeIdentity::storage(index);
            annotated.state.set_node_state(
                node,
                NodeState::down().with_description(GROUP_DOWN_DESCRIPTION),
            );
            annotated
                .node_reasons
                .insert(node, NodeStateReason::GroupIsDown);
        }
    }

    fn count_available(&self, node_type: NodeType, state: &ClusterState) -> usize {
        self.config
            .nodes
            .iter()
            .filter(|n| {
                state
                    .node_state(NodeIdentity::new(node_type, n.index))
                    .state
                    .is_available()
            })
            .count()
    }

    #[allow(clippy::cast_precision_loss)]
    fn cluster_down_reason(&self, state: &ClusterState) -> Option<ClusterStateReason> {
        let up_storage = self.count_available(NodeType::Storage, state);
        let up_distributors = self.count_available(NodeType::Distributor, state);
        // Every configured index hosts one node of each type.
        let node_count = self.config.nodes.len() as f64;

        if up_storage < usize::from(self.config.min_storage_nodes_up) {
            return Some(ClusterStateReason::TooFewStorageNodesAvailable);
        }
        if up_distributors < usize::from(self.config.min_distributor_nodes_up) {
            return Some(ClusterStateReason::TooFewDistributorNodesAvailable);
        }
        if self.config.min_ratio_of_storage_nodes_up * node_count > up_storage as f64 {
            return Some(ClusterStateReason::TooLowAvailableStorageNodeRatio);
        }
        if self.config.min_ratio_of_distributor_nodes_up * node_count > up_distributors as f64 {
            return Some(ClusterStateReason::TooLowAvailableDistributorNodeRatio);
        }
        None
    }

    /// Lowers the bit count immediately to the smallest count any available
    /// storage node uses, but only raises it again once it is back at the
    /// ideal.
    fn infer_distribution_bits(
        &self,
        health: &ClusterHealthStore,
        state: &ClusterState,
        published_bits: u32,
    ) -> u32 {
        let ideal = self.config.ideal_distribution_bits;
        let mut bits = ideal;
        let min_used = self
            .config
            .nodes
            .iter()
            .map(|n| NodeIdentity::storage(n.index))
            .filter(|&node| state.node_state(node).state.is_available())
            .filter_map(|node| health.get(node))
            .map(|info| info.reported_state().min_used_bits)
            .min();
        if let Some(min_used) = min_used {
            bits = bits.min(min_used);
        }
        if bits > published_bits && bits < ideal {
            bits = published_bits;
        }
        bits
    }
}

#[allow(clippy::cast_precision_loss)]
fn group_availability(group: &GroupConfig, state: &ClusterState) -> f64 {
    if group.nodes.is_empty() {
        return 1.0;
    }
    let available = group
        .nodes
        .iter()
        .filter(|&&index| state.node_state(NodeIdentity::storage(index)).state.is_available())
        .count();
    available as f64 / group.nodes.len() as f64
}
