//! Event Diff Calculator: turns two annotated cluster states into events.

use crate::annotated::{AnnotatedClusterState, NodeStateReason};
use crate::event::{Event, EventKind};
use crate::node::{NodeIdentity, NodeType, State};

/// Computes the ordered events describing the change from `before` to
/// `after`.
///
/// Node events come first, distributors before storage nodes and by
/// ascending index, followed by at most one cluster event. Every event
/// carries `time_ms`. Identical inputs yield no events.
///
/// ```
/// use fleetctl_core::{compute_event_diff, AnnotatedClusterState};
///
/// let before = AnnotatedClusterState::new("distributor:3 storage:3".parse().unwrap());
/// let after = AnnotatedClusterState::new("distributor:3 storage:3 .0.s:d".parse().unwrap());
/// let events = compute_event_diff(&before, &after, 1000);
/// assert_eq!(events.len(), 1);
/// assert_eq!(
///     events[0].to_string(),
///     "Event: storage.0: Altered node state in cluster state from 'U' to 'D'"
/// );
/// ```
#[must_use]
pub fn compute_event_diff(
    before: &AnnotatedClusterState,
    after: &AnnotatedClusterState,
    time_ms: u64,
) -> Vec<Event> {
    let mut events = Vec::new();

    for node_type in NodeType::ALL {
        let count = before
            .state
            .node_count(node_type)
            .max(after.state.node_count(node_type));
        for index in 0..count {
            let node = NodeIdentity::new(node_type, index);
            emit_node_events(before, after, node, time_ms, &mut events);
        }
    }

    emit_cluster_event(before, after, time_ms, &mut events);
    events
}

fn emit_node_events(
    before: &AnnotatedClusterState,
    after: &AnnotatedClusterState,
    node: NodeIdentity,
    time_ms: u64,
    events: &mut Vec<Event>,
) {
    let old_state = before.state.node_state(node);
    let new_state = after.state.node_state(node);
    if !old_state.wire_eq(&new_state) {
        events.push(Event::node(
            node,
            EventKind::Current,
            format!(
                "Altered node state in cluster state from '{}' to '{}'",
                old_state.wire_compact(node.node_type),
                new_state.wire_compact(node.node_type)
            ),
            time_ms,
        ));
    }

    let old_reason = before.node_reason(node);
    let new_reason = after.node_reason(node);
    if old_reason == new_reason {
        return;
    }
    if new_reason == Some(NodeStateReason::GroupIsDown) {
        events.push(Event::node(
            node,
            EventKind::Current,
            "Group node availability is below configured threshold",
            time_ms,
        ));
    } else if old_reason == Some(NodeStateReason::GroupIsDown) {
        events.push(Event::node(
            node,
            EventKind::Current,
            "Group node availability has been restored",
            time_ms,
        ));
    }
}

fn emit_cluster_event(
    before: &AnnotatedClusterState,
    after: &AnnotatedClusterState,
    time_ms: u64,
    events: &mut Vec<Event>,
) {
    let was_up = before.state.cluster_state() == State::Up;
    let is_up = after.state.cluster_state() == State::Up;
    if was_up == is_up {
        return;
    }
    let description = if is_up {
        "Enough nodes available for system to become up"
    } else {
        after
            .cluster_reason
            .map_or("Cluster is down", |reason| reason.description())
    };
    events.push(Event::cluster(EventKind::SystemState, description, time_ms));
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::annotated::ClusterStateReason;
    use crate::event::EventScope;

    fn state(text: &str) -> AnnotatedClusterState {
        AnnotatedClusterState::new(text.parse().unwrap())
    }

    fn descriptions(events: &[Event]) -> Vec<String> {
        events.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn single_node_edge_emits_single_event() {
        let events = compute_event_diff(
            &state("distributor:3 storage:3"),
            &state("distributor:3 storage:3 .0.s:d"),
            123,
        );
        assert_eq!(
            descriptions(&events),
            vec!["Event: storage.0: Altered node state in cluster state from 'U' to 'D'"]
        );
        assert_eq!(events[0].timestamp_ms, 123);
        assert_eq!(events[0].kind, EventKind::Current);
    }

    #[test]
    fn distributor_edge_is_reported_against_distributor() {
        let events = compute_event_diff(
            &state("distributor:3 storage:3"),
            &state("distributor:3 .1.s:d storage:3"),
            0,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].scope, EventScope::Node(NodeIdentity::distributor(1)));
    }

    #[test]
    fn multiple_edges_are_ordered_by_type_then_index() {
        let events = compute_event_diff(
            &state("distributor:3 .2.s:d storage:3"),
            &state("distributor:3 .0.s:d storage:3 .0.s:r .1.s:d"),
            0,
        );
        assert_eq!(
            descriptions(&events),
            vec![
                "Event: distributor.0: Altered node state in cluster state from 'U' to 'D'",
                "Event: distributor.2: Altered node state in cluster state from 'D' to 'U'",
                "Event: storage.0: Altered node state in cluster state from 'U' to 'R'",
                "Event: storage.1: Altered node state in cluster state from 'U' to 'D'",
            ]
        );
    }

    #[test]
    fn nodes_beyond_count_are_compared_as_down() {
        let events = compute_event_diff(
            &state("distributor:3 storage:2"),
            &state("distributor:3 storage:3"),
            0,
        );
        assert_eq!(
            descriptions(&events),
            vec!["Event: storage.2: Altered node state in cluster state from 'D' to 'U'"]
        );
    }

    #[test]
    fn init_progress_is_shown_in_compact_form() {
        let events = compute_event_diff(
            &state("distributor:3 storage:3 .1.s:i .1.i:0.1"),
            &state("distributor:3 storage:3 .1.s:i .1.i:0.6"),
            0,
        );
        assert_eq!(
            descriptions(&events),
            vec![
                "Event: storage.1: Altered node state in cluster state from \
                 'I, i 0.100 (read)' to 'I, i 0.600 (read)'"
            ]
        );
    }

    #[test]
    fn node_down_edge_with_group_down_reason_has_separate_event() {
        let after = state("distributor:3 storage:3 .1.s:d")
            .with_node_reason(NodeIdentity::storage(1), NodeStateReason::GroupIsDown);
        let events = compute_event_diff(&state("distributor:3 storage:3"), &after, 0);
        assert_eq!(
            descriptions(&events),
            vec![
                "Event: storage.1: Altered node state in cluster state from 'U' to 'D'",
                "Event: storage.1: Group node availability is below configured threshold",
            ]
        );
    }

    #[test]
    fn group_down_to_group_down_does_not_emit_new_event() {
        let before = state("distributor:3 storage:3 .1.s:d")
            .with_node_reason(NodeIdentity::storage(1), NodeStateReason::GroupIsDown);
        let after = state("distributor:3 storage:3 .1.s:m")
            .with_node_reason(NodeIdentity::storage(1), NodeStateReason::GroupIsDown);
        let events = compute_event_diff(&before, &after, 0);
        assert_eq!(
            descriptions(&events),
            vec!["Event: storage.1: Altered node state in cluster state from 'D' to 'M'"]
        );
    }

    #[test]
    fn group_down_to_clear_reason_emits_group_up_event() {
        let before = state("distributor:3 storage:3 .2.s:d")
            .with_node_reason(NodeIdentity::storage(2), NodeStateReason::GroupIsDown);
        let events = compute_event_diff(&before, &state("distributor:3 storage:3"), 0);
        assert_eq!(
            descriptions(&events),
            vec![
                "Event: storage.2: Altered node state in cluster state from 'D' to 'U'",
                "Event: storage.2: Group node availability has been restored",
            ]
        );
    }

    #[test]
    fn clearing_group_reason_with_unchanged_state_emits_only_restored() {
        let before = state("distributor:3 storage:3 .2.s:d")
            .with_node_reason(NodeIdentity::storage(2), NodeStateReason::GroupIsDown);
        let events = compute_event_diff(&before, &state("distributor:3 storage:3 .2.s:d"), 0);
        assert_eq!(
            descriptions(&events),
            vec!["Event: storage.2: Group node availability has been restored"]
        );
    }

    #[test]
    fn cluster_up_edge_emits_event() {
        let events = compute_event_diff(
            &state("cluster:d distributor:3 storage:3"),
            &state("distributor:3 storage:3"),
            0,
        );
        assert_eq!(
            descriptions(&events),
            vec!["Event: Enough nodes available for system to become up"]
        );
        assert_eq!(events[0].kind, EventKind::SystemState);
    }

    #[test]
    fn cluster_down_without_reason_emits_generic_event() {
        let events = compute_event_diff(
            &state("distributor:3 storage:3"),
            &state("cluster:d distributor:3 storage:3"),
            0,
        );
        assert_eq!(descriptions(&events), vec!["Event: Cluster is down"]);
    }

    #[test]
    fn cluster_down_to_down_emits_no_cluster_event() {
        let before = state("cluster:d distributor:3 storage:3")
            .with_cluster_reason(ClusterStateReason::TooFewStorageNodesAvailable);
        let after = state("cluster:d distributor:3 storage:3")
            .with_cluster_reason(ClusterStateReason::TooLowAvailableDistributorNodeRatio);
        assert!(compute_event_diff(&before, &after, 0).is_empty());
    }

    #[test]
    fn cluster_down_reasons_emit_their_descriptions() {
        for (reason, text) in [
            (
                ClusterStateReason::TooFewStorageNodesAvailable,
                "Too few storage nodes available in cluster. Setting cluster state down",
            ),
            (
                ClusterStateReason::TooFewDistributorNodesAvailable,
                "Too few distributor nodes available in cluster. Setting cluster state down",
            ),
            (
                ClusterStateReason::TooLowAvailableStorageNodeRatio,
                "Too low ratio of available storage nodes. Setting cluster state down",
            ),
            (
                ClusterStateReason::TooLowAvailableDistributorNodeRatio,
                "Too low ratio of available distributor nodes. Setting cluster state down",
            ),
        ] {
            let after = state("cluster:d distributor:3 storage:3").with_cluster_reason(reason);
            let events = compute_event_diff(&state("distributor:3 storage:3"), &after, 0);
            assert_eq!(descriptions(&events), vec![format!("Event: {text}")]);
        }
    }

    #[test]
    fn node_events_precede_cluster_event() {
        let after = state("cluster:d distributor:3 storage:3 .0.s:d")
            .with_cluster_reason(ClusterStateReason::TooFewStorageNodesAvailable);
        let events = compute_event_diff(&state("distributor:3 storage:3"), &after, 0);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].scope, EventScope::Node(NodeIdentity::storage(0)));
        assert_eq!(events[1].scope, EventScope::Cluster);
    }

    #[test]
    fn version_change_alone_emits_nothing() {
        let events = compute_event_diff(
            &state("version:3 distributor:3 storage:3"),
            &state("version:4 distributor:3 storage:3"),
            0,
        );
        assert!(events.is_empty());
    }

    proptest! {
        #[test]
        fn diff_of_state_with_itself_is_empty(
            down in any::<bool>(),
            downs in proptest::collection::vec((any::<bool>(), 0u16..8), 0..8),
            group_down in proptest::option::of(0u16..8),
        ) {
            let mut annotated = state("distributor:8 storage:8");
            if down {
                annotated.state.set_cluster_state(State::Down);
                annotated.cluster_reason = Some(ClusterStateReason::TooFewStorageNodesAvailable);
            }
            for (is_storage, index) in downs {
                let node_type = if is_storage { NodeType::Storage } else { NodeType::Distributor };
                annotated.state.set_node_state(
                    NodeIdentity::new(node_type, index),
                    crate::node::NodeState::down().with_description("gone"),
                );
            }
            if let Some(index) = group_down {
                annotated
                    .node_reasons
                    .insert(NodeIdentity::storage(index), NodeStateReason::GroupIsDown);
            }
            prop_assert!(compute_event_diff(&annotated, &annotated.clone(), 7).is_empty());
        }
    }
}
