//! Controller gauges and histograms, published through the `metrics` facade.
//!
//! No recorder is installed here; without one every call is a no-op.

use std::time::Duration;

use fleetctl_core::{ClusterState, NodeType, State};
use metrics::{gauge, histogram};

const STATES: [State; 6] = [
    State::Up,
    State::Down,
    State::Maintenance,
    State::Retired,
    State::Initializing,
    State::Stopping,
];

/// Publishes a snapshot of controller state after every tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricUpdater;

impl MetricUpdater {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Per-type node counts by state, cluster availability, version and
    /// distribution bits of `state`.
    #[allow(clippy::cast_precision_loss)]
    pub fn update_cluster_state(&self, state: &ClusterState) {
        for node_type in NodeType::ALL {
            let mut counts = [0usize; STATES.len()];
            for (node, ns) in state.nodes() {
                if node.node_type == node_type {
                    if let Some(slot) = STATES.iter().position(|s| *s == ns.state) {
                        counts[slot] += 1;
                    }
                }
            }
            for (s, count) in STATES.iter().zip(counts) {
                gauge!(
                    "fleetctl_nodes",
                    "type" => node_type.name(),
                    "state" => state_label(*s)
                )
                .set(count as f64);
            }
        }
        gauge!("fleetctl_cluster_up").set(if state.is_up() { 1.0 } else { 0.0 });
        gauge!("fleetctl_cluster_state_version").set(f64::from(state.version()));
        gauge!("fleetctl_distribution_bits").set(f64::from(state.distribution_bits()));
    }

    pub fn update_master(&self, is_master: bool) {
        gauge!("fleetctl_is_master").set(if is_master { 1.0 } else { 0.0 });
    }

    pub fn record_tick(&self, elapsed: Duration) {
        histogram!("fleetctl_tick_duration_seconds").record(elapsed.as_secs_f64());
    }
}

fn state_label(state: State) -> &'static str {
    match state {
        State::Up => "up",
        State::Down => "down",
        State::Maintenance => "maintenance",
        State::Retired => "retired",
        State::Initializing => "initializing",
        State::Stopping => "stopping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_without_recorder_are_noops() {
        let updater = MetricUpdater::new();
        let state: ClusterState = "version:3 bits:14 distributor:2 storage:3 .1.s:m"
            .parse()
            .unwrap();
        updater.update_cluster_state(&state);
        updater.update_master(true);
        updater.record_tick(Duration::from_millis(3));
    }

    #[test]
    fn every_state_has_a_label() {
        let labels: std::collections::HashSet<_> = STATES.iter().map(|s| state_label(*s)).collect();
        assert_eq!(labels.len(), STATES.len());
    }
}
