//! State Change Handler: folds raw node reports into per-node bookkeeping.
//!
//! Reports never fail the pipeline. Each report updates the node's timers and
//! counters and yields events; the Cluster State Generator later turns the
//! bookkeeping into generated states.

use fleetctl_core::{Event, EventKind, NodeState, State};

use super::health::{ClusterHealthStore, NodeInfo, NOT_SEEN_IN_REGISTRY};
use super::types::{FleetControllerConfig, MaxTransitionTimes};

/// Result of checking a node against the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryCheck {
    pub events: Vec<Event>,
    /// The node has been missing longer than the grace period. Its pending
    /// request should be dropped and it should be reported as not seen.
    pub expired: bool,
}

/// Applies stability and hysteresis rules to incoming reports and timers.
#[derive(Debug, Clone)]
pub struct StateChangeHandler {
    stable_state_time_period_ms: u64,
    max_init_progress_time_ms: u64,
    max_slobrok_disconnect_grace_period_ms: u64,
    max_transition_time: MaxTransitionTimes,
}

impl StateChangeHandler {
    #[must_use]
    pub fn new(config: &FleetControllerConfig) -> Self {
        Self {
            stable_state_time_period_ms: config.stable_state_time_period_ms,
            max_init_progress_time_ms: config.max_init_progress_time_ms,
            max_slobrok_disconnect_grace_period_ms: config.max_slobrok_disconnect_grace_period_ms,
            max_transition_time: config.max_transition_time,
        }
    }

    fn max_transition_time_ms(&self, info: &NodeInfo) -> u64 {
        if info.node().is_storage() {
            self.max_transition_time.storage_ms
        } else {
            self.max_transition_time.distributor_ms
        }
    }

    /// Applies a new report for a node.
    ///
    /// `current` is the node's generated state in the consolidated cluster
    /// state, which decides whether the report is an edge out of an
    /// available state.
    pub fn handle_new_reported_state(
        &self,
        info: &mut NodeInfo,
        current: &NodeState,
        reported: NodeState,
        now_ms: u64,
    ) -> Vec<Event> {
        let node = info.node();
        let previous = info.reported.clone();
        let mut events = Vec::new();

        if !reported.similar_to(&previous) {
            let compact = reported.compact(node.node_type);
            let description = if reported.state == State::Down {
                format!("Failed to get node state: {compact}")
            } else {
                format!("Now reporting state {compact}")
            };
            events.push(Event::node(node, EventKind::Reported, description, now_ms));
        }

        let going_down = matches!(reported.state, State::Down | State::Stopping);
        let was_down = matches!(previous.state, State::Down | State::Stopping);
        if current.state.is_available() && going_down && !was_down {
            info.transition_time_ms = Some(now_ms);
            self.check_premature_crash(info, now_ms, &mut events);
        } else if previous.state == State::Up && reported.state == State::Initializing {
            // Restarted without ever being observed as down.
            self.check_premature_crash(info, now_ms, &mut events);
        }

        if previous.state == State::Initializing
            && reported.state == State::Initializing
            && reported.init_progress < previous.init_progress
        {
            events.push(Event::node(
                node,
                EventKind::Current,
                format!(
                    "Stop or crash during initialization detected from reverse initializing \
                     progress. Progress was {:?} but is now {:?}.",
                    previous.init_progress, reported.init_progress
                ),
                now_ms,
            ));
            info.unstable_during_init = true;
        }

        if reported.state == State::Initializing
            && (previous.state != State::Initializing
                || reported.init_progress.to_bits() != previous.init_progress.to_bits())
        {
            info.init_progress_time_ms = now_ms;
            info.init_timeout_reported = false;
        }

        if reported.state.is_available() {
            info.transition_time_ms = None;
            info.timed_out_without_contact_reported = false;
        }

        if reported.state == State::Up {
            if previous.state != State::Up {
                info.up_since_ms = Some(now_ms);
            }
            info.unstable_during_init = false;
            info.init_timeout_reported = false;
        } else {
            info.up_since_ms = None;
        }

        info.reported = reported;
        info.has_reported = true;
        events
    }

    fn check_premature_crash(&self, info: &mut NodeInfo, now_ms: u64, events: &mut Vec<Event>) {
        let Some(up_since) = info.up_since_ms else {
            return;
        };
        let elapsed = now_ms.saturating_sub(up_since);
        if elapsed >= self.stable_state_time_period_ms {
            return;
        }
        info.premature_crash_count += 1;
        tracing::info!(
            node = %info.node(),
            count = info.premature_crash_count,
            elapsed_ms = elapsed,
            "premature crash detected"
        );
        events.push(Event::node(
            info.node(),
            EventKind::Current,
            format!(
                "Stopped or possibly crashed after {elapsed} ms, which is before stable state \
                 time period. Premature crash count is now {}.",
                info.premature_crash_count
            ),
            now_ms,
        ));
    }

    /// Marks the node as not seen in the registry.
    pub fn handle_not_seen_in_registry(
        &self,
        info: &mut NodeInfo,
        current: &NodeState,
        now_ms: u64,
    ) -> Vec<Event> {
        let reported = info.reported_state();
        if reported.state == State::Down && reported.description == NOT_SEEN_IN_REGISTRY {
            return Vec::new();
        }
        let not_seen = NodeState::down().with_description(NOT_SEEN_IN_REGISTRY);
        self.handle_new_reported_state(info, current, not_seen, now_ms)
    }

    /// Updates registry presence for a node.
    pub fn check_registry(
        &self,
        info: &mut NodeInfo,
        registered: bool,
        has_pending_request: bool,
        now_ms: u64,
    ) -> RegistryCheck {
        let mut events = Vec::new();
        if registered {
            info.in_registry = true;
            info.last_seen_in_registry_ms = Some(now_ms);
            info.missing_with_pending_request_reported = false;
            return RegistryCheck {
                events,
                expired: false,
            };
        }

        info.in_registry = false;
        let Some(last_seen) = info.last_seen_in_registry_ms else {
            return RegistryCheck {
                events,
                expired: false,
            };
        };

        if has_pending_request && !info.missing_with_pending_request_reported {
            info.missing_with_pending_request_reported = true;
            events.push(Event::node(
                info.node(),
                EventKind::Reported,
                "Node is no longer in slobrok, but we still have a pending state request.",
                now_ms,
            ));
        }

        let expired =
            now_ms.saturating_sub(last_seen) > self.max_slobrok_disconnect_grace_period_ms;
        RegistryCheck { events, expired }
    }

    /// Time-driven transitions, evaluated against the consolidated cluster
    /// state.
    pub fn watch_timers(
        &self,
        health: &mut ClusterHealthStore,
        consolidated: &fleetctl_core::ClusterState,
        now_ms: u64,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        for info in health.iter_mut() {
            let node = info.node();
            let generated = consolidated.node_state(node);
            self.check_lost_contact(info, &generated, now_ms, &mut events);
            if node.is_storage() {
                self.check_init_stall(info, now_ms, &mut events);
            }

            if generated.state == State::Up && info.premature_crash_count > 0 {
                if let Some(up_since) = info.up_since_ms {
                    if up_since.saturating_add(self.stable_state_time_period_ms) <= now_ms {
                        tracing::debug!(node = %node, "stable for a full period, clearing premature crash count");
                        info.premature_crash_count = 0;
                    }
                }
            }
        }
        events
    }

    fn check_lost_contact(
        &self,
        info: &mut NodeInfo,
        generated: &NodeState,
        now_ms: u64,
        events: &mut Vec<Event>,
    ) {
        if !info.node().node_type.supports_maintenance()
            || info.timed_out_without_contact_reported
            || generated.state != State::Maintenance
            || info.wanted_state().state == State::Maintenance
            || !matches!(info.reported.state, State::Down | State::Stopping)
        {
            return;
        }
        let Some(transition_time) = info.transition_time_ms else {
            return;
        };
        if transition_time.saturating_add(self.max_transition_time_ms(info)) > now_ms {
            return;
        }
        info.timed_out_without_contact_reported = true;
        events.push(Event::node(
            info.node(),
            EventKind::Current,
            format!(
                "{} milliseconds without contact. Marking node down.",
                now_ms - transition_time
            ),
            now_ms,
        ));
    }

    fn check_init_stall(&self, info: &mut NodeInfo, now_ms: u64, events: &mut Vec<Event>) {
        if info.reported.state != State::Initializing
            || info.init_timeout_reported
            || info.init_progress_time_ms.saturating_add(self.max_init_progress_time_ms) > now_ms
        {
            return;
        }
        info.init_timeout_reported = true;
        info.unstable_during_init = true;
        info.premature_crash_count += 1;
        events.push(Event::node(
            info.node(),
            EventKind::Current,
            format!(
                "{} milliseconds without initialize progress. Marking node down. \
                 Premature crash count is now {}.",
                now_ms - info.init_progress_time_ms,
                info.premature_crash_count
            ),
            now_ms,
        ));
    }
}

#[cfg(test)]
mod tests {
    use fleetctl_core::{ClusterState, NodeIdentity};

    use super::*;

    fn config() -> FleetControllerConfig {
        let mut config = FleetControllerConfig::flat("test", 3);
        config.stable_state_time_period_ms = 1_000_000;
        config
    }

    fn descriptions(events: &[Event]) -> Vec<String> {
        events.iter().map(|e| e.description.clone()).collect()
    }

    fn up_node(handler: &StateChangeHandler, node: NodeIdentity, now: u64) -> NodeInfo {
        let mut info = NodeInfo::new(node, false);
        handler.handle_new_reported_state(&mut info, &NodeState::down(), NodeState::up(), now);
        info
    }

    #[test]
    fn first_report_is_logged() {
        let handler = StateChangeHandler::new(&config());
        let mut info = NodeInfo::new(NodeIdentity::storage(0), false);
        let events =
            handler.handle_new_reported_state(&mut info, &NodeState::down(), NodeState::up(), 10);
        assert_eq!(descriptions(&events), vec!["Now reporting state U"]);
        assert!(info.has_reported());
        assert_eq!(info.up_since_ms, Some(10));
    }

    #[test]
    fn similar_reports_are_not_logged() {
        let handler = StateChangeHandler::new(&config());
        let mut info = up_node(&handler, NodeIdentity::storage(0), 0);
        let events = handler.handle_new_reported_state(
            &mut info,
            &NodeState::up(),
            NodeState::up().with_description("still fine"),
            5,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn early_down_counts_as_premature_crash() {
        let handler = StateChangeHandler::new(&config());
        let mut info = up_node(&handler, NodeIdentity::storage(0), 0);
        let events = handler.handle_new_reported_state(
            &mut info,
            &NodeState::up(),
            NodeState::down().with_description("Closed at other end"),
            1000,
        );
        assert_eq!(
            descriptions(&events),
            vec![
                "Failed to get node state: D: Closed at other end",
                "Stopped or possibly crashed after 1000 ms, which is before stable state time \
                 period. Premature crash count is now 1.",
            ]
        );
        assert_eq!(info.premature_crash_count(), 1);
        assert_eq!(info.transition_time_ms(), Some(1000));
    }

    #[test]
    fn down_after_stable_period_is_not_a_crash() {
        let handler = StateChangeHandler::new(&config());
        let mut info = up_node(&handler, NodeIdentity::distributor(0), 0);
        let events = handler.handle_new_reported_state(
            &mut info,
            &NodeState::up(),
            NodeState::down().with_description("controlled shutdown"),
            1_000_000,
        );
        assert_eq!(
            descriptions(&events),
            vec!["Failed to get node state: D: controlled shutdown"]
        );
        assert_eq!(info.premature_crash_count(), 0);
    }

    #[test]
    fn down_report_when_already_generated_down_sets_no_transition_time() {
        let handler = StateChangeHandler::new(&config());
        let mut info = NodeInfo::new(NodeIdentity::storage(0), false);
        handler.handle_new_reported_state(
            &mut info,
            &NodeState::down(),
            NodeState::initializing(0.1),
            0,
        );
        handler.handle_new_reported_state(&mut info, &NodeState::down(), NodeState::down(), 10);
        assert_eq!(info.transition_time_ms(), None);
    }

    #[test]
    fn restart_into_init_counts_as_premature_crash() {
        let handler = StateChangeHandler::new(&config());
        let mut info = up_node(&handler, NodeIdentity::storage(0), 0);
        let events = handler.handle_new_reported_state(
            &mut info,
            &NodeState::up(),
            NodeState::initializing(0.0),
            50,
        );
        assert_eq!(events.len(), 2);
        assert_eq!(info.premature_crash_count(), 1);
    }

    #[test]
    fn reverse_init_progress_marks_unstable() {
        let handler = StateChangeHandler::new(&config());
        let mut info = NodeInfo::new(NodeIdentity::storage(6), false);
        let generated = NodeState::down();
        handler.handle_new_reported_state(&mut info, &generated, NodeState::initializing(0.3), 0);
        let events = handler.handle_new_reported_state(
            &mut info,
            &NodeState::initializing(0.3),
            NodeState::initializing(0.2),
            10,
        );
        assert_eq!(
            descriptions(&events),
            vec![
                "Stop or crash during initialization detected from reverse initializing \
                 progress. Progress was 0.3 but is now 0.2."
            ]
        );
        assert!(info.recently_observed_unstable_during_init());

        handler.handle_new_reported_state(&mut info, &generated, NodeState::up(), 20);
        assert!(!info.recently_observed_unstable_during_init());
    }

    #[test]
    fn init_progress_time_tracks_progress_changes() {
        let handler = StateChangeHandler::new(&config());
        let mut info = NodeInfo::new(NodeIdentity::storage(0), false);
        let down = NodeState::down();
        handler.handle_new_reported_state(&mut info, &down, NodeState::initializing(0.1), 100);
        assert_eq!(info.init_progress_time_ms(), 100);
        handler.handle_new_reported_state(&mut info, &down, NodeState::initializing(0.1), 200);
        assert_eq!(info.init_progress_time_ms(), 100);
        handler.handle_new_reported_state(&mut info, &down, NodeState::initializing(0.5), 300);
        assert_eq!(info.init_progress_time_ms(), 300);
    }

    #[test]
    fn lost_contact_fires_once_after_transition_window() {
        let handler = StateChangeHandler::new(&config());
        let mut health = ClusterHealthStore::from_config(&config());
        let node = NodeIdentity::storage(0);
        {
            let info = health.get_mut(node).unwrap();
            handler.handle_new_reported_state(info, &NodeState::down(), NodeState::up(), 0);
            handler.handle_new_reported_state(
                info,
                &NodeState::up(),
                NodeState::down().with_description("Closed at other end"),
                2_000_000,
            );
        }
        let consolidated: ClusterState = "distributor:3 storage:3 .0.s:m".parse().unwrap();

        assert!(handler.watch_timers(&mut health, &consolidated, 2_004_000).is_empty());
        let events = handler.watch_timers(&mut health, &consolidated, 2_005_001);
        assert_eq!(
            descriptions(&events),
            vec!["5001 milliseconds without contact. Marking node down."]
        );
        assert!(handler.watch_timers(&mut health, &consolidated, 2_006_000).is_empty());
    }

    #[test]
    fn unbounded_periods_never_fire() {
        let mut config = config();
        config.stable_state_time_period_ms = u64::MAX;
        config.max_init_progress_time_ms = u64::MAX;
        config.max_transition_time.storage_ms = u64::MAX;
        let handler = StateChangeHandler::new(&config);
        let mut health = ClusterHealthStore::from_config(&config);
        let lost = NodeIdentity::storage(0);
        let initializing = NodeIdentity::storage(1);
        {
            let info = health.get_mut(lost).unwrap();
            handler.handle_new_reported_state(info, &NodeState::down(), NodeState::up(), 0);
            handler.handle_new_reported_state(info, &NodeState::up(), NodeState::down(), 1000);
        }
        handler.handle_new_reported_state(
            health.get_mut(initializing).unwrap(),
            &NodeState::down(),
            NodeState::initializing(0.1),
            1000,
        );
        let consolidated: ClusterState =
            "distributor:3 storage:3 .0.s:m .1.s:i .1.i:0.1".parse().unwrap();

        assert!(handler
            .watch_timers(&mut health, &consolidated, u64::MAX - 1)
            .is_empty());
        assert_eq!(health.get(lost).unwrap().premature_crash_count(), 1);
    }

    #[test]
    fn init_stall_marks_node_unstable() {
        let handler = StateChangeHandler::new(&config());
        let mut health = ClusterHealthStore::from_config(&config());
        let node = NodeIdentity::storage(1);
        handler.handle_new_reported_state(
            health.get_mut(node).unwrap(),
            &NodeState::down(),
            NodeState::initializing(0.1),
            1000,
        );
        let consolidated: ClusterState =
            "distributor:3 storage:3 .1.s:i .1.i:0.1".parse().unwrap();

        assert!(handler.watch_timers(&mut health, &consolidated, 5999).is_empty());
        let events = handler.watch_timers(&mut health, &consolidated, 6001);
        assert_eq!(
            descriptions(&events),
            vec![
                "5001 milliseconds without initialize progress. Marking node down. Premature \
                 crash count is now 1."
            ]
        );
        let info = health.get(node).unwrap();
        assert!(info.recently_observed_unstable_during_init());
        assert_eq!(info.premature_crash_count(), 1);
        assert!(handler.watch_timers(&mut health, &consolidated, 7000).is_empty());
    }

    #[test]
    fn crash_count_resets_after_stable_up_period() {
        let handler = StateChangeHandler::new(&config());
        let mut health = ClusterHealthStore::from_config(&config());
        let node = NodeIdentity::distributor(2);
        {
            let info = health.get_mut(node).unwrap();
            handler.handle_new_reported_state(info, &NodeState::down(), NodeState::up(), 0);
            handler.handle_new_reported_state(info, &NodeState::up(), NodeState::down(), 10);
            handler.handle_new_reported_state(info, &NodeState::down(), NodeState::up(), 20);
            assert_eq!(info.premature_crash_count(), 1);
        }
        let consolidated: ClusterState = "distributor:3 storage:3".parse().unwrap();
        handler.watch_timers(&mut health, &consolidated, 500_000);
        assert_eq!(health.get(node).unwrap().premature_crash_count(), 1);
        handler.watch_timers(&mut health, &consolidated, 1_000_020);
        assert_eq!(health.get(node).unwrap().premature_crash_count(), 0);
    }

    #[test]
    fn registry_disappearance_with_pending_request() {
        let mut config = config();
        config.max_slobrok_disconnect_grace_period_ms = 1000;
        let handler = StateChangeHandler::new(&config);
        let mut info = up_node(&handler, NodeIdentity::storage(0), 0);

        let seen = handler.check_registry(&mut info, true, true, 0);
        assert!(seen.events.is_empty());

        let missing = handler.check_registry(&mut info, false, true, 100);
        assert_eq!(
            descriptions(&missing.events),
            vec!["Node is no longer in slobrok, but we still have a pending state request."]
        );
        assert!(!missing.expired);

        let again = handler.check_registry(&mut info, false, true, 500);
        assert!(again.events.is_empty());

        let expired = handler.check_registry(&mut info, false, true, 1001);
        assert!(expired.expired);

        let events = handler.handle_not_seen_in_registry(&mut info, &NodeState::down(), 1001);
        assert_eq!(
            descriptions(&events),
            vec!["Failed to get node state: D: Node not seen in slobrok."]
        );
        assert!(handler
            .handle_not_seen_in_registry(&mut info, &NodeState::down(), 1002)
            .is_empty());
    }

    #[test]
    fn never_registered_node_never_expires() {
        let handler = StateChangeHandler::new(&config());
        let mut info = NodeInfo::new(NodeIdentity::storage(0), false);
        let check = handler.check_registry(&mut info, false, false, 10_000_000);
        assert!(!check.expired);
        assert!(check.events.is_empty());
    }
}
