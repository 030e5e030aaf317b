//! Fleet Controller: the tick-driven orchestrator.
//!
//! One tick runs, in order: master election, ingestion of node replies and
//! broadcast acknowledgements, registry sync and request dispatch, timers,
//! candidate generation and publishing, broadcasting, and finally the
//! snapshot and metrics refresh. Ticks never fail; errors end up as events,
//! log lines or a demotion to follower.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use fleetctl_core::{
    ClockSource, ClusterState, Event, EventKind, NodeIdentity, NodeState, NodeType, State,
};

use super::broadcaster::SystemStateBroadcaster;
use super::election::{ElectionOutcome, ElectionState, MasterElectionHandler};
use super::event_log::EventLog;
use super::gatherer::NodeStateGatherer;
use super::generator::ClusterStateGenerator;
use super::health::{ClusterHealthStore, NodeInfo};
use super::metrics::MetricUpdater;
use super::state_change::StateChangeHandler;
use super::traits::{CoordinationStore, NodeCommunicator, StoreError};
use super::types::FleetControllerConfig;
use super::version_tracker::StateVersionTracker;

/// Rejected operator request.
#[derive(Debug, thiserror::Error)]
pub enum WantedStateError {
    #[error("node {0} is not configured")]
    UnknownNode(NodeIdentity),
    #[error("{0} is not a valid wanted state")]
    InvalidState(State),
    #[error("{0} nodes do not support maintenance")]
    MaintenanceNotSupported(NodeType),
    #[error("this controller replica is not master")]
    NotMaster,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reports with init progress outside `[0, 1]` (or NaN) are dropped.
fn is_well_formed(reported: &NodeState) -> bool {
    (0.0..=1.0).contains(&reported.init_progress)
}

/// Read-only snapshot of the controller, refreshed at the end of every tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerStatus {
    pub consolidated: ClusterState,
    pub published: ClusterState,
    pub is_master: bool,
    pub election_state: ElectionState,
    pub ticks: u64,
}

pub struct FleetController {
    config: FleetControllerConfig,
    clock: Arc<dyn ClockSource>,
    communicator: Arc<dyn NodeCommunicator>,
    store: Arc<dyn CoordinationStore>,
    health: ClusterHealthStore,
    handler: StateChangeHandler,
    generator: ClusterStateGenerator,
    versions: StateVersionTracker,
    broadcaster: SystemStateBroadcaster,
    election: MasterElectionHandler,
    gatherer: NodeStateGatherer,
    events: EventLog,
    metrics: MetricUpdater,
    status: Arc<ArcSwap<ControllerStatus>>,
    last_published: Option<Arc<ClusterState>>,
    persisted_crash_counts: Vec<(NodeIdentity, u32)>,
    ticks: u64,
}

impl std::fmt::Debug for FleetController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetController")
            .field("cluster", &self.config.cluster_name)
            .field("replica", &self.config.index)
            .field("election", &self.election)
            .field("published_version", &self.versions.published_version())
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}

impl FleetController {
    #[must_use]
    pub fn new(
        config: FleetControllerConfig,
        clock: Arc<dyn ClockSource>,
        communicator: Arc<dyn NodeCommunicator>,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        let health = ClusterHealthStore::from_config(&config);
        let handler = StateChangeHandler::new(&config);
        let generator = ClusterStateGenerator::new(config.clone());
        let versions = StateVersionTracker::new();
        let broadcaster = SystemStateBroadcaster::new(
            communicator.clone(),
            config.min_time_between_new_system_states_ms,
        );
        let election = MasterElectionHandler::new(
            config.index,
            config.master_lease_ms,
            config.master_cooldown_ms,
            store.clone(),
        );
        let gatherer =
            NodeStateGatherer::new(communicator.clone(), config.request_timeout_bounds_ms());
        let status = ControllerStatus {
            consolidated: versions.consolidated(),
            published: versions.published().state.clone(),
            is_master: false,
            election_state: election.state(),
            ticks: 0,
        };
        Self {
            events: EventLog::new(config.event_log_capacity),
            config,
            clock,
            communicator,
            store,
            health,
            handler,
            generator,
            versions,
            broadcaster,
            election,
            gatherer,
            metrics: MetricUpdater::new(),
            status: Arc::new(ArcSwap::from_pointee(status)),
            last_published: None,
            persisted_crash_counts: Vec::new(),
            ticks: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &FleetControllerConfig {
        &self.config
    }

    /// Shared handle to the event log.
    #[must_use]
    pub fn events(&self) -> EventLog {
        self.events.clone()
    }

    /// Shared handle to the status snapshot, readable from any thread.
    #[must_use]
    pub fn status_handle(&self) -> Arc<ArcSwap<ControllerStatus>> {
        self.status.clone()
    }

    #[must_use]
    pub fn status(&self) -> Arc<ControllerStatus> {
        self.status.load_full()
    }

    #[must_use]
    pub fn is_master(&self) -> bool {
        self.election.is_master()
    }

    #[must_use]
    pub fn published_state(&self) -> &ClusterState {
        &self.versions.published().state
    }

    #[must_use]
    pub fn consolidated_state(&self) -> ClusterState {
        self.versions.consolidated()
    }

    #[must_use]
    pub fn node_info(&self, node: NodeIdentity) -> Option<&NodeInfo> {
        self.health.get(node)
    }

    #[must_use]
    pub fn broadcaster(&self) -> &SystemStateBroadcaster {
        &self.broadcaster
    }

    /// Runs one tick.
    pub async fn tick(&mut self) {
        let started = Instant::now();
        let now_ms = self.clock.now_ms();
        self.ticks += 1;

        match self.election.step(now_ms).await {
            ElectionOutcome::BecameMaster => self.on_became_master(now_ms).await,
            ElectionOutcome::LostMastership => self.on_lost_mastership(now_ms),
            ElectionOutcome::Unchanged => {}
        }

        let consolidated = self.versions.consolidated();
        self.ingest_replies(&consolidated, now_ms);
        self.broadcaster.drain_acks();
        self.mark_start_timestamps_observed();
        self.sync_registry_and_request(&consolidated, now_ms);

        let events = self
            .handler
            .watch_timers(&mut self.health, &consolidated, now_ms);
        self.record_node_events(events);

        self.recompute_and_publish(now_ms).await;
        self.persist_crash_counts(now_ms).await;

        if let (Some(token), Some(published)) = (self.election.token(), &self.last_published) {
            self.broadcaster
                .broadcast(token, published, &self.health, now_ms);
        }

        self.refresh_status();
        self.metrics.record_tick(started.elapsed());
    }

    fn ingest_replies(&mut self, consolidated: &ClusterState, now_ms: u64) {
        for (node, reported) in self.gatherer.drain_replies() {
            if !is_well_formed(&reported) {
                tracing::warn!(
                    node = %node,
                    progress = reported.init_progress,
                    "ignoring malformed node state report"
                );
                continue;
            }
            let Some(info) = self.health.get_mut(node) else {
                tracing::warn!(node = %node, "ignoring state report from unknown node");
                continue;
            };
            let current = consolidated.node_state(node);
            let events = self
                .handler
                .handle_new_reported_state(info, &current, reported, now_ms);
            self.record_node_events(events);
        }
    }

    /// Once every node taking broadcasts has acknowledged the published
    /// state, its start timestamps are known cluster-wide and the generator
    /// can leave them out.
    fn mark_start_timestamps_observed(&mut self) {
        if !self.election.is_master() {
            return;
        }
        let Some(published) = self.last_published.clone() else {
            return;
        };
        let version = published.version();
        let all_acked = self
            .health
            .iter()
            .filter(|info| info.reported_state().state != State::Down)
            .all(|info| {
                self.broadcaster
                    .last_acked_version(info.node())
                    .is_some_and(|acked| acked >= version)
            });
        if !all_acked {
            return;
        }
        for (node, state) in published.nodes() {
            if state.start_timestamp == 0 {
                continue;
            }
            if let Some(info) = self.health.get_mut(node) {
                if info.observed_start_timestamp < state.start_timestamp {
                    tracing::debug!(
                        node = %node,
                        start_timestamp = state.start_timestamp,
                        "start timestamp observed by all nodes"
                    );
                    info.observed_start_timestamp = state.start_timestamp;
                }
            }
        }
    }

    fn sync_registry_and_request(&mut self, consolidated: &ClusterState, now_ms: u64) {
        let registered = self.communicator.registered_nodes();
        let registered_set: BTreeSet<NodeIdentity> = registered.iter().copied().collect();
        let nodes: Vec<NodeIdentity> = self.health.iter().map(NodeInfo::node).collect();

        for node in nodes {
            let has_pending = self.gatherer.has_pending(node);
            let Some(info) = self.health.get_mut(node) else {
                continue;
            };
            let check =
                self.handler
                    .check_registry(info, registered_set.contains(&node), has_pending, now_ms);
            let mut events = check.events;
            if check.expired {
                self.gatherer.drop_request(node);
                let current = consolidated.node_state(node);
                events.extend(self.handler.handle_not_seen_in_registry(info, &current, now_ms));
            }
            self.record_node_events(events);
        }

        self.gatherer.expire_requests(now_ms);
        self.gatherer.send_requests(&self.health, &registered, now_ms);
    }

    async fn recompute_and_publish(&mut self, now_ms: u64) {
        let published_bits = self.versions.published().state.distribution_bits();
        let candidate = self.generator.generate(&self.health, now_ms, published_bits);
        self.versions.set_candidate(candidate);

        if !self.election.is_master() || !self.versions.should_publish() {
            return;
        }
        let version = self.versions.next_version();
        if let Err(e) = self.store.store_latest_version(version).await {
            tracing::warn!(version, error = %e, "failed to persist cluster state version");
            self.step_down(now_ms);
            return;
        }
        let Some(token) = self.election.token() else {
            return;
        };
        if let Some(published) = self.versions.publish(token, now_ms) {
            self.events.extend(published.events);
            self.last_published = Some(published.state);
        }
    }

    async fn persist_crash_counts(&mut self, now_ms: u64) {
        if !self.election.is_master() {
            return;
        }
        let counts = self.health.crash_counts();
        if counts == self.persisted_crash_counts {
            return;
        }
        match self.store.store_crash_counts(counts.clone()).await {
            Ok(()) => self.persisted_crash_counts = counts,
            Err(e) => {
                tracing::warn!(error = %e, "failed to persist premature crash counts");
                self.step_down(now_ms);
            }
        }
    }

    async fn on_became_master(&mut self, now_ms: u64) {
        let loaded = self.load_from_store().await;
        let (stored_version, wanted, counts) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load controller state after election");
                self.step_down(now_ms);
                return;
            }
        };
        self.health.apply_wanted_states(&wanted);
        self.health.apply_crash_counts(&counts);
        self.persisted_crash_counts = counts;

        let next = self.versions.reset_for_new_master(stored_version);
        self.broadcaster.reset();
        self.broadcaster.set_first_allowed_broadcast(
            now_ms.saturating_add(self.config.min_time_before_first_system_state_broadcast_ms),
        );
        self.events.add(Event::cluster(
            EventKind::MasterElection,
            format!(
                "This node just became fleetcontroller master. Bumped version to {next} to be \
                 in line."
            ),
            now_ms,
        ));
    }

    async fn load_from_store(
        &self,
    ) -> Result<(u32, Vec<(NodeIdentity, NodeState)>, Vec<(NodeIdentity, u32)>), StoreError> {
        let version = self.store.read_latest_version().await?;
        let wanted = self.store.read_wanted_states().await?;
        let counts = self.store.read_crash_counts().await?;
        Ok((version, wanted, counts))
    }

    fn step_down(&mut self, now_ms: u64) {
        if self.election.abdicate() == ElectionOutcome::LostMastership {
            self.on_lost_mastership(now_ms);
        }
    }

    fn on_lost_mastership(&mut self, now_ms: u64) {
        self.versions.on_lost_mastership();
        self.broadcaster.reset();
        self.last_published = None;
        self.events.add(Event::cluster(
            EventKind::MasterElection,
            "This node is no longer fleetcontroller master.",
            now_ms,
        ));
    }

    fn record_node_events(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        if self.election.is_master() {
            self.events.extend(events);
        } else {
            for event in events {
                tracing::debug!(event = %event, "not master, event not recorded");
            }
        }
    }

    fn refresh_status(&self) {
        let status = ControllerStatus {
            consolidated: self.versions.consolidated(),
            published: self.versions.published().state.clone(),
            is_master: self.election.is_master(),
            election_state: self.election.state(),
            ticks: self.ticks,
        };
        self.metrics.update_cluster_state(&status.consolidated);
        self.metrics.update_master(status.is_master);
        self.status.store(Arc::new(status));
    }

    /// Sets the operator wanted state of a node and persists all wanted
    /// states. Takes effect on the next tick.
    ///
    /// # Errors
    ///
    /// Fails on a follower replica, for unconfigured nodes, for states other
    /// than Up, Retired, Maintenance and Down, for Maintenance on
    /// distributors, and when the coordination store rejects the write.
    pub async fn set_wanted_state(
        &mut self,
        node: NodeIdentity,
        state: State,
        description: &str,
    ) -> Result<(), WantedStateError> {
        // A follower's wanted-state table is only loaded on election, so
        // writing it would clobber the master's.
        if !self.election.is_master() {
            return Err(WantedStateError::NotMaster);
        }
        match state {
            State::Up | State::Retired | State::Down => {}
            State::Maintenance if node.node_type.supports_maintenance() => {}
            State::Maintenance => {
                return Err(WantedStateError::MaintenanceNotSupported(node.node_type))
            }
            other => return Err(WantedStateError::InvalidState(other)),
        }
        let wanted = NodeState::new(state).with_description(description);

        let info = self
            .health
            .get_mut(node)
            .ok_or(WantedStateError::UnknownNode(node))?;
        let previous = std::mem::replace(&mut info.operator_wanted, wanted.clone());
        let states = self.health.wanted_states();

        if let Err(e) = self.store.store_wanted_states(states).await {
            if let Some(info) = self.health.get_mut(node) {
                info.operator_wanted = previous;
            }
            return Err(e.into());
        }
        self.events.add(Event::node(
            node,
            EventKind::Current,
            format!(
                "Altered wanted state from '{}' to '{}'",
                previous.compact(node.node_type),
                wanted.compact(node.node_type)
            ),
            self.clock.now_ms(),
        ));
        Ok(())
    }

    /// Resets a node's premature crash count, e.g. after the operator fixed
    /// the cause of its crashes.
    ///
    /// # Errors
    ///
    /// Fails for unconfigured nodes.
    pub fn clear_premature_crash_count(&mut self, node: NodeIdentity) -> Result<(), WantedStateError> {
        let info = self
            .health
            .get_mut(node)
            .ok_or(WantedStateError::UnknownNode(node))?;
        info.premature_crash_count = 0;
        tracing::info!(node = %node, "premature crash count cleared by operator");
        Ok(())
    }

    /// Gives up mastership and stops outstanding work.
    pub async fn shutdown(&mut self) {
        let now_ms = self.clock.now_ms();
        if self.election.relinquish().await == ElectionOutcome::LostMastership {
            self.on_lost_mastership(now_ms);
        }
        self.refresh_status();
    }
}
