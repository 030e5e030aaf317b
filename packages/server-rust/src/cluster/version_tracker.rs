//! Published vs. candidate cluster state bookkeeping.

use std::sync::Arc;

use fleetctl_core::{
    compute_event_diff, AnnotatedClusterState, ClusterState, Event, EventKind, State,
};

use super::election::MasterToken;

/// A cluster state that was just assigned a version.
#[derive(Debug, Clone)]
pub struct PublishedState {
    pub version: u32,
    pub state: Arc<ClusterState>,
    pub events: Vec<Event>,
}

/// Tracks the last published state and the latest candidate, and assigns
/// versions.
#[derive(Debug, Clone)]
pub struct StateVersionTracker {
    published: AnnotatedClusterState,
    candidate: AnnotatedClusterState,
    next_version: u32,
    force_publish: bool,
}

impl Default for StateVersionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateVersionTracker {
    /// Starts out with an unversioned, cluster-Down published state.
    #[must_use]
    pub fn new() -> Self {
        let mut initial = ClusterState::empty();
        initial.set_cluster_state(State::Down);
        let initial = AnnotatedClusterState::new(initial);
        Self {
            published: initial.clone(),
            candidate: initial,
            next_version: 1,
            force_publish: false,
        }
    }

    #[must_use]
    pub fn published(&self) -> &AnnotatedClusterState {
        &self.published
    }

    #[must_use]
    pub fn candidate(&self) -> &AnnotatedClusterState {
        &self.candidate
    }

    #[must_use]
    pub fn published_version(&self) -> u32 {
        self.published.state.version()
    }

    /// Version the next publish will carry.
    #[must_use]
    pub fn next_version(&self) -> u32 {
        self.next_version
    }

    pub fn set_candidate(&mut self, candidate: AnnotatedClusterState) {
        self.candidate = candidate;
    }

    /// The candidate differs enough from the published state, or a publish
    /// was forced.
    #[must_use]
    pub fn should_publish(&self) -> bool {
        self.force_publish || !self.published.similar_to(&self.candidate)
    }

    /// The view other components act on: the published state while the
    /// cluster is up, otherwise the candidate under the published version.
    #[must_use]
    pub fn consolidated(&self) -> ClusterState {
        if self.published.state.is_up() {
            return self.published.state.clone();
        }
        let mut state = self.candidate.state.clone();
        state.set_version(self.published_version());
        state
    }

    /// Aligns versioning with the coordination store after winning an
    /// election and forces the next publish. Returns the next version.
    pub fn reset_for_new_master(&mut self, stored_version: u32) -> u32 {
        self.next_version = self
            .next_version
            .max(stored_version.saturating_add(1));
        self.force_publish = true;
        self.next_version
    }

    /// Drops the candidate and any pending forced publish after losing
    /// mastership.
    pub fn on_lost_mastership(&mut self) {
        self.candidate = self.published.clone();
        self.force_publish = false;
    }

    /// Publishes the candidate under the next version if it should be
    /// published.
    pub fn publish(&mut self, _token: &MasterToken, now_ms: u64) -> Option<PublishedState> {
        if !self.should_publish() {
            return None;
        }
        let version = self.next_version;
        let mut next = self.candidate.clone();
        next.state.set_version(version);

        let mut events = compute_event_diff(&self.published, &next, now_ms);
        events.push(Event::cluster(
            EventKind::SystemState,
            format!(
                "New cluster state version {version}. Change from last: {}",
                self.published.state.textual_difference(&next.state)
            ),
            now_ms,
        ));
        let old_bits = self.published.state.distribution_bits();
        let new_bits = next.state.distribution_bits();
        if old_bits != new_bits {
            events.push(Event::cluster(
                EventKind::SystemState,
                format!("Altering distribution bits in system from {old_bits} to {new_bits}"),
                now_ms,
            ));
        }

        tracing::info!(version, state = %next.state, "publishing new cluster state");
        self.candidate = next.clone();
        let state = Arc::new(next.state.clone());
        self.published = next;
        self.next_version = version.saturating_add(1);
        self.force_publish = false;
        Some(PublishedState {
            version,
            state,
            events,
        })
    }
}
