//! Bounded, shared log of controller events.

use std::sync::Arc;

use arc_swap::ArcSwap;
use fleetctl_core::{Event, EventKind, EventScope, NodeIdentity};

/// Append-only event log keeping the most recent `capacity` events.
///
/// Cloning is cheap and every clone observes the same log. Readers get
/// lock-free snapshots; writes replace the whole list.
#[derive(Debug, Clone)]
pub struct EventLog {
    events: Arc<ArcSwap<Vec<Event>>>,
    capacity: usize,
}

impl EventLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Arc::new(ArcSwap::from_pointee(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    /// Records an event, dropping the oldest ones beyond capacity.
    pub fn add(&self, event: Event) {
        match &event.scope {
            EventScope::Node(node) => {
                tracing::info!(node = %node, kind = ?event.kind, "{}", event.description);
            }
            EventScope::Cluster => {
                tracing::info!(kind = ?event.kind, "{}", event.description);
            }
        }
        metrics::counter!("fleetctl_events_total", "kind" => kind_label(event.kind)).increment(1);

        let capacity = self.capacity;
        self.events.rcu(|current| {
            let mut next = Vec::with_capacity(current.len().min(capacity) + 1);
            let skip = (current.len() + 1).saturating_sub(capacity);
            next.extend(current.iter().skip(skip).cloned());
            next.push(event.clone());
            next
        });
    }

    pub fn extend(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.add(event);
        }
    }

    /// All retained events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Event>> {
        self.events.load_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.load().is_empty()
    }

    /// Retained events for a single node, oldest first.
    #[must_use]
    pub fn node_events(&self, node: NodeIdentity) -> Vec<Event> {
        self.events
            .load()
            .iter()
            .filter(|e| e.node_identity() == Some(node))
            .cloned()
            .collect()
    }

    /// Retained cluster-wide events, oldest first.
    #[must_use]
    pub fn cluster_events(&self) -> Vec<Event> {
        self.events
            .load()
            .iter()
            .filter(|e| e.scope == EventScope::Cluster)
            .cloned()
            .collect()
    }
}

fn kind_label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Reported => "reported",
        EventKind::Current => "current",
        EventKind::SystemState => "system_state",
        EventKind::MasterElection => "master_election",
    }
}
