//! Operator-facing events.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::node::NodeIdentity;

/// What an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "scope", content = "node")]
pub enum EventScope {
    Cluster,
    Node(NodeIdentity),
}

/// Event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// Something a node reported, or failed to report.
    Reported,
    /// A change in what the controller currently decides for a node.
    Current,
    /// A change to the cluster state as a whole.
    SystemState,
    /// Mastership gained or lost.
    MasterElection,
}

/// An immutable, timestamped event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub scope: EventScope,
    pub kind: EventKind,
    pub timestamp_ms: u64,
    pub description: String,
}

impl Event {
    #[must_use]
    pub fn node(
        node: NodeIdentity,
        kind: EventKind,
        description: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            scope: EventScope::Node(node),
            kind,
            timestamp_ms,
            description: description.into(),
        }
    }

    #[must_use]
    pub fn cluster(kind: EventKind, description: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            scope: EventScope::Cluster,
            kind,
            timestamp_ms,
            description: description.into(),
        }
    }

    /// The node this event is about, if any.
    #[must_use]
    pub fn node_identity(&self) -> Option<NodeIdentity> {
        match self.scope {
            EventScope::Node(node) => Some(node),
            EventScope::Cluster => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            EventScope::Node(node) => write!(f, "Event: {node}: {}", self.description),
            EventScope::Cluster => write!(f, "Event: {}", self.description),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_node() {
        let event = Event::node(
            NodeIdentity::storage(0),
            EventKind::Current,
            "Altered node state in cluster state from 'U' to 'D'",
            123,
        );
        assert_eq!(
            event.to_string(),
            "Event: storage.0: Altered node state in cluster state from 'U' to 'D'"
        );
        assert_eq!(event.node_identity(), Some(NodeIdentity::storage(0)));
    }

    #[test]
    fn display_cluster_event() {
        let event = Event::cluster(EventKind::SystemState, "Cluster is down", 0);
        assert_eq!(event.to_string(), "Event: Cluster is down");
        assert_eq!(event.node_identity(), None);
    }

    #[test]
    fn serializes_with_scope_tag() {
        let event = Event::node(NodeIdentity::distributor(2), EventKind::Reported, "x", 5);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["scope"]["scope"], "node");
        assert_eq!(json["scope"]["node"]["index"], 2);
        assert_eq!(json["kind"], "reported");
    }
}
