//! Cluster states annotated with why they look the way they do.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster_state::ClusterState;
use crate::node::NodeIdentity;

/// Why the controller overrode a node's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeStateReason {
    /// The node's group has too few available nodes.
    GroupIsDown,
    /// The node crashed too many times in a row.
    NodeTooUnstable,
    /// The node stalled or regressed during initialization.
    NodeInitStalled,
}

/// Why the cluster as a whole is Down.
///
/// When several apply, the one with the lowest [`priority`](Self::priority)
/// is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterStateReason {
    TooFewStorageNodesAvailable,
    TooFewDistributorNodesAvailable,
    TooLowAvailableStorageNodeRatio,
    TooLowAvailableDistributorNodeRatio,
}

impl ClusterStateReason {
    /// Lower values win.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            ClusterStateReason::TooFewStorageNodesAvailable => 0,
            ClusterStateReason::TooFewDistributorNodesAvailable => 1,
            ClusterStateReason::TooLowAvailableStorageNodeRatio => 2,
            ClusterStateReason::TooLowAvailableDistributorNodeRatio => 3,
        }
    }

    /// Operator-facing description, used as the cluster event text.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            ClusterStateReason::TooFewStorageNodesAvailable => {
                "Too few storage nodes available in cluster. Setting cluster state down"
            }
            ClusterStateReason::TooFewDistributorNodesAvailable => {
                "Too few distributor nodes available in cluster. Setting cluster state down"
            }
            ClusterStateReason::TooLowAvailableStorageNodeRatio => {
                "Too low ratio of available storage nodes. Setting cluster state down"
            }
            ClusterStateReason::TooLowAvailableDistributorNodeRatio => {
                "Too low ratio of available distributor nodes. Setting cluster state down"
            }
        }
    }
}

impl fmt::Display for ClusterStateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A generated cluster state plus the reasons behind its overrides.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnnotatedClusterState {
    pub state: ClusterState,
    pub node_reasons: BTreeMap<NodeIdentity, NodeStateReason>,
    pub cluster_reason: Option<ClusterStateReason>,
}

impl AnnotatedClusterState {
    #[must_use]
    pub fn new(state: ClusterState) -> Self {
        Self {
            state,
            node_reasons: BTreeMap::new(),
            cluster_reason: None,
        }
    }

    #[must_use]
    pub fn with_cluster_reason(mut self, reason: ClusterStateReason) -> Self {
        self.cluster_reason = Some(reason);
        self
    }

    #[must_use]
    pub fn with_node_reason(mut self, node: NodeIdentity, reason: NodeStateReason) -> Self {
        self.node_reasons.insert(node, reason);
        self
    }

    #[must_use]
    pub fn node_reason(&self, node: NodeIdentity) -> Option<NodeStateReason> {
        self.node_reasons.get(&node).copied()
    }

    /// Similarity used to decide whether a new candidate is worth publishing.
    ///
    /// Down clusters compare as similar unless the new one is Down for a more
    /// important reason.
    #[must_use]
    pub fn similar_to(&self, other: &AnnotatedClusterState) -> bool {
        if !self.state.similar_to(&other.state) {
            return false;
        }
        match (self.cluster_reason, other.cluster_reason) {
            (Some(old), Some(new)) => new.priority() >= old.priority(),
            (None, Some(_)) => false,
            _ => true,
        }
    }
}
