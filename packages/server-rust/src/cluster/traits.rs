//! Contracts for the controller's external collaborators.
//!
//! The controller never talks to the network or to durable storage directly.
//! Node RPC goes through [`NodeCommunicator`] and leader leases plus durable
//! controller state go through [`CoordinationStore`]. In-memory
//! implementations of both live in [`super::local`].

use std::sync::Arc;

use async_trait::async_trait;
use fleetctl_core::{ClusterState, NodeIdentity, NodeState};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure talking to a single node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommunicationError {
    #[error("Request timed out after {0} ms")]
    Timeout(u64),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Node rejected request: {0}")]
    Rejected(String),
}

/// Failure talking to the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("stored record '{key}' is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

// ---------------------------------------------------------------------------
// MasterTerm
// ---------------------------------------------------------------------------

/// A granted master lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterTerm {
    /// Controller replica holding the lease.
    pub replica: u16,
    /// Increases every time the lease changes hands.
    pub epoch: u64,
    pub lease_expiry_ms: u64,
}

// ---------------------------------------------------------------------------
// NodeCommunicator
// ---------------------------------------------------------------------------

/// RPC towards content nodes plus the node registry view.
#[async_trait]
pub trait NodeCommunicator: Send + Sync + 'static {
    /// Long-poll for a node's state.
    ///
    /// Answers as soon as the node's state differs from `known` (immediately
    /// when `known` is `None`), and at the latest shortly before
    /// `timeout_ms` with the node's current state.
    async fn get_node_state(
        &self,
        node: NodeIdentity,
        known: Option<NodeState>,
        timeout_ms: u64,
    ) -> Result<NodeState, CommunicationError>;

    /// Pushes a cluster state to a node. `Ok` means the node acknowledged it.
    async fn set_cluster_state(
        &self,
        node: NodeIdentity,
        state: Arc<ClusterState>,
    ) -> Result<(), CommunicationError>;

    /// Nodes currently present in the registry.
    fn registered_nodes(&self) -> Vec<NodeIdentity>;
}

// ---------------------------------------------------------------------------
// CoordinationStore
// ---------------------------------------------------------------------------

/// Shared store used for mastership and durable controller state.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Acquires or renews the master lease for `replica`.
    ///
    /// Returns `Ok(None)` while another replica holds an unexpired lease.
    async fn acquire_lease(
        &self,
        replica: u16,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<Option<MasterTerm>, StoreError>;

    /// Gives up the lease if `replica` holds it.
    async fn release_lease(&self, replica: u16) -> Result<(), StoreError>;

    async fn read_latest_version(&self) -> Result<u32, StoreError>;

    async fn store_latest_version(&self, version: u32) -> Result<(), StoreError>;

    async fn read_wanted_states(&self) -> Result<Vec<(NodeIdentity, NodeState)>, StoreError>;

    async fn store_wanted_states(
        &self,
        states: Vec<(NodeIdentity, NodeState)>,
    ) -> Result<(), StoreError>;

    async fn read_crash_counts(&self) -> Result<Vec<(NodeIdentity, u32)>, StoreError>;

    async fn store_crash_counts(&self, counts: Vec<(NodeIdentity, u32)>) -> Result<(), StoreError>;
}
