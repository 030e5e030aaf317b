//! In-memory implementations of the collaborator traits.
//!
//! `LocalCommunicator` stands in for the RPC layer and the node registry, and
//! `InMemoryCoordinationStore` stands in for the shared coordination store.
//! Both are used by the simulation binary and by the controller tests, and
//! both can inject failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fleetctl_core::{ClusterState, NodeIdentity, NodeState};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use super::traits::{CommunicationError, CoordinationStore, MasterTerm, NodeCommunicator, StoreError};

type NodeAnswer = Option<Result<NodeState, CommunicationError>>;

// ---------------------------------------------------------------------------
// LocalCommunicator
// ---------------------------------------------------------------------------

struct LocalNode {
    answer: watch::Sender<NodeAnswer>,
    registered: bool,
    fail_pushes: bool,
    received: Vec<Arc<ClusterState>>,
}

impl LocalNode {
    fn new() -> Self {
        let (answer, _) = watch::channel(None);
        Self {
            answer,
            registered: true,
            fail_pushes: false,
            received: Vec::new(),
        }
    }
}

/// Simulated nodes living in the same process.
///
/// A node answers state requests only once a state (or an error) has been
/// set for it. Long-polls complete as soon as the node's answer changes.
#[derive(Default)]
pub struct LocalCommunicator {
    nodes: DashMap<NodeIdentity, LocalNode>,
}

impl std::fmt::Debug for LocalCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCommunicator")
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl LocalCommunicator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a communicator with the given nodes registered but silent.
    #[must_use]
    pub fn with_nodes(nodes: impl IntoIterator<Item = NodeIdentity>) -> Self {
        let communicator = Self::new();
        for node in nodes {
            communicator.add_node(node);
        }
        communicator
    }

    /// Registers a node. An already known node keeps its state.
    pub fn add_node(&self, node: NodeIdentity) {
        self.nodes.entry(node).or_insert_with(LocalNode::new).registered = true;
    }

    /// Sets the state the node reports. Registers unknown nodes.
    pub fn set_node_state(&self, node: NodeIdentity, state: NodeState) {
        self.set_answer(node, Some(Ok(state)));
    }

    /// Makes the node answer every state request with `error`.
    pub fn set_node_error(&self, node: NodeIdentity, error: CommunicationError) {
        self.set_answer(node, Some(Err(error)));
    }

    fn set_answer(&self, node: NodeIdentity, answer: NodeAnswer) {
        let entry = self.nodes.entry(node).or_insert_with(LocalNode::new);
        entry.answer.send_replace(answer);
    }

    /// Adds or removes the node from the registry.
    pub fn set_registered(&self, node: NodeIdentity, registered: bool) {
        if let Some(mut entry) = self.nodes.get_mut(&node) {
            entry.registered = registered;
        }
    }

    /// Makes cluster state pushes to the node fail.
    pub fn set_fail_pushes(&self, node: NodeIdentity, fail: bool) {
        if let Some(mut entry) = self.nodes.get_mut(&node) {
            entry.fail_pushes = fail;
        }
    }

    /// Every cluster state the node has acknowledged, oldest first.
    #[must_use]
    pub fn received_states(&self, node: NodeIdentity) -> Vec<Arc<ClusterState>> {
        self.nodes
            .get(&node)
            .map(|entry| entry.received.clone())
            .unwrap_or_default()
    }

    /// Version of the last cluster state the node acknowledged.
    #[must_use]
    pub fn last_received_version(&self, node: NodeIdentity) -> Option<u32> {
        self.nodes
            .get(&node)
            .and_then(|entry| entry.received.last().map(|s| s.version()))
    }
}

#[async_trait]
impl NodeCommunicator for LocalCommunicator {
    async fn get_node_state(
        &self,
        node: NodeIdentity,
        known: Option<NodeState>,
        timeout_ms: u64,
    ) -> Result<NodeState, CommunicationError> {
        let mut rx = self
            .nodes
            .get(&node)
            .map(|entry| entry.answer.subscribe())
            .ok_or_else(|| CommunicationError::Connection(format!("no such node {node}")))?;

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                Some(Err(e)) => return Err(e),
                Some(Ok(state)) if known.as_ref() != Some(&state) => return Ok(state),
                _ => {}
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(CommunicationError::Connection(
                        "Closed at other end".to_string(),
                    ))
                }
                Err(_) => {
                    return match rx.borrow().clone() {
                        Some(answer) => answer,
                        None => Err(CommunicationError::Timeout(timeout_ms)),
                    };
                }
            }
        }
    }

    async fn set_cluster_state(
        &self,
        node: NodeIdentity,
        state: Arc<ClusterState>,
    ) -> Result<(), CommunicationError> {
        let mut entry = self
            .nodes
            .get_mut(&node)
            .ok_or_else(|| CommunicationError::Connection(format!("no such node {node}")))?;
        if entry.fail_pushes {
            return Err(CommunicationError::Connection(
                "Connection refused".to_string(),
            ));
        }
        entry.received.push(state);
        Ok(())
    }

    fn registered_nodes(&self) -> Vec<NodeIdentity> {
        self.nodes
            .iter()
            .filter(|entry| entry.registered)
            .map(|entry| *entry.key())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// InMemoryCoordinationStore
// ---------------------------------------------------------------------------

const LATEST_VERSION_KEY: &str = "latest_version";
const WANTED_STATES_KEY: &str = "wanted_states";
const CRASH_COUNTS_KEY: &str = "crash_counts";

#[derive(Debug, Default)]
struct LeaseSlot {
    holder: Option<MasterTerm>,
    epoch: u64,
}

/// Coordination store kept in process memory.
///
/// Records are kept MsgPack-encoded so that reads go through the same
/// decoding path a remote store would.
#[derive(Debug)]
pub struct InMemoryCoordinationStore {
    records: DashMap<&'static str, Vec<u8>>,
    lease: Mutex<LeaseSlot>,
    available: AtomicBool,
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinationStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            lease: Mutex::new(LeaseSlot::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// The current lease holder, expired or not.
    #[must_use]
    pub fn lease_holder(&self) -> Option<MasterTerm> {
        self.lease.lock().holder
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is offline".to_string()))
        }
    }

    fn write<T: Serialize>(&self, key: &'static str, value: &T) -> Result<(), StoreError> {
        self.check_available()?;
        let bytes = rmp_serde::to_vec_named(value).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.records.insert(key, bytes);
        Ok(())
    }

    fn read<T: DeserializeOwned + Default>(&self, key: &'static str) -> Result<T, StoreError> {
        self.check_available()?;
        let Some(bytes) = self.records.get(key) else {
            return Ok(T::default());
        };
        rmp_serde::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn acquire_lease(
        &self,
        replica: u16,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<Option<MasterTerm>, StoreError> {
        self.check_available()?;
        let mut slot = self.lease.lock();
        let current = slot.holder;
        match current {
            Some(term) if term.lease_expiry_ms > now_ms && term.replica != replica => Ok(None),
            Some(term) if term.lease_expiry_ms > now_ms => {
                let renewed = MasterTerm {
                    lease_expiry_ms: now_ms.saturating_add(lease_ms),
                    ..term
                };
                slot.holder = Some(renewed);
                Ok(Some(renewed))
            }
            _ => {
                slot.epoch += 1;
                let term = MasterTerm {
                    replica,
                    epoch: slot.epoch,
                    lease_expiry_ms: now_ms.saturating_add(lease_ms),
                };
                slot.holder = Some(term);
                Ok(Some(term))
            }
        }
    }

    async fn release_lease(&self, replica: u16) -> Result<(), StoreError> {
        self.check_available()?;
        let mut slot = self.lease.lock();
        if slot.holder.is_some_and(|term| term.replica == replica) {
            slot.holder = None;
        }
        Ok(())
    }

    async fn read_latest_version(&self) -> Result<u32, StoreError> {
        self.read(LATEST_VERSION_KEY)
    }

    async fn store_latest_version(&self, version: u32) -> Result<(), StoreError> {
        self.write(LATEST_VERSION_KEY, &version)
    }

    async fn read_wanted_states(&self) -> Result<Vec<(NodeIdentity, NodeState)>, StoreError> {
        self.read(WANTED_STATES_KEY)
    }

    async fn store_wanted_states(
        &self,
        states: Vec<(NodeIdentity, NodeState)>,
    ) -> Result<(), StoreError> {
        self.write(WANTED_STATES_KEY, &states)
    }

    async fn read_crash_counts(&self) -> Result<Vec<(NodeIdentity, u32)>, StoreError> {
        self.read(CRASH_COUNTS_KEY)
    }

    async fn store_crash_counts(&self, counts: Vec<(NodeIdentity, u32)>) -> Result<(), StoreError> {
        self.write(CRASH_COUNTS_KEY, &counts)
    }
}

#[cfg(test)]
mod tests {
    use fleetctl_core::State;

    use super::*;

    #[tokio::test]
    async fn silent_node_times_out() {
        let comm = LocalCommunicator::with_nodes([NodeIdentity::storage(0)]);
        let result = comm.get_node_state(NodeIdentity::storage(0), None, 10).await;
        assert_eq!(result, Err(CommunicationError::Timeout(10)));
    }

    #[tokio::test]
    async fn answers_immediately_when_state_differs_from_known() {
        let comm = LocalCommunicator::new();
        comm.set_node_state(NodeIdentity::storage(0), NodeState::up());
        let state = comm
            .get_node_state(NodeIdentity::storage(0), Some(NodeState::down()), 60_000)
            .await
            .unwrap();
        assert_eq!(state.state, State::Up);
    }

    #[tokio::test]
    async fn long_poll_returns_current_state_at_timeout() {
        let comm = LocalCommunicator::new();
        comm.set_node_state(NodeIdentity::storage(0), NodeState::up());
        let state = comm
            .get_node_state(NodeIdentity::storage(0), Some(NodeState::up()), 20)
            .await
            .unwrap();
        assert_eq!(state, NodeState::up());
    }

    #[tokio::test]
    async fn long_poll_wakes_on_change() {
        let comm = Arc::new(LocalCommunicator::new());
        let node = NodeIdentity::distributor(1);
        comm.set_node_state(node, NodeState::up());

        let poller = {
            let comm = comm.clone();
            tokio::spawn(async move {
                comm.get_node_state(node, Some(NodeState::up()), 60_000).await
            })
        };
        tokio::task::yield_now().await;
        comm.set_node_state(node, NodeState::initializing(0.5));

        let state = poller.await.unwrap().unwrap();
        assert_eq!(state, NodeState::initializing(0.5));
    }

    #[tokio::test]
    async fn errors_are_returned_to_caller() {
        let comm = LocalCommunicator::new();
        let node = NodeIdentity::storage(3);
        comm.set_node_error(node, CommunicationError::Connection("Closed at other end".into()));
        let result = comm.get_node_state(node, None, 1000).await;
        assert_eq!(
            result,
            Err(CommunicationError::Connection("Closed at other end".into()))
        );
        assert!(comm
            .get_node_state(NodeIdentity::storage(9), None, 10)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn registry_and_pushes() {
        let comm = LocalCommunicator::with_nodes([NodeIdentity::storage(0), NodeIdentity::storage(1)]);
        comm.set_registered(NodeIdentity::storage(1), false);
        assert_eq!(comm.registered_nodes(), vec![NodeIdentity::storage(0)]);

        let mut state = ClusterState::empty();
        state.set_version(3);
        comm.set_cluster_state(NodeIdentity::storage(0), Arc::new(state.clone()))
            .await
            .unwrap();
        assert_eq!(comm.last_received_version(NodeIdentity::storage(0)), Some(3));

        comm.set_fail_pushes(NodeIdentity::storage(0), true);
        assert!(comm
            .set_cluster_state(NodeIdentity::storage(0), Arc::new(state))
            .await
            .is_err());
        assert_eq!(comm.received_states(NodeIdentity::storage(0)).len(), 1);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let store = InMemoryCoordinationStore::new();
        let first = store.acquire_lease(0, 0, 1000).await.unwrap().unwrap();
        assert_eq!(first.epoch, 1);
        assert_eq!(store.acquire_lease(1, 500, 1000).await.unwrap(), None);

        let renewed = store.acquire_lease(0, 900, 1000).await.unwrap().unwrap();
        assert_eq!(renewed.epoch, 1);
        assert_eq!(renewed.lease_expiry_ms, 1900);

        let taken = store.acquire_lease(1, 1900, 1000).await.unwrap().unwrap();
        assert_eq!(taken.replica, 1);
        assert_eq!(taken.epoch, 2);
        assert_eq!(store.lease_holder(), Some(taken));
    }

    #[tokio::test]
    async fn records_round_trip_and_default_when_absent() {
        let store = InMemoryCoordinationStore::new();
        assert_eq!(store.read_latest_version().await.unwrap(), 0);
        assert!(store.read_wanted_states().await.unwrap().is_empty());

        store.store_latest_version(17).await.unwrap();
        store
            .store_wanted_states(vec![(
                NodeIdentity::storage(2),
                NodeState::new(State::Maintenance).with_description("rack move"),
            )])
            .await
            .unwrap();
        store
            .store_crash_counts(vec![(NodeIdentity::distributor(0), 2)])
            .await
            .unwrap();

        assert_eq!(store.read_latest_version().await.unwrap(), 17);
        let wanted = store.read_wanted_states().await.unwrap();
        assert_eq!(wanted[0].1.description, "rack move");
        assert_eq!(
            store.read_crash_counts().await.unwrap(),
            vec![(NodeIdentity::distributor(0), 2)]
        );
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryCoordinationStore::new();
        store.set_available(false);
        assert!(matches!(
            store.acquire_lease(0, 0, 1000).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.store_latest_version(1).await.is_err());
        store.set_available(true);
        assert!(store.store_latest_version(1).await.is_ok());
    }
}
