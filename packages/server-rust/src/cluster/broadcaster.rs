//! System State Broadcaster: pushes published cluster states to nodes and
//! tracks their acknowledgements.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetctl_core::{ClusterState, NodeIdentity, State};
use tokio::sync::mpsc;

use super::election::MasterToken;
use super::health::ClusterHealthStore;
use super::traits::{CommunicationError, NodeCommunicator};

/// Outcome of one cluster state push.
#[derive(Debug)]
struct BroadcastAck {
    node: NodeIdentity,
    version: u32,
    generation: u64,
    result: Result<(), CommunicationError>,
}

/// Sends the latest published state to every node that can take it.
///
/// Pushes run as spawned tasks and report back through a channel that is
/// drained once per tick. Bumping the generation on [`reset`](Self::reset)
/// makes acknowledgements of pushes started before a demotion void.
pub struct SystemStateBroadcaster {
    communicator: Arc<dyn NodeCommunicator>,
    min_time_between_states_ms: u64,
    first_allowed_broadcast_ms: u64,
    current: Option<Arc<ClusterState>>,
    last_broadcast_ms: Option<u64>,
    last_sent: BTreeMap<NodeIdentity, u32>,
    last_acked: BTreeMap<NodeIdentity, u32>,
    generation: u64,
    ack_tx: mpsc::UnboundedSender<BroadcastAck>,
    ack_rx: mpsc::UnboundedReceiver<BroadcastAck>,
}

impl std::fmt::Debug for SystemStateBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemStateBroadcaster")
            .field("version", &self.current.as_ref().map(|s| s.version()))
            .field("last_broadcast_ms", &self.last_broadcast_ms)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl SystemStateBroadcaster {
    #[must_use]
    pub fn new(communicator: Arc<dyn NodeCommunicator>, min_time_between_states_ms: u64) -> Self {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        Self {
            communicator,
            min_time_between_states_ms,
            first_allowed_broadcast_ms: 0,
            current: None,
            last_broadcast_ms: None,
            last_sent: BTreeMap::new(),
            last_acked: BTreeMap::new(),
            generation: 0,
            ack_tx,
            ack_rx,
        }
    }

    /// Earliest time the first state may go out, unless every node has
    /// reported before then.
    pub fn set_first_allowed_broadcast(&mut self, at_ms: u64) {
        self.first_allowed_broadcast_ms = at_ms;
    }

    /// Version currently being broadcast.
    #[must_use]
    pub fn broadcast_version(&self) -> Option<u32> {
        self.current.as_ref().map(|s| s.version())
    }

    /// Starts pushes of `published` to every eligible node that does not have
    /// it yet. Returns the number of pushes started.
    pub fn broadcast(
        &mut self,
        _token: &MasterToken,
        published: &Arc<ClusterState>,
        health: &ClusterHealthStore,
        now_ms: u64,
    ) -> usize {
        if self.broadcast_version() != Some(published.version()) {
            let allowed = match self.last_broadcast_ms {
                None => now_ms >= self.first_allowed_broadcast_ms || health.all_reported(),
                Some(last) => now_ms >= last.saturating_add(self.min_time_between_states_ms),
            };
            if allowed {
                tracing::debug!(version = published.version(), "broadcasting new cluster state");
                self.current = Some(published.clone());
                self.last_broadcast_ms = Some(now_ms);
            }
        }
        let Some(state) = self.current.clone() else {
            return 0;
        };

        let version = state.version();
        let mut started = 0;
        for info in health.iter() {
            let node = info.node();
            if info.reported_state().state == State::Down
                || self.last_sent.get(&node) == Some(&version)
            {
                continue;
            }
            self.last_sent.insert(node, version);
            self.spawn_push(node, state.clone());
            started += 1;
        }
        started
    }

    fn spawn_push(&self, node: NodeIdentity, state: Arc<ClusterState>) {
        let communicator = self.communicator.clone();
        let tx = self.ack_tx.clone();
        let generation = self.generation;
        let version = state.version();
        tokio::spawn(async move {
            let result = communicator.set_cluster_state(node, state).await;
            // The receiver only goes away with the broadcaster itself.
            let _ = tx.send(BroadcastAck {
                node,
                version,
                generation,
                result,
            });
        });
    }

    /// Applies acknowledgements that arrived since the last call. Returns the
    /// number applied.
    pub fn drain_acks(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(ack) = self.ack_rx.try_recv() {
            if ack.generation != self.generation {
                continue;
            }
            applied += 1;
            match ack.result {
                Ok(()) => {
                    let acked = self.last_acked.entry(ack.node).or_insert(ack.version);
                    *acked = (*acked).max(ack.version);
                }
                Err(e) => {
                    tracing::warn!(
                        node = %ack.node,
                        version = ack.version,
                        error = %e,
                        "failed to push cluster state, will retry"
                    );
                    if self.last_sent.get(&ack.node) == Some(&ack.version) {
                        self.last_sent.remove(&ack.node);
                    }
                }
            }
        }
        applied
    }

    #[must_use]
    pub fn last_acked_version(&self, node: NodeIdentity) -> Option<u32> {
        self.last_acked.get(&node).copied()
    }

    /// Number of nodes that acknowledged `version` or a later one.
    #[must_use]
    pub fn nodes_acked_at_or_above(&self, version: u32) -> usize {
        self.last_acked.values().filter(|&&v| v >= version).count()
    }

    /// Forgets all bookkeeping. Acknowledgements still in flight are ignored.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.current = None;
        self.last_broadcast_ms = None;
        self.last_sent.clear();
        self.last_acked.clear();
    }
}
