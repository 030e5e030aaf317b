//! Node state gathering: one outstanding long-poll per registered node.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetctl_core::{NodeIdentity, NodeState};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::health::ClusterHealthStore;
use super::traits::{CommunicationError, NodeCommunicator};

#[derive(Debug)]
struct NodeStateReply {
    node: NodeIdentity,
    request_id: u64,
    result: Result<NodeState, CommunicationError>,
}

#[derive(Debug)]
struct PendingRequest {
    id: u64,
    deadline_ms: u64,
    handle: JoinHandle<()>,
}

/// Issues `get_node_state` requests and collects their answers.
///
/// Answers are funneled through a channel and picked up by
/// [`drain_replies`](Self::drain_replies), so a slow node never holds up the
/// tick. Deadlines are checked against the controller clock.
pub struct NodeStateGatherer {
    communicator: Arc<dyn NodeCommunicator>,
    timeout_bounds_ms: (u64, u64),
    pending: BTreeMap<NodeIdentity, PendingRequest>,
    next_request_id: u64,
    reply_tx: mpsc::UnboundedSender<NodeStateReply>,
    reply_rx: mpsc::UnboundedReceiver<NodeStateReply>,
}

impl std::fmt::Debug for NodeStateGatherer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStateGatherer")
            .field("timeout_bounds_ms", &self.timeout_bounds_ms)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl NodeStateGatherer {
    /// `timeout_bounds_ms` is the range the per-request timeout is drawn
    /// from.
    #[must_use]
    pub fn new(communicator: Arc<dyn NodeCommunicator>, timeout_bounds_ms: (u64, u64)) -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self {
            communicator,
            timeout_bounds_ms,
            pending: BTreeMap::new(),
            next_request_id: 0,
            reply_tx,
            reply_rx,
        }
    }

    #[must_use]
    pub fn has_pending(&self, node: NodeIdentity) -> bool {
        self.pending.contains_key(&node)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Aborts requests whose deadline has passed. They are re-issued by the
    /// next [`send_requests`](Self::send_requests).
    pub fn expire_requests(&mut self, now_ms: u64) -> usize {
        let expired: Vec<NodeIdentity> = self
            .pending
            .iter()
            .filter(|(_, request)| request.deadline_ms <= now_ms)
            .map(|(node, _)| *node)
            .collect();
        for node in &expired {
            tracing::debug!(node = %node, "node state request passed its deadline");
            self.drop_request(*node);
        }
        expired.len()
    }

    /// Forgets the node's outstanding request, if any.
    pub fn drop_request(&mut self, node: NodeIdentity) {
        if let Some(request) = self.pending.remove(&node) {
            request.handle.abort();
        }
    }

    /// Sends a request to every tracked node in `registered` that has none
    /// outstanding. Returns the number of requests sent.
    pub fn send_requests(
        &mut self,
        health: &ClusterHealthStore,
        registered: &[NodeIdentity],
        now_ms: u64,
    ) -> usize {
        let (earliest, latest) = self.timeout_bounds_ms;
        let mut rng = rand::rng();
        let mut sent = 0;
        for &node in registered {
            if self.pending.contains_key(&node) {
                continue;
            }
            let Some(info) = health.get(node) else {
                tracing::debug!(node = %node, "ignoring unconfigured node in registry");
                continue;
            };
            let known = info.has_reported().then(|| info.reported_state().clone());
            let timeout_ms = rng.random_range(earliest..=latest);

            self.next_request_id += 1;
            let id = self.next_request_id;
            let communicator = self.communicator.clone();
            let tx = self.reply_tx.clone();
            let handle = tokio::spawn(async move {
                let result = communicator.get_node_state(node, known, timeout_ms).await;
                let _ = tx.send(NodeStateReply {
                    node,
                    request_id: id,
                    result,
                });
            });
            self.pending.insert(
                node,
                PendingRequest {
                    id,
                    deadline_ms: now_ms.saturating_add(timeout_ms),
                    handle,
                },
            );
            sent += 1;
        }
        sent
    }

    /// Collects answers that arrived since the last call, in arrival order.
    ///
    /// A failed request becomes a Down state described by the error.
    /// Answers to requests that were dropped in the meantime are discarded.
    pub fn drain_replies(&mut self) -> Vec<(NodeIdentity, NodeState)> {
        let mut replies = Vec::new();
        while let Ok(reply) = self.reply_rx.try_recv() {
            match self.pending.get(&reply.node) {
                Some(request) if request.id == reply.request_id => {
                    self.pending.remove(&reply.node);
                }
                _ => continue,
            }
            let state = match reply.result {
                Ok(state) => state,
                Err(e) => {
                    tracing::debug!(node = %reply.node, error = %e, "node state request failed");
                    NodeState::down().with_description(e.to_string())
                }
            };
            replies.push((reply.node, state));
        }
        replies
    }
}

impl Drop for NodeStateGatherer {
    fn drop(&mut self) {
        for request in self.pending.values() {
            request.handle.abort();
        }
    }
}
