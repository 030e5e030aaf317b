//! Fleet controller core: node and cluster states, the wire cluster-state
//! codec, events, and the Event Diff Calculator.

pub mod annotated;
pub mod clock;
pub mod cluster_state;
pub mod event;
pub mod event_diff;
pub mod node;

pub use annotated::{AnnotatedClusterState, ClusterStateReason, NodeStateReason};
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use cluster_state::{ClusterState, ClusterStateParseError};
pub use event::{Event, EventKind, EventScope};
pub use event_diff::compute_event_diff;
pub use node::{
    NodeIdentity, NodeState, NodeType, State, DEFAULT_DISTRIBUTION_BITS,
    LISTING_BUCKETS_INIT_PROGRESS_LIMIT,
};
