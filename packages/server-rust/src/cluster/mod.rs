//! Fleet controller module.
//!
//! Provides configuration, collaborator traits, per-node health tracking, the
//! state change handler, cluster state generation, versioning, broadcasting,
//! master election, and the tick-driven [`FleetController`] tying them
//! together.

pub mod broadcaster;
pub mod controller;
pub mod election;
pub mod event_log;
pub mod gatherer;
pub mod generator;
pub mod health;
pub mod local;
pub mod metrics;
pub mod state_change;
pub mod traits;
pub mod types;
pub mod version_tracker;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

// types
pub use types::{ConfiguredNode, FleetControllerConfig, GroupConfig, MaxTransitionTimes};

// traits
pub use traits::{CommunicationError, CoordinationStore, MasterTerm, NodeCommunicator, StoreError};

// health
pub use health::{ClusterHealthStore, NodeInfo, NOT_SEEN_IN_REGISTRY};

// state_change
pub use state_change::{RegistryCheck, StateChangeHandler};

// generator
pub use generator::ClusterStateGenerator;

// event_log
pub use event_log::EventLog;

// election
pub use election::{ElectionOutcome, ElectionState, MasterElectionHandler, MasterToken};

// version_tracker
pub use version_tracker::{PublishedState, StateVersionTracker};

// broadcaster
pub use broadcaster::SystemStateBroadcaster;

// gatherer
pub use gatherer::NodeStateGatherer;

// metrics
pub use metrics::MetricUpdater;

// controller
pub use controller::{ControllerStatus, FleetController, WantedStateError};

// local
pub use local::{InMemoryCoordinationStore, LocalCommunicator};

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------
