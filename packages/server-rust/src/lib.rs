//! Fleet controller server: tracks node health, generates and publishes
//! versioned cluster states, and elects a master among controller replicas.

pub mod cluster;
pub mod service;

pub use cluster::{
    ControllerStatus, CoordinationStore, FleetController, FleetControllerConfig,
    InMemoryCoordinationStore, LocalCommunicator, NodeCommunicator, WantedStateError,
};
pub use service::{BackgroundWorker, ControllerTask, FleetControllerRunner};
