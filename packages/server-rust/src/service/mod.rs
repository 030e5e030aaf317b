//! Long-running services around the fleet controller.
//!
//! The [`worker`] module hosts the controller on a background task that ticks
//! it on a fixed interval and serializes operator requests with the ticks.

pub mod worker;

pub use worker::{BackgroundRunnable, BackgroundWorker, ControllerTask, FleetControllerRunner};
