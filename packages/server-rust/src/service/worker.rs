//! Background worker driving the fleet controller.
//!
//! Provides a generic `BackgroundWorker<R>` that feeds tasks from an mpsc channel
//! to a `BackgroundRunnable` and calls it back on a fixed tick interval, and
//! `FleetControllerRunner`, which runs one controller tick per interval and
//! applies operator requests between ticks.

use async_trait::async_trait;
use fleetctl_core::{NodeIdentity, State};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::cluster::{FleetController, WantedStateError};

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Handler executed by `BackgroundWorker`.
///
/// Tasks and ticks are never processed concurrently, so implementors can keep
/// plain mutable state.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Called once per tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// ControllerTask
// ---------------------------------------------------------------------------

/// Requests handled by [`FleetControllerRunner`] between ticks.
#[derive(Debug)]
pub enum ControllerTask {
    SetWantedState {
        node: NodeIdentity,
        state: State,
        description: String,
        reply: oneshot::Sender<Result<(), WantedStateError>>,
    },
    ClearCrashCount {
        node: NodeIdentity,
        reply: oneshot::Sender<Result<(), WantedStateError>>,
    },
    /// Runs a tick right away instead of waiting for the interval.
    TickNow,
}

// ---------------------------------------------------------------------------
// FleetControllerRunner
// ---------------------------------------------------------------------------

/// Owns a [`FleetController`] inside the worker task.
#[derive(Debug)]
pub struct FleetControllerRunner {
    controller: FleetController,
}

impl FleetControllerRunner {
    #[must_use]
    pub fn new(controller: FleetController) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl BackgroundRunnable for FleetControllerRunner {
    type Task = ControllerTask;

    async fn run(&mut self, task: ControllerTask) {
        match task {
            ControllerTask::SetWantedState {
                node,
                state,
                description,
                reply,
            } => {
                let result = self
                    .controller
                    .set_wanted_state(node, state, &description)
                    .await;
                // The requester may have given up waiting.
                let _ = reply.send(result);
            }
            ControllerTask::ClearCrashCount { node, reply } => {
                let _ = reply.send(self.controller.clear_premature_crash_count(node));
            }
            ControllerTask::TickNow => self.controller.tick().await,
        }
    }

    async fn on_tick(&mut self) {
        self.controller.tick().await;
    }

    async fn shutdown(&mut self) {
        tracing::info!(
            cluster = %self.controller.config().cluster_name,
            "fleet controller shutting down"
        );
        self.controller.shutdown().await;
    }
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Runs a `BackgroundRunnable` on its own tokio task.
///
/// The task loop:
/// 1. Listens for tasks on the mpsc channel and hands each to `run()`
/// 2. Calls `on_tick()` every tick interval, skipping ticks it fell behind on
/// 3. Calls `shutdown()` once stopped
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Starts the worker task. The first tick fires one interval after
    /// start. The task channel holds up to 256 tasks.
    pub fn start(mut runnable: R, tick_interval_ms: u64) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(256);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut tick_interval =
                tokio::time::interval(std::time::Duration::from_millis(tick_interval_ms.max(1)));
            tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tick_interval.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = tick_interval.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues a task for the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stops the worker and waits for `shutdown()` to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl BackgroundWorker<FleetControllerRunner> {
    /// Sets a node's wanted state on the running controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone or the controller rejected the
    /// request.
    pub async fn set_wanted_state(
        &self,
        node: NodeIdentity,
        state: State,
        description: impl Into<String>,
    ) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(ControllerTask::SetWantedState {
            node,
            state,
            description: description.into(),
            reply,
        })
        .await?;
        rx.await??;
        Ok(())
    }

    /// Resets a node's premature crash count on the running controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone or the node is unknown.
    pub async fn clear_premature_crash_count(&self, node: NodeIdentity) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(ControllerTask::ClearCrashCount { node, reply })
            .await?;
        rx.await??;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
