//! Runs a fleet controller against simulated in-process nodes.
//!
//! Every configured node starts out Up. With `--flap-interval-ms` a random
//! storage node is toggled between Up and Down on that interval, so the
//! controller has transitions to act on. On exit the final cluster states and
//! the event log are printed.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fleetctl_core::{NodeIdentity, NodeState, SystemClock};
use fleetctl_server::cluster::{
    FleetController, FleetControllerConfig, InMemoryCoordinationStore, LocalCommunicator,
};
use fleetctl_server::service::{BackgroundWorker, FleetControllerRunner};
use rand::Rng;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "fleetctl-sim")]
#[command(about = "Run a fleet controller against simulated nodes")]
struct Args {
    /// JSON controller configuration. Defaults to a flat cluster.
    #[arg(short, long, env = "FLEETCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Node count of the default flat cluster.
    #[arg(long, default_value_t = 3)]
    nodes: u16,

    /// Stop after this long. Zero runs until Ctrl-C.
    #[arg(long, default_value_t = 0)]
    duration_ms: u64,

    /// Toggle a random storage node on this interval. Zero disables.
    #[arg(long, default_value_t = 0)]
    flap_interval_ms: u64,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info", env = "FLEETCTL_LOG_LEVEL")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, env = "FLEETCTL_JSON_LOGS")]
    json_logs: bool,
}

fn init_tracing(args: &Args) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = tracing_subscriber::registry().with(filter);
    if args.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))
    }
}

fn flap_random_storage_node(
    comm: &LocalCommunicator,
    config: &FleetControllerConfig,
    down: &mut BTreeSet<NodeIdentity>,
) {
    if config.nodes.is_empty() {
        return;
    }
    let mut rng = rand::rng();
    let pick = rng.random_range(0..config.nodes.len());
    let node = NodeIdentity::storage(config.nodes[pick].index);
    let next = if down.remove(&node) {
        NodeState::up()
    } else {
        down.insert(node);
        NodeState::down().with_description("Closed at other end")
    };
    tracing::info!(node = %node, state = %next.compact(node.node_type), "simulated node changes state");
    comm.set_node_state(node, next);
}

async fn wait_for_exit(duration_ms: u64) -> anyhow::Result<()> {
    if duration_ms == 0 {
        tokio::signal::ctrl_c().await.context("listening for Ctrl-C")?;
    } else {
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(duration_ms)) => {}
            res = tokio::signal::ctrl_c() => res.context("listening for Ctrl-C")?,
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config = match &args.config {
        Some(path) => FleetControllerConfig::from_json_file(path)?,
        None => FleetControllerConfig::flat("simulated", args.nodes),
    };
    tracing::info!(
        cluster = %config.cluster_name,
        nodes = config.nodes.len(),
        tick_interval_ms = config.tick_interval_ms,
        "starting simulated fleet controller"
    );

    let comm = Arc::new(LocalCommunicator::with_nodes(config.node_identities()));
    for node in config.node_identities() {
        comm.set_node_state(node, NodeState::up());
    }
    let store = Arc::new(InMemoryCoordinationStore::new());
    let controller = FleetController::new(
        config.clone(),
        Arc::new(SystemClock),
        comm.clone(),
        store,
    );
    let status = controller.status_handle();
    let events = controller.events();
    let mut worker =
        BackgroundWorker::start(FleetControllerRunner::new(controller), config.tick_interval_ms);

    let flapper = (args.flap_interval_ms > 0).then(|| {
        let comm = comm.clone();
        let config = config.clone();
        let interval_ms = args.flap_interval_ms;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.tick().await;
            let mut down = BTreeSet::new();
            loop {
                interval.tick().await;
                flap_random_storage_node(&comm, &config, &mut down);
            }
        })
    });

    let exit = wait_for_exit(args.duration_ms).await;
    if let Some(flapper) = flapper {
        flapper.abort();
    }
    worker.stop().await;
    exit?;

    let status = status.load_full();
    println!("published: {}", status.published);
    println!("consolidated: {}", status.consolidated);
    println!("ticks: {}", status.ticks);
    for event in events.snapshot().iter() {
        println!("{} {event}", event.timestamp_ms);
    }
    Ok(())
}
