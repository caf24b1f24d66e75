mod cli;
mod demo;
mod html;
mod server;
mod sessions;

use actix_web::web;
use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, select};
use tracing::{info, warn};
use tracking::{MemoryStore, TrackerConfig, config::load_seed, telemetry};

use crate::{
    cli::{Cli, Command},
    server::ServerState,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    match Cli::parse().command {
        Command::Serve(args) => serve(TrackerConfig::try_from(args)?),
        Command::Aggregate(args) => cli::run_aggregate(args),
    }
}

fn serve(config: TrackerConfig) -> Result<()> {
    let _telemetry = telemetry::enter_runtime(&config.telemetry, config.verbose);
    telemetry::init_metrics_recorder();

    let store = match config.seed_path.as_deref() {
        Some(path) => {
            info!("loading store tree from {}", path.display());
            MemoryStore::with_tree(load_seed(path)?)
        }
        None => MemoryStore::new(),
    };
    let state = web::Data::new(ServerState::new(
        store.into(),
        config.presenter,
        config.stale_after,
        config.retry,
    ));

    if config.demo {
        demo::start(&state).context("Failed to start demo mode")?;
    }

    let server = server::spawn_server(state.clone(), config.bind_address())
        .context("Failed to start HTTP server")?;

    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    }) {
        warn!("Failed to install Ctrl+C handler: {err}");
    }

    let exited = server.exited().clone();
    info!("bus tracker running; press Ctrl+C to stop");
    select! {
        recv(shutdown_rx) -> _ => info!("shutdown requested"),
        recv(exited) -> _ => warn!("HTTP server stopped unexpectedly"),
    }

    server.stop();
    state.sessions.stop_all();
    info!("bus tracker stopped");
    Ok(())
}
