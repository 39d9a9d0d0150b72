//! `dailyos-signals` daemon.
//!
//! Opens the signal store, then runs the event trigger and maintenance
//! loops until Ctrl-C.

use std::sync::Arc;

use tokio::sync::watch;

use dailyos_signals::config::load_config;
use dailyos_signals::scheduler::run_maintenance_loop;
use dailyos_signals::signals::event_trigger::run_event_trigger;
use dailyos_signals::{EngineError, SignalEngine};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("dailyos-signals: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), EngineError> {
    let config = load_config()?;
    let engine = Arc::new(SignalEngine::open(config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let trigger = tokio::spawn(run_event_trigger(Arc::clone(&engine), shutdown_rx.clone()));
    let maintenance = tokio::spawn(run_maintenance_loop(Arc::clone(&engine), shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("dailyos-signals: could not listen for Ctrl-C: {}", e);
    }
    log::info!("dailyos-signals: shutting down");
    // Receivers only fail to get this if they already exited
    let _ = shutdown_tx.send(true);

    trigger.await?;
    maintenance.await?;
    Ok(())
}
