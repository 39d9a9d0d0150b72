//! Event-driven resolution and propagation trigger.
//!
//! Background task that resolves newly created events and propagates new
//! signals. Uses the engine's Notify wake signal plus a fallback poll, so a
//! wake that found nobody waiting is still covered.

use std::sync::Arc;

use tokio::sync::watch;

use crate::engine::SignalEngine;

/// Background task: waits for a wake signal or the poll interval, then runs
/// one cycle. Returns when `shutdown` flips to true or its sender is dropped.
pub async fn run_event_trigger(engine: Arc<SignalEngine>, mut shutdown: watch::Receiver<bool>) {
    let scheduler = engine.config().scheduler.clone();

    // Startup delay
    tokio::select! {
        _ = tokio::time::sleep(scheduler.startup_delay()) => {}
        _ = wait_for_shutdown(&mut shutdown) => {
            log::info!("Event trigger: shut down before start");
            return;
        }
    }

    log::info!("Event trigger: started");

    loop {
        run_cycle(&engine).await;

        tokio::select! {
            _ = engine.notified() => {
                log::debug!("Event trigger: woken");
            }
            _ = tokio::time::sleep(scheduler.poll_interval()) => {
                log::debug!("Event trigger: periodic poll");
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                log::info!("Event trigger: shutting down");
                return;
            }
        }
    }
}

/// Resolve events needing it, then propagate whatever that produced.
///
/// Propagation holds the store until it catches up, so it runs on the
/// blocking pool.
pub async fn run_cycle(engine: &Arc<SignalEngine>) {
    if let Err(e) = engine.resolve_pending_events().await {
        log::warn!("Event trigger: resolution pass failed: {}", e);
    }
    let worker = Arc::clone(engine);
    match tokio::task::spawn_blocking(move || worker.run_propagation_cycle()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => log::warn!("Event trigger: propagation failed: {}", e),
        Err(e) => log::error!("Event trigger: propagation task failed: {}", e),
    }
}

/// Resolves once shutdown is requested.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
