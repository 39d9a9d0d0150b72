//! Maintenance scheduler.
//!
//! Runs the slow periodic jobs on a fixed interval: attendee group pattern
//! mining, meeting cadence measurement, and the proactive detectors. New
//! signals from a pass wake the event trigger so propagation follows
//! without waiting for its poll.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::engine::{MaintenanceReport, SignalEngine};
use crate::signals::event_trigger::wait_for_shutdown;

/// Background task: one maintenance pass per interval until shutdown.
///
/// The first pass runs after the startup delay.
pub async fn run_maintenance_loop(engine: Arc<SignalEngine>, mut shutdown: watch::Receiver<bool>) {
    let scheduler = engine.config().scheduler.clone();

    tokio::select! {
        _ = tokio::time::sleep(scheduler.startup_delay()) => {}
        _ = wait_for_shutdown(&mut shutdown) => return,
    }

    log::info!(
        "Maintenance scheduler: started ({}s interval)",
        scheduler.maintenance_interval().as_secs()
    );

    loop {
        run_pass(&engine).await;

        tokio::select! {
            _ = tokio::time::sleep(scheduler.maintenance_interval()) => {}
            _ = wait_for_shutdown(&mut shutdown) => {
                log::info!("Maintenance scheduler: shutting down");
                return;
            }
        }
    }
}

/// One maintenance pass, run on the blocking pool since it holds the store
/// for the whole pass.
pub async fn run_pass(engine: &Arc<SignalEngine>) -> Option<MaintenanceReport> {
    let started = Instant::now();
    let worker = Arc::clone(engine);
    match tokio::task::spawn_blocking(move || worker.run_maintenance()).await {
        Ok(report) => {
            log::info!(
                "Maintenance scheduler: {} pattern(s), {} cadence signal(s), {} insight(s) in {}ms",
                report.patterns_mined,
                report.cadence_signals.len(),
                report.insights.len(),
                started.elapsed().as_millis()
            );
            Some(report)
        }
        Err(e) => {
            log::error!("Maintenance scheduler: pass failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::AccountEvent;
    use crate::entity::{EntityKey, EntityRecord};
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_pass_runs_detectors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(
            SignalEngine::open_at(dir.path().join("signals.db"), EngineConfig::default()).expect("open"),
        );
        {
            let db = engine.store();
            db.upsert_entity(&EntityRecord::new(EntityKey::account("acme"), "Acme"))
                .expect("account");
            db.upsert_account_event(&AccountEvent {
                account_id: "acme".to_string(),
                event_type: "renewal".to_string(),
                event_date: (Utc::now().date_naive() + Duration::days(20))
                    .format("%Y-%m-%d")
                    .to_string(),
            })
            .expect("renewal");
        }

        let report = run_pass(&engine).await.expect("report");
        assert_eq!(report.insights.len(), 1);

        // Deduplicated on the next pass
        let again = run_pass(&engine).await.expect("report");
        assert!(again.insights.is_empty());
    }

    #[tokio::test]
    async fn test_loop_exits_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig::default();
        config.scheduler.startup_delay_secs = 0;
        let engine = Arc::new(SignalEngine::open_at(dir.path().join("signals.db"), config).expect("open"));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_maintenance_loop(engine, rx));
        tx.send(true).expect("send");
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("stopped")
            .expect("join");
    }
}
