//! `SignalEngine`: the facade collaborators talk to.
//!
//! Owns the store connection, the reliability learner, the propagation and
//! detector registries, the embedding pool, and the per-event locks that
//! serialize resolution and correction of one event.
//!
//! The store guard is a `parking_lot` mutex and is never held across an
//! `.await`; CPU-bound embedding work runs on the pool with the guard
//! released, and the event is re-checked once it completes.

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::EngineConfig;
use crate::db::{EventRecord, SignalDb};
use crate::embeddings::{EmbeddingModel, EmbeddingPool};
use crate::entity::{EntityKey, EntityRecord};
use crate::error::EngineError;
use crate::proactive::engine::{self as proactive, DetectorContext, ProactiveEngine};
use crate::resolver::{self, producers, ResolutionOutcome};
use crate::signals::bus::{self, SignalEvent};
use crate::signals::callouts::{self, Callout};
use crate::signals::feedback::{self, CorrectionOutcome};
use crate::signals::invalidation::{self, InvalidationEntry};
use crate::signals::payload::{SignalPayload, SignalType};
use crate::signals::propagation::{self, BatchReport, PropagationEngine, RuleContext};
use crate::signals::sampling::ReliabilityLearner;
use crate::signals::{cadence, patterns};
use crate::util::format_timestamp;

/// What one maintenance pass did. A failed step is logged and counted as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub patterns_mined: usize,
    pub cadence_signals: Vec<String>,
    pub insights: Vec<String>,
}

pub struct SignalEngine {
    db: Mutex<SignalDb>,
    config: EngineConfig,
    learner: ReliabilityLearner,
    propagation: PropagationEngine,
    detectors: ProactiveEngine,
    pool: EmbeddingPool,
    event_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    wake: Notify,
}

impl SignalEngine {
    /// Open the store named by `config` (default `~/.dailyos/signals.db`).
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let path = config.db_path()?;
        Self::open_at(path, config)
    }

    /// Open the store at an explicit path.
    pub fn open_at(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let db = SignalDb::open_at(path.as_ref())?;
        Ok(Self::with_store(db, config, Arc::new(EmbeddingModel::new())))
    }

    /// Assemble an engine around an open store and a model.
    pub fn with_store(db: SignalDb, config: EngineConfig, model: Arc<EmbeddingModel>) -> Self {
        let learner = ReliabilityLearner::new(config.reliability.seed, config.reliability.min_updates);
        let pool = EmbeddingPool::new(model, config.embedding_workers);
        log::info!(
            "Signal engine: opened {} ({} embedding workers)",
            db.path().display(),
            pool.workers()
        );
        let propagation = propagation::default_engine();
        let detectors = proactive::default_engine();
        log::debug!(
            "Signal engine: rules [{}], detectors [{}]",
            propagation.rule_names().join(", "),
            detectors.detector_names().join(", ")
        );
        Self {
            db: Mutex::new(db),
            config,
            learner,
            propagation,
            detectors,
            pool,
            event_locks: DashMap::new(),
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lock the store for collaborator writes to the graph mirror.
    ///
    /// Do not hold the guard across an `.await`.
    pub fn store(&self) -> MutexGuard<'_, SignalDb> {
        self.db.lock()
    }

    /// Run `f` with the store locked.
    pub fn with_db<T>(&self, f: impl FnOnce(&SignalDb) -> T) -> T {
        let db = self.db.lock();
        f(&db)
    }

    // -----------------------------------------------------------------------
    // Signal bus
    // -----------------------------------------------------------------------

    /// Append a signal and wake the trigger so propagation picks it up.
    pub fn emit_signal(
        &self,
        source: &str,
        signal_type: SignalType,
        target: &EntityKey,
        confidence: f64,
        context_tag: Option<&str>,
        metadata: SignalPayload,
    ) -> Result<String, EngineError> {
        let id = {
            let db = self.db.lock();
            bus::emit_signal(&db, source, signal_type, target, confidence, context_tag, metadata)?
        };
        self.wake();
        Ok(id)
    }

    /// Signals on `entity`, newest first, optionally bounded by `since`.
    pub fn get_active_signals(&self, entity: &EntityKey, since: Option<&str>) -> Result<Vec<SignalEvent>, EngineError> {
        let db = self.db.lock();
        Ok(bus::get_active_signals(&db, entity, since)?)
    }

    // -----------------------------------------------------------------------
    // Resolution and feedback
    // -----------------------------------------------------------------------

    /// Resolve which entity a meeting belongs to.
    ///
    /// Calls for the same event run one at a time.
    pub async fn resolve_entity(&self, event_id: &str) -> Result<ResolutionOutcome, EngineError> {
        let lock = self.event_lock(event_id);
        let result = {
            let _serial = lock.lock().await;
            self.resolve_serialized(event_id).await
        };
        drop(lock);
        self.release_event_lock(event_id);
        if result.is_ok() {
            self.wake();
        }
        result
    }

    async fn resolve_serialized(&self, event_id: &str) -> Result<ResolutionOutcome, EngineError> {
        let (event, mut signals, entities) = {
            let db = self.db.lock();
            let event = load_live_event(&db, event_id)?;
            let signals = resolver::gather_store_signals(&db, &self.config.resolution, &event);
            let entities: Vec<EntityRecord> = db.list_resolution_targets()?;
            (event, signals, entities)
        };

        let text = event.search_text();
        let threshold = self.config.resolution.embedding_similarity_threshold;
        match self
            .pool
            .run(move |model| producers::signal_embedding_similarity(model, &text, &entities, threshold))
            .await
        {
            Ok(embedded) => signals.extend(embedded),
            Err(e) => log::warn!("Entity resolver: embedding producer failed for {}: {}", event_id, e),
        }

        let db = self.db.lock();
        // The event or candidates may have been archived while embedding ran
        let event = match db.get_event(&event.id)? {
            Some(current) if !current.archived => current,
            _ => {
                log::debug!("Entity resolver: event {} went away during resolution", event_id);
                return Err(EngineError::EntityUnavailable(format!("event {}", event_id)));
            }
        };
        let mut signals = resolver::retain_active(&db, signals)?;
        resolver::add_correlation_signals(&db, &self.config.resolution, &event, &mut signals);
        Ok(resolver::finalize(&db, &self.config, &self.learner, &event, signals)?)
    }

    /// Record that `event_id` actually belongs to `corrected`.
    pub async fn record_correction(
        &self,
        event_id: &str,
        corrected: &EntityKey,
    ) -> Result<CorrectionOutcome, EngineError> {
        let lock = self.event_lock(event_id);
        let result = {
            let _serial = lock.lock().await;
            let db = self.db.lock();
            self.correct_locked(&db, event_id, corrected)
        };
        drop(lock);
        self.release_event_lock(event_id);
        if result.is_ok() {
            self.wake();
        }
        result
    }

    fn correct_locked(
        &self,
        db: &SignalDb,
        event_id: &str,
        corrected: &EntityKey,
    ) -> Result<CorrectionOutcome, EngineError> {
        if db.get_event(event_id)?.is_none() {
            return Err(EngineError::EventNotFound(event_id.to_string()));
        }
        if !db.entity_is_active(corrected)? {
            return Err(EngineError::EntityUnavailable(corrected.to_string()));
        }
        Ok(feedback::record_correction(db, event_id, corrected)?)
    }

    fn event_lock(&self, event_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.event_locks
                .entry(event_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        )
    }

    /// Drop the lock entry once no other caller holds a handle to it.
    fn release_event_lock(&self, event_id: &str) {
        self.event_locks.remove_if(event_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    // -----------------------------------------------------------------------
    // Callouts and invalidation
    // -----------------------------------------------------------------------

    /// Ranked callouts for a briefing about `context`.
    pub async fn get_callouts(&self, context: &str, limit: Option<usize>) -> Result<Vec<Callout>, EngineError> {
        let now = Utc::now();
        let limit = limit.unwrap_or(self.config.callouts.default_limit);
        let candidates = {
            let db = self.db.lock();
            callouts::callout_candidates(&db, &self.config, now)?
        };
        if candidates.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let context = context.to_string();
        self.pool
            .run(move |model| callouts::assemble_callouts(model, candidates, &context, limit, now))
            .await
    }

    /// Re-check recent signals on `entity` and queue stale artifacts.
    /// Returns the artifact ids newly queued.
    pub fn invalidate_if_needed(&self, entity: &EntityKey) -> Result<Vec<String>, EngineError> {
        let db = self.db.lock();
        Ok(invalidation::invalidate_if_needed(&db, &self.config, entity, Utc::now())?)
    }

    /// Hand up to `limit` pending invalidations to the regenerator.
    pub fn drain_invalidations(&self, limit: usize) -> Result<Vec<InvalidationEntry>, EngineError> {
        let db = self.db.lock();
        Ok(invalidation::drain_invalidations(&db, limit)?)
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    /// Wake the trigger loop. A wake with no waiter is kept for the next wait.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.wake.notified()
    }

    /// Propagate every signal after the cursor, batch by batch, until caught up.
    ///
    /// Derived signals land after the cursor and are propagated in the
    /// following batch, so chains settle within one cycle.
    pub fn run_propagation_cycle(&self) -> Result<BatchReport, EngineError> {
        let batch_size = self.config.scheduler.propagation_batch_size.max(1);
        let db = self.db.lock();
        let now = Utc::now();
        let ctx = RuleContext::new(now, &self.config);
        let config = &self.config;
        let mut observer = |store: &SignalDb, signal: &SignalEvent| {
            invalidation::on_signal(store, config, signal, now).map(|_| ())
        };

        let mut total = BatchReport {
            cursor: db.get_cursor(propagation::PROPAGATION_CURSOR)?,
            ..Default::default()
        };
        loop {
            let report = self.propagation.run_batch(&db, &ctx, batch_size, &mut observer)?;
            total.processed += report.processed;
            total.cursor = report.cursor;
            total.propagation.derived_ids.extend(report.propagation.derived_ids);
            total.propagation.duplicates += report.propagation.duplicates;
            total.propagation.rule_failures.extend(report.propagation.rule_failures);
            if report.processed == 0 {
                break;
            }
        }

        if !total.propagation.derived_ids.is_empty() {
            log::info!(
                "Propagation: {} signal(s) processed, {} derived",
                total.processed,
                total.propagation.derived_ids.len()
            );
        }
        Ok(total)
    }

    /// Resolve recent events that have neither a resolution signal nor a link.
    ///
    /// Events archived or deleted in the meantime are skipped; other
    /// failures are logged and the remaining events still run.
    pub async fn resolve_pending_events(&self) -> Result<Vec<ResolutionOutcome>, EngineError> {
        let since = format_timestamp(Utc::now() - Duration::minutes(self.config.scheduler.lookback_minutes));
        let pending: Vec<EventRecord> = {
            let db = self.db.lock();
            db.get_unresolved_events_since(&since)?
        };
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        log::info!("Entity resolution trigger: {} event(s) need resolution", pending.len());

        let mut outcomes = Vec::with_capacity(pending.len());
        for event in &pending {
            match self.resolve_entity(&event.id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_discardable() => {
                    log::debug!("Entity resolution trigger: skipping {}: {}", event.id, e)
                }
                Err(e) => log::warn!("Entity resolution trigger: {} failed: {}", event.id, e),
            }
        }
        Ok(outcomes)
    }

    /// Mine group patterns, compute cadence signals, run detectors.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let now = Utc::now();
        let db = self.db.lock();
        let mut report = MaintenanceReport::default();

        match patterns::mine_attendee_patterns(&db, now) {
            Ok(n) => report.patterns_mined = n,
            Err(e) => log::warn!("Maintenance: pattern mining failed: {}", e),
        }
        match cadence::compute_and_emit_cadence(&db, now) {
            Ok(ids) => report.cadence_signals = ids,
            Err(e) => log::warn!("Maintenance: cadence failed: {}", e),
        }
        match self.detectors.run_scan(&db, &DetectorContext::at(now)) {
            Ok(ids) => report.insights = ids,
            Err(e) => log::warn!("Maintenance: proactive scan failed: {}", e),
        }
        drop(db);

        if !report.cadence_signals.is_empty() || !report.insights.is_empty() {
            self.wake();
        }
        report
    }
}

fn load_live_event(db: &SignalDb, event_id: &str) -> Result<EventRecord, EngineError> {
    let event = db
        .get_event(event_id)?
        .ok_or_else(|| EngineError::EventNotFound(event_id.to_string()))?;
    if event.archived {
        return Err(EngineError::EntityUnavailable(format!("event {}", event_id)));
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ArtifactRecord;
    use crate::resolver::ResolutionTier;
    use crate::util::now_timestamp;

    fn engine() -> (tempfile::TempDir, SignalEngine) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig::default();
        config.reliability.seed = Some(42);
        let engine = SignalEngine::open_at(dir.path().join("signals.db"), config).expect("open");
        (dir, engine)
    }

    fn add_event(engine: &SignalEngine, id: &str, title: &str) {
        engine
            .store()
            .upsert_event(&EventRecord {
                id: id.to_string(),
                title: title.to_string(),
                description: None,
                participants: vec![],
                start_time: now_timestamp(),
                created_at: now_timestamp(),
                archived: false,
            })
            .expect("event");
    }

    #[tokio::test]
    async fn test_resolve_missing_event_is_not_found() {
        let (_dir, engine) = engine();
        let err = engine.resolve_entity("nope").await.expect_err("missing");
        assert!(matches!(err, EngineError::EventNotFound(_)));
        assert!(engine.event_locks.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_archived_event_is_unavailable() {
        let (_dir, engine) = engine();
        add_event(&engine, "m1", "Acme sync");
        engine.store().archive_event("m1").expect("archive");
        let err = engine.resolve_entity("m1").await.expect_err("archived");
        assert!(matches!(err, EngineError::EntityUnavailable(_)));
        assert!(err.is_discardable());
    }

    #[tokio::test]
    async fn test_resolve_by_junction_links_event() {
        let (_dir, engine) = engine();
        let acme = EntityKey::account("acme");
        engine
            .store()
            .upsert_entity(&EntityRecord::new(acme.clone(), "Acme"))
            .expect("entity");
        add_event(&engine, "m1", "Weekly sync");
        engine.store().link_event_entity("m1", &acme, "user").expect("link");

        let outcome = engine.resolve_entity("m1").await.expect("resolve");
        assert_eq!(outcome.tier, ResolutionTier::Resolved);
        assert_eq!(outcome.entity, Some(acme));
    }

    #[tokio::test]
    async fn test_correction_requires_live_entity() {
        let (_dir, engine) = engine();
        add_event(&engine, "m1", "Weekly sync");
        let err = engine
            .record_correction("m1", &EntityKey::account("ghost"))
            .await
            .expect_err("unknown entity");
        assert!(matches!(err, EngineError::EntityUnavailable(_)));

        let err = engine
            .record_correction("missing", &EntityKey::account("ghost"))
            .await
            .expect_err("unknown event");
        assert!(matches!(err, EngineError::EventNotFound(_)));
    }

    #[test]
    fn test_emit_and_read_back() {
        let (_dir, engine) = engine();
        let key = EntityKey::person("p1");
        let id = engine
            .emit_signal("clay", SignalType::TitleChange, &key, 0.9, Some("briefing"), SignalPayload::Empty)
            .expect("emit");
        let signals = engine.get_active_signals(&key, None).expect("read");
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].id, id);
        assert_eq!(signals[0].context_tag.as_deref(), Some("briefing"));
    }

    #[test]
    fn test_propagation_cycle_catches_up_and_invalidates() {
        let (_dir, engine) = engine();
        let acme = EntityKey::account("acme");
        {
            let db = engine.store();
            db.upsert_entity(&EntityRecord::new(acme.clone(), "Acme")).expect("account");
            db.upsert_entity(&EntityRecord::new(EntityKey::person("p1"), "Pat")).expect("person");
            db.link_person(&crate::db::PersonLink {
                person_id: "p1".to_string(),
                entity: acme.clone(),
                role: None,
            })
            .expect("link");
            db.register_artifact(&ArtifactRecord {
                id: "brief-1".to_string(),
                kind: "briefing".to_string(),
                entity: acme.clone(),
                created_at: now_timestamp(),
                consumed_at: None,
            })
            .expect("artifact");
        }
        engine
            .emit_signal(
                "clay",
                SignalType::TitleChange,
                &EntityKey::person("p1"),
                0.9,
                None,
                SignalPayload::Empty,
            )
            .expect("emit");

        let report = engine.run_propagation_cycle().expect("cycle");
        // Source plus the derived stakeholder_change
        assert_eq!(report.processed, 2);
        assert_eq!(report.propagation.derived_ids.len(), 1);

        let again = engine.run_propagation_cycle().expect("idle cycle");
        assert_eq!(again.processed, 0);
        assert_eq!(again.cursor, report.cursor);

        let drained = engine.drain_invalidations(10).expect("drain");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].artifact_id, "brief-1");
        assert_eq!(drained[0].reason, "stakeholder_change");
    }

    #[tokio::test]
    async fn test_wake_permit_survives_without_waiter() {
        let (_dir, engine) = engine();
        engine.wake();
        tokio::time::timeout(std::time::Duration::from_secs(1), engine.notified())
            .await
            .expect("stored permit");
    }
}
