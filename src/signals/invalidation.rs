//! Signal-driven artifact invalidation.
//!
//! When enough evidence of a material change accumulates on an entity, every
//! unconsumed artifact built from that entity (meeting briefs, summaries) is
//! queued for regeneration. Evidence is the fused, decayed confidence of
//! same-type signals on the entity within the invalidation window.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::{DbError, SignalDb};
use crate::entity::{EntityKey, EntityType};
use crate::util::{format_timestamp, now_timestamp};

use super::bus::{self, SignalEvent};
use super::decay;
use super::fusion;
use super::payload::SignalType;

/// A row from `invalidation_queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEntry {
    pub id: String,
    pub artifact_id: String,
    pub entity: EntityKey,
    pub reason: String,
    pub queued_at: String,
    pub processed_at: Option<String>,
}

fn is_invalidating(config: &EngineConfig, signal_type: &SignalType) -> bool {
    config
        .invalidation
        .signal_types
        .iter()
        .any(|t| t == signal_type.as_str())
}

/// Fused decayed confidence of `signal_type` signals on `entity` inside the
/// window. Each signal carries weight 1.0.
pub fn windowed_confidence(
    db: &SignalDb,
    config: &EngineConfig,
    entity: &EntityKey,
    signal_type: &SignalType,
    now: DateTime<Utc>,
) -> Result<f64, DbError> {
    let since = format_timestamp(now - Duration::hours(config.invalidation.window_hours));
    let pairs: Vec<(f64, f64)> = bus::get_entity_signals_of_type(db, entity, signal_type, &since)?
        .iter()
        .map(|s| {
            let half_life = config.profile_for(&s.source).decay_half_life_days;
            (decay::decayed_confidence(s.confidence, &s.created_at, half_life, now), 1.0)
        })
        .collect();
    if pairs.is_empty() {
        return Ok(0.0);
    }
    Ok(fusion::fuse(&pairs))
}

fn enqueue_for_entity(db: &SignalDb, entity: &EntityKey, reason: &str) -> Result<Vec<String>, DbError> {
    let mut queued = Vec::new();
    for artifact in db.get_unconsumed_artifacts(entity)? {
        if db.enqueue_invalidation(&artifact.id, entity, reason)? {
            log::info!(
                "Invalidation: queued {} {} due to {} on {}",
                artifact.kind,
                artifact.id,
                reason,
                entity
            );
            queued.push(artifact.id);
        }
    }
    Ok(queued)
}

/// React to one new signal. Returns the artifact ids newly queued.
pub fn on_signal(
    db: &SignalDb,
    config: &EngineConfig,
    signal: &SignalEvent,
    now: DateTime<Utc>,
) -> Result<Vec<String>, DbError> {
    if !is_invalidating(config, &signal.signal_type) {
        return Ok(Vec::new());
    }
    let confidence = windowed_confidence(db, config, &signal.target, &signal.signal_type, now)?;
    if confidence < config.invalidation.threshold {
        log::debug!(
            "Invalidation: {} on {} below threshold ({:.3})",
            signal.signal_type,
            signal.target,
            confidence
        );
        return Ok(Vec::new());
    }
    enqueue_for_entity(db, &signal.target, signal.signal_type.as_str())
}

/// Re-check every invalidating signal type on `entity`.
pub fn invalidate_if_needed(
    db: &SignalDb,
    config: &EngineConfig,
    entity: &EntityKey,
    now: DateTime<Utc>,
) -> Result<Vec<String>, DbError> {
    let mut queued = Vec::new();
    for label in &config.invalidation.signal_types {
        let signal_type = SignalType::parse(label);
        let confidence = windowed_confidence(db, config, entity, &signal_type, now)?;
        if confidence >= config.invalidation.threshold {
            queued.extend(enqueue_for_entity(db, entity, signal_type.as_str())?);
        }
    }
    Ok(queued)
}

/// Hand up to `limit` pending entries to the regenerator, oldest first, and
/// mark them processed.
pub fn drain_invalidations(db: &SignalDb, limit: usize) -> Result<Vec<InvalidationEntry>, DbError> {
    db.with_transaction(|tx| {
        let mut entries = tx.get_pending_invalidations(limit)?;
        let processed_at = now_timestamp();
        for entry in &mut entries {
            tx.mark_invalidation_processed(&entry.id, &processed_at)?;
            entry.processed_at = Some(processed_at.clone());
        }
        Ok(entries)
    })
}

// ---------------------------------------------------------------------------
// SignalDb methods
// ---------------------------------------------------------------------------

impl SignalDb {
    /// Queue an artifact unless it already has a pending entry.
    /// Returns true if a row was inserted.
    pub fn enqueue_invalidation(&self, artifact_id: &str, entity: &EntityKey, reason: &str) -> Result<bool, DbError> {
        let inserted = self.conn_ref().execute(
            "INSERT INTO invalidation_queue (id, artifact_id, entity_type, entity_id, reason, queued_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6
             WHERE NOT EXISTS (
                SELECT 1 FROM invalidation_queue WHERE artifact_id = ?2 AND processed_at IS NULL
             )",
            params![
                format!("inv-{}", Uuid::new_v4()),
                artifact_id,
                entity.entity_type.as_str(),
                entity.entity_id,
                reason,
                now_timestamp(),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_pending_invalidations(&self, limit: usize) -> Result<Vec<InvalidationEntry>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT id, artifact_id, entity_type, entity_id, reason, queued_at, processed_at
             FROM invalidation_queue
             WHERE processed_at IS NULL
             ORDER BY queued_at, rowid
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let entity_type: String = row.get(2)?;
            Ok(InvalidationEntry {
                id: row.get(0)?,
                artifact_id: row.get(1)?,
                entity: EntityKey::new(EntityType::from_str_lossy(&entity_type), row.get::<_, String>(3)?),
                reason: row.get(4)?,
                queued_at: row.get(5)?,
                processed_at: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn mark_invalidation_processed(&self, id: &str, processed_at: &str) -> Result<(), DbError> {
        self.conn_ref().execute(
            "UPDATE invalidation_queue SET processed_at = ?2 WHERE id = ?1",
            params![id, processed_at],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::ArtifactRecord;
    use crate::signals::bus::NewSignal;

    fn brief(db: &SignalDb, id: &str, entity: &EntityKey) {
        db.register_artifact(&ArtifactRecord {
            id: id.to_string(),
            kind: "meeting_brief".to_string(),
            entity: entity.clone(),
            created_at: now_timestamp(),
            consumed_at: None,
        })
        .expect("artifact");
    }

    fn emit(db: &SignalDb, signal_type: SignalType, entity: &EntityKey, confidence: f64) -> SignalEvent {
        let id = bus::emit(db, &NewSignal::new("propagation", signal_type, entity.clone(), confidence)).expect("emit");
        bus::get_signal(db, &id).expect("get").expect("present")
    }

    #[test]
    fn test_low_confidence_skipped() {
        let db = test_db();
        let config = EngineConfig::default();
        let acme = EntityKey::account("acme");
        brief(&db, "b1", &acme);
        let signal = emit(&db, SignalType::StakeholderChange, &acme, 0.50);
        assert!(on_signal(&db, &config, &signal, Utc::now()).expect("on_signal").is_empty());
    }

    #[test]
    fn test_irrelevant_type_skipped() {
        let db = test_db();
        let config = EngineConfig::default();
        let acme = EntityKey::account("acme");
        brief(&db, "b1", &acme);
        let signal = emit(&db, SignalType::EntityResolution, &acme, 0.95);
        assert!(on_signal(&db, &config, &signal, Utc::now()).expect("on_signal").is_empty());
    }

    #[test]
    fn test_weak_signals_accumulate() {
        let db = test_db();
        let config = EngineConfig::default();
        let acme = EntityKey::account("acme");
        brief(&db, "b1", &acme);

        let first = emit(&db, SignalType::ChampionRisk, &acme, 0.65);
        assert!(on_signal(&db, &config, &first, Utc::now()).expect("first").is_empty());

        // Two agreeing 0.65 signals fuse to ~0.78
        let second = emit(&db, SignalType::ChampionRisk, &acme, 0.65);
        assert_eq!(on_signal(&db, &config, &second, Utc::now()).expect("second"), vec!["b1".to_string()]);
    }

    #[test]
    fn test_pending_and_consumed_not_requeued() {
        let db = test_db();
        let config = EngineConfig::default();
        let acme = EntityKey::account("acme");
        brief(&db, "b1", &acme);
        brief(&db, "b2", &acme);
        db.mark_artifact_consumed("b2").expect("consume");

        let signal = emit(&db, SignalType::RenewalRiskEscalation, &acme, 0.9);
        assert_eq!(on_signal(&db, &config, &signal, Utc::now()).expect("once").len(), 1);
        assert!(on_signal(&db, &config, &signal, Utc::now()).expect("twice").is_empty());
        assert!(invalidate_if_needed(&db, &config, &acme, Utc::now()).expect("recheck").is_empty());
    }

    #[test]
    fn test_drain_marks_processed() {
        let db = test_db();
        let config = EngineConfig::default();
        let acme = EntityKey::account("acme");
        brief(&db, "b1", &acme);
        emit(&db, SignalType::EngagementWarning, &acme, 0.9);

        assert_eq!(invalidate_if_needed(&db, &config, &acme, Utc::now()).expect("check").len(), 1);
        let drained = drain_invalidations(&db, 10).expect("drain");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].reason, "engagement_warning");
        assert!(drained[0].processed_at.is_some());
        assert!(drain_invalidations(&db, 10).expect("drain again").is_empty());

        // Processed entries no longer block a fresh invalidation
        assert_eq!(invalidate_if_needed(&db, &config, &acme, Utc::now()).expect("again").len(), 1);
    }
}
