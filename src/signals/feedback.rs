//! Correction recording and reliability updates.
//!
//! When a user corrects an event-entity assignment, this module:
//! 1. Rewards every source that proposed the corrected entity (alpha += 1)
//! 2. Penalizes every other contributing source (beta += 1)
//! 3. Records a feedback row per previously linked entity
//! 4. Emits a `user_correction` resolution signal and relinks the event
//!
//! All of it commits in one transaction. Corrections only shape future
//! weighting; past resolutions are not re-run.

use std::collections::BTreeSet;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{DbError, SignalDb};
use crate::entity::{EntityKey, EntityType};
use crate::util::now_timestamp;

use super::bus::{self, NewSignal};
use super::payload::{CandidateSummary, SignalPayload, SignalType};

pub const USER_CORRECTION_SOURCE: &str = "user_correction";

/// A row from `signal_weights`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalWeight {
    pub source: String,
    pub signal_type: String,
    pub alpha: f64,
    pub beta: f64,
    pub update_count: i64,
}

/// A row from `resolution_feedback`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionFeedback {
    pub id: String,
    pub event_id: String,
    pub old_entity: Option<EntityKey>,
    pub new_entity: EntityKey,
    pub signal_source: Option<String>,
    pub corrected_at: String,
}

/// What a correction changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionOutcome {
    pub signal_id: String,
    pub rewarded_sources: Vec<String>,
    pub penalized_sources: Vec<String>,
    pub previous_entities: Vec<EntityKey>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Record a user correction of `event_id` to `corrected` and update weights.
pub fn record_correction(db: &SignalDb, event_id: &str, corrected: &EntityKey) -> Result<CorrectionOutcome, DbError> {
    db.with_transaction(|tx| {
        // The latest attempt made by the resolver, not an earlier correction
        let latest = bus::get_resolution_signals_for_event(tx, event_id)?
            .into_iter()
            .find(|s| s.source != USER_CORRECTION_SOURCE);

        let (contributing, candidates) = match latest.map(|s| s.metadata) {
            Some(SignalPayload::EntityResolution {
                contributing_sources,
                candidates,
                ..
            }) => (contributing_sources, candidates),
            _ => (Vec::new(), Vec::new()),
        };

        let rewarded: BTreeSet<String> = candidates
            .iter()
            .filter(|c| c.entity == *corrected)
            .flat_map(|c| c.sources.iter().cloned())
            .collect();
        let penalized: BTreeSet<String> = contributing
            .iter()
            .filter(|s| !rewarded.contains(*s))
            .cloned()
            .collect();

        for source in &rewarded {
            tx.upsert_signal_weight(source, SignalType::EntityResolution.as_str(), 1.0, 0.0)?;
        }
        for source in &penalized {
            tx.upsert_signal_weight(source, SignalType::EntityResolution.as_str(), 0.0, 1.0)?;
        }

        let previous: Vec<EntityKey> = tx
            .get_event_entities(event_id)?
            .into_iter()
            .map(|link| link.entity)
            .collect();

        if previous.is_empty() {
            tx.insert_resolution_feedback(event_id, None, corrected, None)?;
        }
        for old in &previous {
            let wrong_source = candidates
                .iter()
                .find(|c| c.entity == *old)
                .and_then(|c| c.sources.first().cloned());
            tx.insert_resolution_feedback(event_id, Some(old), corrected, wrong_source.as_deref())?;
        }

        let signal = NewSignal::new(USER_CORRECTION_SOURCE, SignalType::EntityResolution, corrected.clone(), 1.0)
            .with_payload(SignalPayload::EntityResolution {
                event_id: event_id.to_string(),
                tier: "resolved".to_string(),
                contributing_sources: vec![USER_CORRECTION_SOURCE.to_string()],
                candidates: vec![CandidateSummary {
                    entity: corrected.clone(),
                    confidence: 1.0,
                    sources: vec![USER_CORRECTION_SOURCE.to_string()],
                }],
                corrected_from: previous.clone(),
            });
        let signal_id = bus::emit(tx, &signal)?;

        tx.replace_event_entities(event_id, corrected, "user")?;

        log::info!(
            "Correction recorded for event {}: -> {} (rewarded {:?}, penalized {:?})",
            event_id,
            corrected,
            rewarded,
            penalized
        );

        Ok(CorrectionOutcome {
            signal_id,
            rewarded_sources: rewarded.into_iter().collect(),
            penalized_sources: penalized.into_iter().collect(),
            previous_entities: previous,
        })
    })
}

// ---------------------------------------------------------------------------
// SignalDb methods
// ---------------------------------------------------------------------------

impl SignalDb {
    /// Increment alpha/beta for a `(source, signal_type)` pair.
    ///
    /// A missing row starts at the Beta(1, 1) prior plus the deltas.
    pub fn upsert_signal_weight(
        &self,
        source: &str,
        signal_type: &str,
        alpha_delta: f64,
        beta_delta: f64,
    ) -> Result<(), DbError> {
        self.conn_ref().execute(
            "INSERT INTO signal_weights (source, signal_type, alpha, beta, update_count, updated_at)
             VALUES (?1, ?2, 1.0 + ?3, 1.0 + ?4, 1, ?5)
             ON CONFLICT (source, signal_type) DO UPDATE SET
                alpha = alpha + ?3,
                beta = beta + ?4,
                update_count = update_count + 1,
                updated_at = ?5",
            params![source, signal_type, alpha_delta, beta_delta, now_timestamp()],
        )?;
        Ok(())
    }

    pub fn get_signal_weight(&self, source: &str, signal_type: &str) -> Result<Option<SignalWeight>, DbError> {
        let weight = self
            .conn_ref()
            .query_row(
                "SELECT source, signal_type, alpha, beta, update_count FROM signal_weights
                 WHERE source = ?1 AND signal_type = ?2",
                params![source, signal_type],
                |row| {
                    Ok(SignalWeight {
                        source: row.get(0)?,
                        signal_type: row.get(1)?,
                        alpha: row.get(2)?,
                        beta: row.get(3)?,
                        update_count: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(weight)
    }

    pub fn insert_resolution_feedback(
        &self,
        event_id: &str,
        old_entity: Option<&EntityKey>,
        new_entity: &EntityKey,
        signal_source: Option<&str>,
    ) -> Result<(), DbError> {
        let id = format!("fb-{}", Uuid::new_v4());
        self.conn_ref().execute(
            "INSERT INTO resolution_feedback
                (id, event_id, old_entity_type, old_entity_id, new_entity_type, new_entity_id, signal_source, corrected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                event_id,
                old_entity.map(|k| k.entity_type.as_str()),
                old_entity.map(|k| k.entity_id.as_str()),
                new_entity.entity_type.as_str(),
                new_entity.entity_id,
                signal_source,
                now_timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get_feedback_for_event(&self, event_id: &str) -> Result<Vec<ResolutionFeedback>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT id, event_id, old_entity_type, old_entity_id, new_entity_type, new_entity_id,
                    signal_source, corrected_at
             FROM resolution_feedback
             WHERE event_id = ?1
             ORDER BY corrected_at, id",
        )?;
        let rows = stmt.query_map([event_id], |row| {
            let old_type: Option<String> = row.get(2)?;
            let old_id: Option<String> = row.get(3)?;
            let new_type: String = row.get(4)?;
            Ok(ResolutionFeedback {
                id: row.get(0)?,
                event_id: row.get(1)?,
                old_entity: match (old_type, old_id) {
                    (Some(t), Some(id)) => Some(EntityKey::new(EntityType::from_str_lossy(&t), id)),
                    _ => None,
                },
                new_entity: EntityKey::new(EntityType::from_str_lossy(&new_type), row.get::<_, String>(5)?),
                signal_source: row.get(6)?,
                corrected_at: row.get(7)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    fn resolution_payload(event_id: &str, candidates: Vec<(EntityKey, Vec<&str>)>) -> SignalPayload {
        let mut contributing: BTreeSet<String> = BTreeSet::new();
        let candidates: Vec<CandidateSummary> = candidates
            .into_iter()
            .map(|(entity, sources)| {
                contributing.extend(sources.iter().map(|s| s.to_string()));
                CandidateSummary {
                    entity,
                    confidence: 0.7,
                    sources: sources.iter().map(|s| s.to_string()).collect(),
                }
            })
            .collect();
        SignalPayload::EntityResolution {
            event_id: event_id.to_string(),
            tier: "flagged".to_string(),
            contributing_sources: contributing.into_iter().collect(),
            candidates,
            corrected_from: vec![],
        }
    }

    #[test]
    fn test_upsert_weight_from_prior() {
        let db = test_db();
        db.upsert_signal_weight("keyword", "entity_resolution", 0.0, 1.0).expect("upsert");
        let w = db.get_signal_weight("keyword", "entity_resolution").expect("get").expect("row");
        assert_eq!((w.alpha, w.beta, w.update_count), (1.0, 2.0, 1));

        db.upsert_signal_weight("keyword", "entity_resolution", 1.0, 0.0).expect("upsert");
        let w = db.get_signal_weight("keyword", "entity_resolution").expect("get").expect("row");
        assert_eq!((w.alpha, w.beta, w.update_count), (2.0, 2.0, 2));
    }

    #[test]
    fn test_correction_rewards_and_penalizes() {
        let db = test_db();
        let wrong = EntityKey::account("globex");
        let right = EntityKey::account("acme");
        let payload = resolution_payload(
            "m1",
            vec![
                (wrong.clone(), vec!["keyword", "embedding"]),
                (right.clone(), vec!["attendee_vote", "embedding"]),
            ],
        );
        bus::emit(
            &db,
            &NewSignal::new("keyword", SignalType::EntityResolution, wrong.clone(), 0.7).with_payload(payload),
        )
        .expect("emit");
        db.link_event_entity("m1", &wrong, "auto_resolution").expect("link");

        let outcome = record_correction(&db, "m1", &right).expect("correct");
        assert_eq!(outcome.rewarded_sources, vec!["attendee_vote", "embedding"]);
        assert_eq!(outcome.penalized_sources, vec!["keyword"]);
        assert_eq!(outcome.previous_entities, vec![wrong.clone()]);

        let vote = db.get_signal_weight("attendee_vote", "entity_resolution").expect("get").expect("row");
        assert_eq!((vote.alpha, vote.beta), (2.0, 1.0));
        let kw = db.get_signal_weight("keyword", "entity_resolution").expect("get").expect("row");
        assert_eq!((kw.alpha, kw.beta), (1.0, 2.0));
        let emb = db.get_signal_weight("embedding", "entity_resolution").expect("get").expect("row");
        assert_eq!((emb.alpha, emb.beta), (2.0, 1.0), "a source that also backed the right entity is not penalized");

        let links = db.get_event_entities("m1").expect("links");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].entity, right);
        assert_eq!(links[0].link_source, "user");

        let feedback = db.get_feedback_for_event("m1").expect("feedback");
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].old_entity, Some(wrong));
        assert_eq!(feedback[0].signal_source.as_deref(), Some("keyword"));

        let latest = bus::get_resolution_signals_for_event(&db, "m1").expect("signals");
        assert_eq!(latest[0].source, USER_CORRECTION_SOURCE);
        assert_eq!(latest[0].confidence, 1.0);
    }

    #[test]
    fn test_correction_without_prior_attempt() {
        let db = test_db();
        let right = EntityKey::project("p1");
        let outcome = record_correction(&db, "m2", &right).expect("correct");
        assert!(outcome.rewarded_sources.is_empty());
        assert!(outcome.penalized_sources.is_empty());

        let feedback = db.get_feedback_for_event("m2").expect("feedback");
        assert_eq!(feedback.len(), 1);
        assert!(feedback[0].old_entity.is_none());
        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM signal_weights", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_second_correction_uses_resolver_attempt() {
        let db = test_db();
        let a = EntityKey::account("a");
        let b = EntityKey::account("b");
        let payload = resolution_payload("m3", vec![(a.clone(), vec!["keyword"])]);
        bus::emit(&db, &NewSignal::new("keyword", SignalType::EntityResolution, a.clone(), 0.6).with_payload(payload))
            .expect("emit");

        record_correction(&db, "m3", &b).expect("first");
        record_correction(&db, "m3", &a).expect("second");

        let kw = db.get_signal_weight("keyword", "entity_resolution").expect("get").expect("row");
        assert_eq!((kw.alpha, kw.beta, kw.update_count), (2.0, 2.0, 2));
        assert!(db.get_signal_weight(USER_CORRECTION_SOURCE, "entity_resolution").expect("get").is_none());
    }
}
