//! Confidence-scored entity resolution for events.
//!
//! A cascade of independent producers each propose candidate entities for
//! an event:
//! 1. Junction table (existing event → entity links)
//! 2. Attendee vote (participant → entity links)
//! 3. Attendee group patterns (learned from past meetings)
//! 4. Keyword and fuzzy matching on title and description
//! 5. Embedding similarity against entity reference text
//! 6. Email threads before the event (corroboration only)
//!
//! Per candidate, signals are fused in log-odds space with each source's
//! base weight scaled by its sampled reliability. The best candidate's
//! confidence picks the tier, and every attempt is recorded on the bus.

pub mod producers;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, ResolutionConfig};
use crate::db::{DbError, EventRecord, SignalDb};
use crate::embeddings::EmbeddingModel;
use crate::entity::{EntityKey, EntityRecord};
use crate::error::EngineError;
use crate::signals::bus::{self, NewSignal};
use crate::signals::correlation;
use crate::signals::decay;
use crate::signals::fusion;
use crate::signals::patterns;
use crate::signals::payload::{CandidateSummary, SignalPayload, SignalType};
use crate::signals::sampling::ReliabilityLearner;

/// Source recorded on resolver `entity_resolution` signals.
pub const RESOLVER_SOURCE: &str = "entity_resolver";
/// `link_source` written when a resolved outcome is auto-linked.
pub const AUTO_LINK_SOURCE: &str = "auto_resolution";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A single piece of evidence from one producer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionSignal {
    pub entity: EntityKey,
    pub confidence: f64,
    pub source: String,
}

impl ResolutionSignal {
    pub fn new(entity: EntityKey, confidence: f64, source: &str) -> Self {
        Self {
            entity,
            confidence,
            source: source.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTier {
    /// Auto-linked.
    Resolved,
    /// Best guess, flagged for review.
    Flagged,
    /// Surfaced as a suggestion, not linked.
    Suggestion,
    /// Candidates existed but none was strong enough.
    Discarded,
    /// No producer proposed anything.
    Unresolved,
}

impl ResolutionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionTier::Resolved => "resolved",
            ResolutionTier::Flagged => "flagged",
            ResolutionTier::Suggestion => "suggestion",
            ResolutionTier::Discarded => "discarded",
            ResolutionTier::Unresolved => "unresolved",
        }
    }

    /// Tiers that name a winning entity.
    pub fn has_entity(&self) -> bool {
        matches!(
            self,
            ResolutionTier::Resolved | ResolutionTier::Flagged | ResolutionTier::Suggestion
        )
    }
}

/// Tier for a fused confidence. Lower bounds are inclusive.
pub fn classify_tier(confidence: f64, config: &ResolutionConfig) -> ResolutionTier {
    if confidence >= config.resolved_threshold {
        ResolutionTier::Resolved
    } else if confidence >= config.flagged_threshold {
        ResolutionTier::Flagged
    } else if confidence >= config.suggestion_threshold {
        ResolutionTier::Suggestion
    } else {
        ResolutionTier::Discarded
    }
}

/// Result of one resolution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionOutcome {
    pub event_id: String,
    pub entity: Option<EntityKey>,
    pub confidence: f64,
    pub tier: ResolutionTier,
    pub contributing_sources: Vec<String>,
    /// Strongest first.
    pub candidates: Vec<CandidateSummary>,
    /// The `entity_resolution` signal recording this attempt.
    pub signal_id: String,
}

// ---------------------------------------------------------------------------
// Producer cascade
// ---------------------------------------------------------------------------

fn collect(
    signals: &mut Vec<ResolutionSignal>,
    producer: &str,
    event_id: &str,
    result: Result<Vec<ResolutionSignal>, DbError>,
) {
    match result {
        Ok(found) => signals.extend(found),
        Err(e) => log::warn!("Entity resolver: {} producer failed for event {}: {}", producer, event_id, e),
    }
}

/// Producers that read the store: junction, attendee vote, group pattern,
/// keyword. A failing producer is logged and skipped.
pub fn gather_store_signals(db: &SignalDb, config: &ResolutionConfig, event: &EventRecord) -> Vec<ResolutionSignal> {
    let mut signals = Vec::new();
    collect(&mut signals, "junction", &event.id, producers::signal_junction_lookup(db, event));
    collect(&mut signals, "attendee_vote", &event.id, producers::signal_attendee_vote(db, event));
    collect(
        &mut signals,
        "group_pattern",
        &event.id,
        patterns::signal_attendee_group_pattern(db, event),
    );
    collect(
        &mut signals,
        "keyword",
        &event.id,
        db.list_resolution_targets()
            .map(|entities| producers::signal_keyword_match(event, &entities, config.fuzzy_threshold)),
    );
    signals
}

/// Add `email_thread` corroboration for entities already proposed.
pub fn add_correlation_signals(
    db: &SignalDb,
    config: &ResolutionConfig,
    event: &EventRecord,
    signals: &mut Vec<ResolutionSignal>,
) {
    let candidates: BTreeSet<EntityKey> = signals.iter().map(|s| s.entity.clone()).collect();
    collect(
        signals,
        "email_thread",
        &event.id,
        correlation::correlate_messages(db, event, &candidates, config.correlation_window_hours),
    );
}

/// Drop signals for entities archived or deleted since they were produced.
pub fn retain_active(db: &SignalDb, signals: Vec<ResolutionSignal>) -> Result<Vec<ResolutionSignal>, DbError> {
    let mut active: HashMap<EntityKey, bool> = HashMap::new();
    let mut out = Vec::with_capacity(signals.len());
    for signal in signals {
        let is_active = match active.get(&signal.entity) {
            Some(v) => *v,
            None => {
                let v = db.entity_is_active(&signal.entity)?;
                active.insert(signal.entity.clone(), v);
                v
            }
        };
        if is_active {
            out.push(signal);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Fusion and recording
// ---------------------------------------------------------------------------

/// Fuse the signals, pick a winner and record the attempt.
///
/// Writes one `entity_resolution` signal (target is the winner, or the event
/// itself when nothing qualified) and, for a resolved outcome, the junction
/// link. Both commit together.
pub fn finalize(
    db: &SignalDb,
    config: &EngineConfig,
    learner: &ReliabilityLearner,
    event: &EventRecord,
    signals: Vec<ResolutionSignal>,
) -> Result<ResolutionOutcome, DbError> {
    // entity -> source -> strongest confidence from that source
    let mut grouped: BTreeMap<EntityKey, BTreeMap<String, f64>> = BTreeMap::new();
    for signal in signals {
        let confidence = bus::clamp_confidence(signal.confidence);
        let slot = grouped.entry(signal.entity).or_default().entry(signal.source).or_insert(0.0);
        if confidence > *slot {
            *slot = confidence;
        }
    }

    // One reliability draw per source per attempt, in source order
    let sources: BTreeSet<String> = grouped.values().flat_map(|m| m.keys().cloned()).collect();
    let mut weights: HashMap<String, f64> = HashMap::new();
    for source in &sources {
        let sampled = learner.sample_reliability(db, source, SignalType::EntityResolution.as_str())?;
        weights.insert(source.clone(), fusion::signal_weight(&config.profile_for(source), sampled));
    }

    let mut candidates: Vec<CandidateSummary> = Vec::with_capacity(grouped.len());
    let mut best: Option<(EntityKey, f64)> = None;
    for (entity, by_source) in &grouped {
        let pairs: Vec<(f64, f64)> = by_source
            .iter()
            .map(|(source, confidence)| {
                let half_life = config.profile_for(source).decay_half_life_days;
                (
                    decay::decay(*confidence, 0.0, half_life),
                    weights.get(source).copied().unwrap_or(0.0),
                )
            })
            .collect();
        let fused = fusion::fuse(&pairs);
        // Strictly greater keeps the smallest key on ties
        if best.as_ref().map(|(_, c)| fused > *c).unwrap_or(true) {
            best = Some((entity.clone(), fused));
        }
        candidates.push(CandidateSummary {
            entity: entity.clone(),
            confidence: fused,
            sources: by_source.keys().cloned().collect(),
        });
    }
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entity.cmp(&b.entity))
    });

    let (tier, winner, confidence) = match best {
        None => (ResolutionTier::Unresolved, None, 0.0),
        Some((entity, confidence)) => {
            let tier = classify_tier(confidence, &config.resolution);
            let winner = tier.has_entity().then_some(entity);
            (tier, winner, confidence)
        }
    };
    let contributing_sources: Vec<String> = sources.into_iter().collect();

    let target = winner.clone().unwrap_or_else(|| EntityKey::event(event.id.clone()));
    let signal = NewSignal::new(RESOLVER_SOURCE, SignalType::EntityResolution, target, confidence).with_payload(
        SignalPayload::EntityResolution {
            event_id: event.id.clone(),
            tier: tier.as_str().to_string(),
            contributing_sources: contributing_sources.clone(),
            candidates: candidates.clone(),
            corrected_from: Vec::new(),
        },
    );

    let signal_id = db.with_transaction(|tx| {
        let id = bus::emit(tx, &signal)?;
        if tier == ResolutionTier::Resolved {
            if let Some(ref entity) = winner {
                // A link that already exists, such as a user correction, keeps its source
                tx.link_event_entity_if_absent(&event.id, entity, AUTO_LINK_SOURCE)?;
            }
        }
        Ok::<_, DbError>(id)
    })?;

    match winner {
        Some(ref entity) => log::info!(
            "Entity resolver: event {} -> {} ({}, {:.3}) via {}",
            event.id,
            entity,
            tier.as_str(),
            confidence,
            contributing_sources.join(", ")
        ),
        None => log::debug!("Entity resolver: event {} {}", event.id, tier.as_str()),
    }

    Ok(ResolutionOutcome {
        event_id: event.id.clone(),
        entity: winner,
        confidence,
        tier,
        contributing_sources,
        candidates,
        signal_id,
    })
}

/// Run the whole cascade in the calling thread.
///
/// The engine splits this around the embedding pool; this form serves
/// synchronous callers and tests.
pub fn resolve_event(
    db: &SignalDb,
    config: &EngineConfig,
    learner: &ReliabilityLearner,
    model: &EmbeddingModel,
    event_id: &str,
) -> Result<ResolutionOutcome, EngineError> {
    let event = db
        .get_event(event_id)?
        .ok_or_else(|| EngineError::EventNotFound(event_id.to_string()))?;
    if event.archived {
        return Err(EngineError::EntityUnavailable(format!("event {}", event_id)));
    }

    let mut signals = gather_store_signals(db, &config.resolution, &event);
    let entities: Vec<EntityRecord> = db.list_resolution_targets()?;
    signals.extend(producers::signal_embedding_similarity(
        model,
        &event.search_text(),
        &entities,
        config.resolution.embedding_similarity_threshold,
    ));
    add_correlation_signals(db, &config.resolution, &event, &mut signals);

    Ok(finalize(db, config, learner, &event, signals)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::util::now_timestamp;

    fn event(db: &SignalDb, id: &str, title: &str) -> EventRecord {
        let record = EventRecord {
            id: id.to_string(),
            title: title.to_string(),
            description: None,
            participants: vec![],
            start_time: now_timestamp(),
            created_at: now_timestamp(),
            archived: false,
        };
        db.upsert_event(&record).expect("event");
        record
    }

    #[test]
    fn test_tier_boundaries() {
        let config = ResolutionConfig::default();
        assert_eq!(classify_tier(0.85, &config), ResolutionTier::Resolved);
        assert_eq!(classify_tier(0.84, &config), ResolutionTier::Flagged);
        assert_eq!(classify_tier(0.60, &config), ResolutionTier::Flagged);
        assert_eq!(classify_tier(0.30, &config), ResolutionTier::Suggestion);
        assert_eq!(classify_tier(0.29, &config), ResolutionTier::Discarded);
    }

    #[test]
    fn test_no_candidates_is_unresolved_and_recorded() {
        let db = test_db();
        let config = EngineConfig::default();
        let learner = ReliabilityLearner::seeded(7);
        let e = event(&db, "m1", "Lunch");

        let outcome = finalize(&db, &config, &learner, &e, Vec::new()).expect("finalize");
        assert_eq!(outcome.tier, ResolutionTier::Unresolved);
        assert!(outcome.entity.is_none());

        let recorded = bus::get_signal(&db, &outcome.signal_id).expect("get").expect("present");
        assert_eq!(recorded.target, EntityKey::event("m1"));
        assert_eq!(recorded.metadata.event_id(), Some("m1"));
    }

    #[test]
    fn test_junction_resolves_and_links() {
        let db = test_db();
        let config = EngineConfig::default();
        let learner = ReliabilityLearner::seeded(7);
        let e = event(&db, "m1", "Sync");
        let acme = EntityKey::account("acme");

        let outcome = finalize(
            &db,
            &config,
            &learner,
            &e,
            vec![ResolutionSignal::new(acme.clone(), 0.95, "junction")],
        )
        .expect("finalize");
        // 0.95 at weight 0.8 fuses to ~0.913
        assert!((outcome.confidence - 0.913).abs() < 0.005, "got {}", outcome.confidence);
        assert_eq!(outcome.tier, ResolutionTier::Resolved);
        let links = db.get_event_entities("m1").expect("links");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].link_source, AUTO_LINK_SOURCE);
    }

    #[test]
    fn test_resolving_again_keeps_user_link() {
        let db = test_db();
        let config = EngineConfig::default();
        let learner = ReliabilityLearner::seeded(7);
        let acme = EntityKey::account("acme");
        db.upsert_entity(&EntityRecord::new(acme.clone(), "Acme")).expect("entity");
        event(&db, "m1", "Weekly sync");
        crate::signals::feedback::record_correction(&db, "m1", &acme).expect("correct");

        let e = db.get_event("m1").expect("get").expect("present");
        let signals = gather_store_signals(&db, &config.resolution, &e);
        let outcome = finalize(&db, &config, &learner, &e, signals).expect("finalize");
        assert_eq!(outcome.tier, ResolutionTier::Resolved);

        let links = db.get_event_entities("m1").expect("links");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].entity, acme);
        assert_eq!(links[0].link_source, "user");
    }

    #[test]
    fn test_flagged_is_not_linked() {
        let db = test_db();
        let config = EngineConfig::default();
        let learner = ReliabilityLearner::seeded(7);
        let e = event(&db, "m1", "Acme sync");

        let outcome = finalize(
            &db,
            &config,
            &learner,
            &e,
            vec![ResolutionSignal::new(EntityKey::account("acme"), 0.80, "keyword")],
        )
        .expect("finalize");
        assert_eq!(outcome.tier, ResolutionTier::Flagged);
        assert!(db.get_event_entities("m1").expect("links").is_empty());
    }

    #[test]
    fn test_ties_break_on_entity_key() {
        let db = test_db();
        let config = EngineConfig::default();
        let learner = ReliabilityLearner::seeded(7);
        let e = event(&db, "m1", "Sync");

        let outcome = finalize(
            &db,
            &config,
            &learner,
            &e,
            vec![
                ResolutionSignal::new(EntityKey::project("zeta"), 0.65, "keyword"),
                ResolutionSignal::new(EntityKey::account("beta"), 0.65, "keyword"),
                ResolutionSignal::new(EntityKey::account("alpha"), 0.65, "keyword"),
            ],
        )
        .expect("finalize");
        assert_eq!(outcome.entity, Some(EntityKey::account("alpha")));
        assert_eq!(outcome.candidates.len(), 3);
        assert_eq!(outcome.contributing_sources, vec!["keyword".to_string()]);
    }

    #[test]
    fn test_agreeing_sources_compound() {
        let db = test_db();
        let config = EngineConfig::default();
        let learner = ReliabilityLearner::seeded(7);
        let e = event(&db, "m1", "Sync");
        let acme = EntityKey::account("acme");

        let outcome = finalize(
            &db,
            &config,
            &learner,
            &e,
            vec![
                ResolutionSignal::new(acme.clone(), 0.80, "keyword"),
                ResolutionSignal::new(acme.clone(), 0.70, "attendee_vote"),
                ResolutionSignal::new(acme.clone(), 0.60, "email_thread"),
            ],
        )
        .expect("finalize");
        assert!(outcome.confidence > 0.80);
        assert_eq!(outcome.candidates[0].sources.len(), 3);
    }

    #[test]
    fn test_resolve_event_keyword_scenario() {
        let db = test_db();
        let config = EngineConfig::default();
        let learner = ReliabilityLearner::seeded(7);
        let model = EmbeddingModel::new();
        db.upsert_entity(
            &EntityRecord::new(EntityKey::project("p-ai"), "Sales AI Pilot").with_keywords(&["Agentforce"]),
        )
        .expect("project");
        event(&db, "m1", "Agentforce Demo");

        let outcome = resolve_event(&db, &config, &learner, &model, "m1").expect("resolve");
        assert_eq!(outcome.entity, Some(EntityKey::project("p-ai")));
        assert!(matches!(
            outcome.tier,
            ResolutionTier::Suggestion | ResolutionTier::Flagged | ResolutionTier::Resolved
        ));
    }

    #[test]
    fn test_resolve_missing_or_archived_event() {
        let db = test_db();
        let config = EngineConfig::default();
        let learner = ReliabilityLearner::seeded(7);
        let model = EmbeddingModel::new();
        assert!(matches!(
            resolve_event(&db, &config, &learner, &model, "nope"),
            Err(EngineError::EventNotFound(_))
        ));
        event(&db, "m1", "Sync");
        db.archive_event("m1").expect("archive");
        assert!(matches!(
            resolve_event(&db, &config, &learner, &model, "m1"),
            Err(EngineError::EntityUnavailable(_))
        ));
    }
}
