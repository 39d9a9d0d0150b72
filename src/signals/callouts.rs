//! Briefing callout generation.
//!
//! Turns recent high-confidence signals into short callouts for the daily
//! briefing, ranked by embedding similarity to a context string (today's
//! meetings, a prep document). Callouts are ephemeral and never persisted.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::db::{DbError, SignalDb};
use crate::embeddings::EmbeddingModel;
use crate::entity::{EntityKey, EntityType};
use crate::util::format_timestamp;

use super::bus::{self, SignalEvent};
use super::decay;
use super::payload::{SignalPayload, SignalType};
use super::relevance;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }

    pub fn classify(signal_type: &SignalType, confidence: f64) -> Self {
        if *signal_type == SignalType::RenewalRiskEscalation || confidence >= 0.85 {
            Severity::Critical
        } else if confidence >= 0.70 {
            Severity::Warning
        } else {
            Severity::Info
        }
    }
}

/// A callout to surface in the daily briefing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Callout {
    pub signal_id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub headline: String,
    pub detail: String,
    pub severity: Severity,
    pub relevance: f64,
    pub generated_at: String,
}

/// A signal that cleared the confidence bar, with what callout text needs.
#[derive(Debug, Clone)]
pub struct CalloutCandidate {
    pub signal: SignalEvent,
    /// Decayed as of generation time.
    pub confidence: f64,
    pub entity_name: Option<String>,
}

/// Signal types that produce callouts.
pub const CALLOUT_SIGNAL_TYPES: &[SignalType] = &[
    SignalType::StakeholderChange,
    SignalType::ChampionRisk,
    SignalType::RenewalRiskEscalation,
    SignalType::RenewalAtRisk,
    SignalType::EngagementWarning,
    SignalType::ProjectHealthWarning,
    SignalType::ProactiveInsight,
];

// ---------------------------------------------------------------------------
// Callout generation
// ---------------------------------------------------------------------------

/// Recent callout-type signals whose decayed confidence clears the bar.
///
/// Only the newest signal per (entity, type) is kept.
pub fn callout_candidates(
    db: &SignalDb,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<Vec<CalloutCandidate>, DbError> {
    let since = format_timestamp(now - Duration::hours(config.callouts.window_hours));
    let signals = bus::get_recent_signals_of_types(db, CALLOUT_SIGNAL_TYPES, &since)?;

    let mut seen: HashSet<(EntityKey, SignalType)> = HashSet::new();
    let mut out = Vec::new();
    for signal in signals {
        if !seen.insert((signal.target.clone(), signal.signal_type.clone())) {
            continue;
        }
        let half_life = config.profile_for(&signal.source).decay_half_life_days;
        let confidence = decay::decayed_confidence(signal.confidence, &signal.created_at, half_life, now);
        if confidence < config.callouts.min_confidence {
            continue;
        }
        let entity_name = db.get_entity(&signal.target)?.map(|e| e.name);
        out.push(CalloutCandidate {
            signal,
            confidence,
            entity_name,
        });
    }
    Ok(out)
}

/// Rank candidates against `context` and build at most `limit` callouts.
///
/// Critical first, then by relevance, then by confidence.
pub fn assemble_callouts(
    model: &EmbeddingModel,
    candidates: Vec<CalloutCandidate>,
    context: &str,
    limit: usize,
    now: DateTime<Utc>,
) -> Vec<Callout> {
    let signals: Vec<SignalEvent> = candidates.iter().map(|c| c.signal.clone()).collect();
    let ranked = relevance::rank(model, &signals, context);
    let generated_at = format_timestamp(now);

    let mut scored: Vec<(Callout, f64)> = ranked
        .into_iter()
        .filter_map(|(signal, score)| {
            let candidate = candidates.iter().find(|c| c.signal.id == signal.id)?;
            let (headline, detail) = build_callout_text(candidate);
            Some((
                Callout {
                    signal_id: signal.id.clone(),
                    entity_id: signal.target.entity_id.clone(),
                    entity_type: signal.target.entity_type,
                    headline,
                    detail,
                    severity: Severity::classify(&signal.signal_type, candidate.confidence),
                    relevance: score,
                    generated_at: generated_at.clone(),
                },
                candidate.confidence,
            ))
        })
        .collect();

    scored.sort_by(|(a, ca), (b, cb)| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| b.relevance.partial_cmp(&a.relevance).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| cb.partial_cmp(ca).unwrap_or(std::cmp::Ordering::Equal))
    });
    scored.truncate(limit);
    scored.into_iter().map(|(callout, _)| callout).collect()
}

/// Generate callouts in one call.
pub fn generate_callouts(
    db: &SignalDb,
    config: &EngineConfig,
    model: &EmbeddingModel,
    context: &str,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<Callout>, DbError> {
    let candidates = callout_candidates(db, config, now)?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    Ok(assemble_callouts(model, candidates, context, limit, now))
}

fn build_callout_text(candidate: &CalloutCandidate) -> (String, String) {
    let signal = &candidate.signal;
    let name = candidate
        .entity_name
        .clone()
        .unwrap_or_else(|| signal.target.entity_id.clone());

    let headline = match &signal.signal_type {
        SignalType::StakeholderChange => format!("Stakeholder change at {}", name),
        SignalType::ChampionRisk => format!("Champion risk at {}", name),
        SignalType::RenewalRiskEscalation => format!("Renewal risk: champion departure at {}", name),
        SignalType::RenewalAtRisk => format!("{} renewal at risk", name),
        SignalType::EngagementWarning => format!("Engagement declining with {}", name),
        SignalType::ProjectHealthWarning => format!("Project health concern: {}", name),
        other => match &signal.metadata {
            SignalPayload::Insight { headline, .. } => headline.clone(),
            _ => format!("{}: {}", other.display_label(), name),
        },
    };

    let detail = match &signal.metadata {
        SignalPayload::Insight { detail, .. } => detail.clone(),
        SignalPayload::Empty => signal.signal_type.display_label(),
        payload => payload.describe(),
    };

    (headline, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::entity::EntityRecord;
    use crate::signals::bus::NewSignal;

    fn emit(db: &SignalDb, signal_type: SignalType, entity: &EntityKey, confidence: f64, detail: &str) -> String {
        let signal = NewSignal::new("propagation", signal_type, entity.clone(), confidence).with_payload(
            SignalPayload::Note { text: detail.to_string() },
        );
        bus::emit(db, &signal).expect("emit")
    }

    #[test]
    fn test_severity_classification() {
        assert_eq!(Severity::classify(&SignalType::ChampionRisk, 0.9), Severity::Critical);
        assert_eq!(Severity::classify(&SignalType::ChampionRisk, 0.75), Severity::Warning);
        assert_eq!(Severity::classify(&SignalType::ChampionRisk, 0.6), Severity::Info);
        assert_eq!(Severity::classify(&SignalType::RenewalRiskEscalation, 0.6), Severity::Critical);
    }

    #[test]
    fn test_filters_low_confidence_and_other_types() {
        let db = test_db();
        let config = EngineConfig::default();
        let model = EmbeddingModel::new();
        let acme = EntityKey::account("acme");
        emit(&db, SignalType::ChampionRisk, &acme, 0.40, "weak");
        emit(&db, SignalType::TitleChange, &acme, 0.95, "not a callout type");

        let callouts = generate_callouts(&db, &config, &model, "", 5, Utc::now()).expect("callouts");
        assert!(callouts.is_empty());
    }

    #[test]
    fn test_critical_first_and_limit() {
        let db = test_db();
        let config = EngineConfig::default();
        let model = EmbeddingModel::new();
        db.upsert_entity(&EntityRecord::new(EntityKey::account("acme"), "Acme Corp")).expect("entity");
        emit(&db, SignalType::EngagementWarning, &EntityKey::account("acme"), 0.75, "fewer meetings");
        let critical = emit(&db, SignalType::RenewalAtRisk, &EntityKey::account("acme"), 0.9, "silence");
        emit(&db, SignalType::ProjectHealthWarning, &EntityKey::project("p1"), 0.7, "overdue");

        let callouts = generate_callouts(&db, &config, &model, "", 2, Utc::now()).expect("callouts");
        assert_eq!(callouts.len(), 2);
        assert_eq!(callouts[0].signal_id, critical);
        assert_eq!(callouts[0].severity, Severity::Critical);
        assert_eq!(callouts[0].headline, "Acme Corp renewal at risk");
        assert_eq!(callouts[1].severity, Severity::Warning);
    }

    #[test]
    fn test_relevance_orders_within_severity() {
        let db = test_db();
        let config = EngineConfig::default();
        let model = EmbeddingModel::new();
        emit(&db, SignalType::ChampionRisk, &EntityKey::account("globex"), 0.75, "team offsite lunch");
        let relevant = emit(
            &db,
            SignalType::EngagementWarning,
            &EntityKey::account("acme"),
            0.75,
            "acme quarterly business review cadence",
        );

        let callouts =
            generate_callouts(&db, &config, &model, "acme quarterly business review", 5, Utc::now()).expect("callouts");
        assert_eq!(callouts.len(), 2);
        assert_eq!(callouts[0].signal_id, relevant);
        assert!(callouts[0].relevance > callouts[1].relevance);
    }

    #[test]
    fn test_newest_signal_per_entity_and_type() {
        let db = test_db();
        let config = EngineConfig::default();
        let model = EmbeddingModel::new();
        let acme = EntityKey::account("acme");
        emit(&db, SignalType::ChampionRisk, &acme, 0.8, "first");
        let newest = emit(&db, SignalType::ChampionRisk, &acme, 0.8, "second");

        let callouts = generate_callouts(&db, &config, &model, "", 5, Utc::now()).expect("callouts");
        assert_eq!(callouts.len(), 1);
        assert_eq!(callouts[0].signal_id, newest);
        assert_eq!(callouts[0].detail, "second");
    }
}
