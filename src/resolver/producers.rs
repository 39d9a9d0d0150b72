//! Resolution signal producers.
//!
//! Each producer looks at one kind of evidence and proposes candidate
//! entities with a raw confidence. Producers never see each other's output
//! (correlation aside, which only corroborates existing candidates).

use std::collections::{BTreeMap, HashSet};

use unicode_normalization::UnicodeNormalization;

use crate::db::{DbError, EventRecord, SignalDb};
use crate::embeddings::{cosine_similarity, EmbeddingModel};
use crate::entity::{EntityKey, EntityRecord, EntityType};
use crate::util::normalize_emails;

use super::ResolutionSignal;

pub const JUNCTION_CONFIDENCE: f64 = 0.95;
pub const NAME_MATCH_CONFIDENCE: f64 = 0.80;
pub const KEYWORD_MATCH_CONFIDENCE: f64 = 0.65;
pub const FUZZY_MATCH_CONFIDENCE: f64 = 0.55;
const ATTENDEE_VOTE_CAP: f64 = 0.90;
const RECURRENCE_CAP: usize = 5;

const QUERY_PREFIX: &str = "search_query: ";
const DOCUMENT_PREFIX: &str = "search_document: ";

// ---------------------------------------------------------------------------
// Junction
// ---------------------------------------------------------------------------

/// Existing event → entity links. Confidence 0.95 per link.
pub fn signal_junction_lookup(db: &SignalDb, event: &EventRecord) -> Result<Vec<ResolutionSignal>, DbError> {
    let mut seen = HashSet::new();
    let mut signals = Vec::new();
    for link in db.get_event_entities(&event.id)? {
        if !link.entity.entity_type.is_resolution_target() || !db.entity_is_active(&link.entity)? {
            continue;
        }
        if seen.insert(link.entity.clone()) {
            signals.push(ResolutionSignal::new(link.entity, JUNCTION_CONFIDENCE, "junction"));
        }
    }
    Ok(signals)
}

// ---------------------------------------------------------------------------
// Attendee vote
// ---------------------------------------------------------------------------

/// Participant → entity majority vote.
///
/// Each known participant votes for every account or project they are
/// linked to. Confidence is `0.5 + 0.4 * share + 0.02 * recurrence`, capped
/// at 0.90, where recurrence counts earlier linked meetings with the entity
/// sharing a participant (at most 5).
pub fn signal_attendee_vote(db: &SignalDb, event: &EventRecord) -> Result<Vec<ResolutionSignal>, DbError> {
    let participants = normalize_emails(&event.participants);
    if participants.is_empty() {
        return Ok(Vec::new());
    }

    let total = participants.len() as f64;
    let mut votes: BTreeMap<EntityKey, usize> = BTreeMap::new();
    for email in &participants {
        let Some(person) = db.get_person_by_email(email)? else {
            continue;
        };
        let mut voted = HashSet::new();
        for link in db.get_links_for_person(&person.key.entity_id)? {
            if !link.entity.entity_type.is_resolution_target() || link.entity.entity_type == EntityType::Person {
                continue;
            }
            // One vote per participant per entity
            if voted.insert(link.entity.clone()) {
                *votes.entry(link.entity).or_insert(0) += 1;
            }
        }
    }

    let mut signals = Vec::new();
    for (entity, count) in votes {
        if !db.entity_is_active(&entity)? {
            continue;
        }
        let recurrence = db
            .count_linked_events_sharing_participants(&entity, &participants, &event.id)?
            .min(RECURRENCE_CAP);
        let confidence =
            (0.5 + 0.4 * (count as f64 / total) + 0.02 * recurrence as f64).min(ATTENDEE_VOTE_CAP);
        signals.push(ResolutionSignal::new(entity, confidence, "attendee_vote"));
    }
    Ok(signals)
}

// ---------------------------------------------------------------------------
// Keyword and fuzzy match
// ---------------------------------------------------------------------------

/// Keyword matching against entity names and keyword lists.
///
/// Name found in title/description: 0.80. Keyword found: 0.65. Otherwise a
/// Jaro-Winkler score at or above `fuzzy_threshold` between the name and any
/// word or adjacent word pair: 0.55 under the `keyword_fuzzy` source.
pub fn signal_keyword_match(
    event: &EventRecord,
    entities: &[EntityRecord],
    fuzzy_threshold: f64,
) -> Vec<ResolutionSignal> {
    let search_text = normalize_text(&event.search_text());
    if search_text.trim().is_empty() {
        return Vec::new();
    }
    let search_key = normalize_key(&search_text);
    let tokens = build_fuzzy_tokens(&search_text);

    let mut signals = Vec::new();
    for entity in entities.iter().filter(|e| keyword_target(e)) {
        let name_key = normalize_key(&normalize_text(&entity.name));
        if !name_key.is_empty() && search_key.contains(&name_key) {
            signals.push(ResolutionSignal::new(entity.key.clone(), NAME_MATCH_CONFIDENCE, "keyword"));
            continue;
        }

        if keywords_match_text(&entity.keywords, &search_text) {
            signals.push(ResolutionSignal::new(entity.key.clone(), KEYWORD_MATCH_CONFIDENCE, "keyword"));
            continue;
        }

        let name_lower = normalize_text(&entity.name);
        if name_lower.chars().count() >= 3 && fuzzy_matches_tokens(&name_lower, &tokens, fuzzy_threshold) {
            signals.push(ResolutionSignal::new(entity.key.clone(), FUZZY_MATCH_CONFIDENCE, "keyword_fuzzy"));
        }
    }
    signals
}

// ---------------------------------------------------------------------------
// Embedding similarity
// ---------------------------------------------------------------------------

/// Cosine similarity between the event text and each entity's reference
/// text. At or above `threshold`, confidence is `0.4 + 0.4 * similarity`.
///
/// CPU-bound; the engine runs it on the embedding pool.
pub fn signal_embedding_similarity(
    model: &EmbeddingModel,
    event_text: &str,
    entities: &[EntityRecord],
    threshold: f64,
) -> Vec<ResolutionSignal> {
    if event_text.trim().is_empty() || !model.is_ready() {
        return Vec::new();
    }
    let query = match model.embed(&format!("{}{}", QUERY_PREFIX, event_text)) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("Embedding producer: {}", e);
            return Vec::new();
        }
    };

    let mut signals = Vec::new();
    for entity in entities.iter().filter(|e| keyword_target(e)) {
        let Ok(doc) = model.embed(&format!("{}{}", DOCUMENT_PREFIX, entity.embedding_text())) else {
            continue;
        };
        let sim = cosine_similarity(&query, &doc) as f64;
        if sim >= threshold {
            signals.push(ResolutionSignal::new(entity.key.clone(), 0.4 + 0.4 * sim, "embedding"));
        }
    }
    signals
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Accounts and projects are matched on text; people are matched by email.
fn keyword_target(entity: &EntityRecord) -> bool {
    !entity.archived && matches!(entity.key.entity_type, EntityType::Account | EntityType::Project)
}

/// NFKC-normalize and lowercase.
pub(crate) fn normalize_text(value: &str) -> String {
    value.nfkc().collect::<String>().to_lowercase()
}

/// Alphanumeric characters only.
fn normalize_key(value: &str) -> String {
    value.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Individual words (3+ chars) plus adjacent word pairs, so "sales force"
/// still matches "Salesforce".
fn build_fuzzy_tokens(text: &str) -> Vec<String> {
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .collect();
    let mut tokens: Vec<String> = words.iter().map(|w| w.to_string()).collect();
    for pair in words.windows(2) {
        tokens.push(format!("{} {}", pair[0], pair[1]));
    }
    tokens
}

fn fuzzy_matches_tokens(name: &str, tokens: &[String], threshold: f64) -> bool {
    tokens.iter().any(|token| strsim::jaro_winkler(name, token) >= threshold)
}

fn keywords_match_text(keywords: &[String], search_text: &str) -> bool {
    keywords.iter().any(|kw| {
        let kw = normalize_text(kw.trim());
        kw.chars().count() >= 3 && search_text.contains(&kw)
    })
}
