//! Append-only signal log and source profiles.
//!
//! Emitting is a single INSERT with no read-modify-write, so any number of
//! writers on separate connections can append concurrently. The bus has no
//! side effects beyond persistence: consumers pull via the query helpers or
//! the rowid cursor.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{DbError, SignalDb};
use crate::entity::{EntityKey, EntityType};
use crate::util::format_timestamp;

use super::payload::{SignalPayload, SignalType};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A row from the `signal_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEvent {
    /// Position in the log. Strictly increasing in insertion order.
    pub seq: i64,
    pub id: String,
    pub source: String,
    pub signal_type: SignalType,
    pub target: EntityKey,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_tag: Option<String>,
    pub created_at: String,
    pub metadata: SignalPayload,
}

/// A signal about to be appended.
#[derive(Debug, Clone)]
pub struct NewSignal {
    pub source: String,
    pub signal_type: SignalType,
    pub target: EntityKey,
    pub confidence: f64,
    pub context_tag: Option<String>,
    pub metadata: SignalPayload,
}

impl NewSignal {
    pub fn new(source: &str, signal_type: SignalType, target: EntityKey, confidence: f64) -> Self {
        Self {
            source: source.to_string(),
            signal_type,
            target,
            confidence,
            context_tag: None,
            metadata: SignalPayload::Empty,
        }
    }

    pub fn with_payload(mut self, metadata: SignalPayload) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_context(mut self, tag: &str) -> Self {
        self.context_tag = Some(tag.to_string());
        self
    }
}

// ---------------------------------------------------------------------------
// Source profiles
// ---------------------------------------------------------------------------

/// Base reliability and decay half-life for a signal source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceProfile {
    pub source: String,
    pub base_weight: f64,
    pub decay_half_life_days: f64,
}

impl SourceProfile {
    /// Built-in profile for a source.
    pub fn for_source(source: &str) -> Self {
        Self {
            source: source.to_string(),
            base_weight: source_base_weight(source),
            decay_half_life_days: default_half_life(source),
        }
    }
}

/// Base reliability weight for a signal source.
///
/// Tier 1 (highest): user corrections, transcript evidence
/// Tier 2: attendee patterns, email threads, junction links
/// Tier 3: third-party enrichment
/// Tier 4 (lowest): keyword heuristics, embeddings
pub fn source_base_weight(source: &str) -> f64 {
    match source {
        "user_correction" | "explicit" => 1.0,
        "transcript" | "notes" => 0.9,
        "attendee_vote" | "junction" | "email_thread" => 0.8,
        "group_pattern" => 0.75,
        "proactive" | "propagation" => 0.7,
        "clay" | "gravatar" | "enrichment" => 0.6,
        "keyword" | "keyword_fuzzy" | "heuristic" | "embedding" => 0.4,
        _ => 0.5,
    }
}

/// Default half-life in days for a signal source.
pub fn default_half_life(source: &str) -> f64 {
    match source {
        "user_correction" | "explicit" => 365.0,
        "transcript" | "notes" => 60.0,
        "attendee_vote" | "junction" => 180.0,
        "email_thread" => 30.0,
        "group_pattern" => 60.0,
        "proactive" | "propagation" => 30.0,
        "clay" | "gravatar" | "enrichment" => 90.0,
        "keyword" | "keyword_fuzzy" | "heuristic" | "embedding" => 7.0,
        _ => 30.0,
    }
}

/// Clamp a confidence into [0, 1]. Non-finite input means "no opinion".
pub fn clamp_confidence(confidence: f64) -> f64 {
    if !confidence.is_finite() {
        log::debug!("Signal bus: non-finite confidence {}, using 0.5", confidence);
        return 0.5;
    }
    if !(0.0..=1.0).contains(&confidence) {
        log::debug!("Signal bus: confidence {} out of range, clamping", confidence);
    }
    confidence.clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Signal event operations
// ---------------------------------------------------------------------------

/// Emit a new signal event. Returns the generated signal ID.
pub fn emit_signal(
    db: &SignalDb,
    source: &str,
    signal_type: SignalType,
    target: &EntityKey,
    confidence: f64,
    context_tag: Option<&str>,
    metadata: SignalPayload,
) -> Result<String, DbError> {
    let mut signal = NewSignal::new(source, signal_type, target.clone(), confidence).with_payload(metadata);
    if let Some(tag) = context_tag {
        signal = signal.with_context(tag);
    }
    emit(db, &signal)
}

/// Append a prepared signal stamped with the current time.
pub fn emit(db: &SignalDb, signal: &NewSignal) -> Result<String, DbError> {
    emit_at(db, signal, Utc::now())
}

/// Append a prepared signal with an explicit observation time.
///
/// Used by importers replaying history and by tests that need aged signals.
pub fn emit_at(db: &SignalDb, signal: &NewSignal, created_at: DateTime<Utc>) -> Result<String, DbError> {
    let id = format!("sig-{}", Uuid::new_v4());
    db.insert_signal_event(&id, signal, &format_timestamp(created_at))?;
    Ok(id)
}

/// Signals on an entity, newest first. `since` bounds `created_at` from below.
pub fn get_active_signals(
    db: &SignalDb,
    target: &EntityKey,
    since: Option<&str>,
) -> Result<Vec<SignalEvent>, DbError> {
    db.query_signals(
        &format!(
            "SELECT {SIGNAL_COLUMNS} FROM signal_events
             WHERE entity_type = ?1 AND entity_id = ?2 AND created_at >= ?3
             ORDER BY created_at DESC, rowid DESC"
        ),
        params![target.entity_type.as_str(), target.entity_id, since.unwrap_or("")],
    )
}

/// Signals of one type on an entity created at or after `since`, newest first.
pub fn get_entity_signals_of_type(
    db: &SignalDb,
    target: &EntityKey,
    signal_type: &SignalType,
    since: &str,
) -> Result<Vec<SignalEvent>, DbError> {
    db.query_signals(
        &format!(
            "SELECT {SIGNAL_COLUMNS} FROM signal_events
             WHERE entity_type = ?1 AND entity_id = ?2 AND signal_type = ?3 AND created_at >= ?4
             ORDER BY created_at DESC, rowid DESC"
        ),
        params![target.entity_type.as_str(), target.entity_id, signal_type.as_str(), since],
    )
}

pub fn get_signal(db: &SignalDb, id: &str) -> Result<Option<SignalEvent>, DbError> {
    let sql = format!("SELECT {SIGNAL_COLUMNS} FROM signal_events WHERE id = ?1");
    let signal = db
        .conn_ref()
        .query_row(&sql, [id], SignalDb::map_signal_row)
        .optional()?;
    Ok(signal)
}

/// Signals appended after `cursor`, oldest first. Feed the last `seq` back in
/// as the next cursor.
pub fn get_signals_after(db: &SignalDb, cursor: i64, limit: usize) -> Result<Vec<SignalEvent>, DbError> {
    db.query_signals(
        &format!(
            "SELECT {SIGNAL_COLUMNS} FROM signal_events
             WHERE rowid > ?1
             ORDER BY rowid ASC
             LIMIT ?2"
        ),
        params![cursor, limit as i64],
    )
}

/// Signals of any of `types` created at or after `since`, newest first.
/// An empty type list matches every type.
pub fn get_recent_signals_of_types(
    db: &SignalDb,
    types: &[SignalType],
    since: &str,
) -> Result<Vec<SignalEvent>, DbError> {
    let labels: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
    let labels_json = serde_json::to_string(&labels)?;
    db.query_signals(
        &format!(
            "SELECT {SIGNAL_COLUMNS} FROM signal_events
             WHERE created_at >= ?1
               AND (json_array_length(?2) = 0 OR signal_type IN (SELECT value FROM json_each(?2)))
             ORDER BY created_at DESC, rowid DESC"
        ),
        params![since, labels_json],
    )
}

/// `entity_resolution` signals recorded for an event, newest first.
pub fn get_resolution_signals_for_event(db: &SignalDb, event_id: &str) -> Result<Vec<SignalEvent>, DbError> {
    db.query_signals(
        &format!(
            "SELECT {SIGNAL_COLUMNS} FROM signal_events
             WHERE signal_type = 'entity_resolution'
               AND json_extract(metadata, '$.event_id') = ?1
             ORDER BY rowid DESC"
        ),
        [event_id],
    )
}

// ---------------------------------------------------------------------------
// SignalDb methods
// ---------------------------------------------------------------------------

const SIGNAL_COLUMNS: &str =
    "rowid, id, source, signal_type, entity_type, entity_id, confidence, context_tag, created_at, metadata";

impl SignalDb {
    /// Insert a signal event row.
    pub fn insert_signal_event(&self, id: &str, signal: &NewSignal, created_at: &str) -> Result<(), DbError> {
        let confidence = clamp_confidence(signal.confidence);
        let metadata = serde_json::to_string(&signal.metadata)?;
        self.conn_ref().execute(
            "INSERT INTO signal_events
                (id, source, signal_type, entity_type, entity_id, confidence, context_tag, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                signal.source,
                signal.signal_type.as_str(),
                signal.target.entity_type.as_str(),
                signal.target.entity_id,
                confidence,
                signal.context_tag,
                metadata,
                created_at,
            ],
        )?;
        Ok(())
    }

    fn map_signal_row(row: &Row<'_>) -> rusqlite::Result<SignalEvent> {
        let id: String = row.get(1)?;
        let signal_type: String = row.get(3)?;
        let entity_type: String = row.get(4)?;
        let metadata: String = row.get(9)?;
        let payload = SignalPayload::from_stored(&metadata, &id);
        Ok(SignalEvent {
            seq: row.get(0)?,
            id,
            source: row.get(2)?,
            signal_type: SignalType::parse(&signal_type),
            target: EntityKey::new(EntityType::from_str_lossy(&entity_type), row.get::<_, String>(5)?),
            confidence: row.get(6)?,
            context_tag: row.get(7)?,
            created_at: row.get(8)?,
            metadata: payload,
        })
    }

    fn query_signals<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<SignalEvent>, DbError> {
        let mut stmt = self.conn_ref().prepare(sql)?;
        let rows = stmt.query_map(params, Self::map_signal_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
