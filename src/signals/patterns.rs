//! Attendee group patterns.
//!
//! Learns which attendee groups map to which entities by scanning recent
//! linked meetings. When the same set of attendees keeps meeting about the
//! same entity, confidence grows. The table is rebuilt from scratch on each
//! mining pass, so it always reflects the trailing window.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use sha2::{Digest, Sha256};

use crate::db::{DbError, EventRecord, SignalDb};
use crate::entity::{EntityKey, EntityType};
use crate::resolver::ResolutionSignal;
use crate::util::{format_timestamp, normalize_emails};

/// Trailing window scanned by the miner.
pub const PATTERN_WINDOW_DAYS: i64 = 90;

/// A row from `attendee_group_patterns`.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendeeGroupPattern {
    pub group_hash: String,
    pub entity: EntityKey,
    pub attendee_emails: Vec<String>,
    pub occurrence_count: u32,
    pub confidence: f64,
    pub last_seen_at: String,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Deterministic, order-independent hash for a set of attendee emails.
pub fn compute_group_hash(emails: &[String]) -> String {
    let joined = normalize_emails(emails).join(",");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

/// `min(0.85, 0.5 + 0.05 * occurrences)`
pub fn pattern_confidence(occurrence_count: u32) -> f64 {
    (0.5 + 0.05 * occurrence_count as f64).min(0.85)
}

/// Rebuild the pattern table from linked meetings in the trailing 90 days.
///
/// Returns the number of patterns written.
pub fn mine_attendee_patterns(db: &SignalDb, now: DateTime<Utc>) -> Result<usize, DbError> {
    let start = format_timestamp(now - Duration::days(PATTERN_WINDOW_DAYS));
    let end = format_timestamp(now);

    db.with_transaction(|tx| {
        let events = tx.get_events_between(&start, &end)?;

        // (hash, entity) -> (emails, count, last_seen)
        let mut groups: BTreeMap<(String, EntityKey), (Vec<String>, u32, String)> = BTreeMap::new();
        for event in &events {
            let emails = normalize_emails(&event.participants);
            if emails.len() < 2 {
                continue;
            }
            let hash = compute_group_hash(&emails);
            for link in tx.get_event_entities(&event.id)? {
                if !link.entity.entity_type.is_resolution_target() {
                    continue;
                }
                let entry = groups
                    .entry((hash.clone(), link.entity))
                    .or_insert_with(|| (emails.clone(), 0, event.start_time.clone()));
                entry.1 += 1;
                if event.start_time > entry.2 {
                    entry.2 = event.start_time.clone();
                }
            }
        }

        tx.conn_ref().execute("DELETE FROM attendee_group_patterns", [])?;
        for ((hash, entity), (emails, count, last_seen)) in &groups {
            tx.insert_attendee_group_pattern(&AttendeeGroupPattern {
                group_hash: hash.clone(),
                entity: entity.clone(),
                attendee_emails: emails.clone(),
                occurrence_count: *count,
                confidence: pattern_confidence(*count),
                last_seen_at: last_seen.clone(),
            })?;
        }

        log::info!(
            "Group pattern mining: {} pattern(s) from {} meeting(s)",
            groups.len(),
            events.len()
        );
        Ok(groups.len())
    })
}

/// Resolver producer: entities this exact attendee group has met about.
pub fn signal_attendee_group_pattern(db: &SignalDb, event: &EventRecord) -> Result<Vec<ResolutionSignal>, DbError> {
    let emails = normalize_emails(&event.participants);
    if emails.len() < 2 {
        return Ok(Vec::new());
    }
    let hash = compute_group_hash(&emails);
    Ok(db
        .get_attendee_group_patterns(&hash)?
        .into_iter()
        .map(|p| ResolutionSignal::new(p.entity, p.confidence, "group_pattern"))
        .collect())
}

// ---------------------------------------------------------------------------
// SignalDb methods
// ---------------------------------------------------------------------------

impl SignalDb {
    pub fn insert_attendee_group_pattern(&self, pattern: &AttendeeGroupPattern) -> Result<(), DbError> {
        let emails = serde_json::to_string(&pattern.attendee_emails)?;
        self.conn_ref().execute(
            "INSERT INTO attendee_group_patterns
                (group_hash, entity_type, entity_id, attendee_emails, occurrence_count, confidence, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                pattern.group_hash,
                pattern.entity.entity_type.as_str(),
                pattern.entity.entity_id,
                emails,
                pattern.occurrence_count,
                pattern.confidence,
                pattern.last_seen_at,
            ],
        )?;
        Ok(())
    }

    /// Patterns for a group hash, strongest first.
    pub fn get_attendee_group_patterns(&self, group_hash: &str) -> Result<Vec<AttendeeGroupPattern>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT group_hash, entity_type, entity_id, attendee_emails, occurrence_count, confidence, last_seen_at
             FROM attendee_group_patterns
             WHERE group_hash = ?1
             ORDER BY confidence DESC, entity_type, entity_id",
        )?;
        let rows = stmt.query_map([group_hash], |row| {
            let entity_type: String = row.get(1)?;
            let emails: String = row.get(3)?;
            Ok(AttendeeGroupPattern {
                group_hash: row.get(0)?,
                entity: EntityKey::new(EntityType::from_str_lossy(&entity_type), row.get::<_, String>(2)?),
                attendee_emails: serde_json::from_str(&emails).unwrap_or_default(),
                occurrence_count: row.get(4)?,
                confidence: row.get(5)?,
                last_seen_at: row.get(6)?,
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

    fn meeting(id: &str, participants: &[&str], start: DateTime<Utc>) -> EventRecord {
        EventRecord {
            id: id.to_string(),
            title: "Sync".to_string(),
            description: None,
            participants: participants.iter().map(|p| p.to_string()).collect(),
            start_time: format_timestamp(start),
            created_at: format_timestamp(start),
            archived: false,
        }
    }

    #[test]
    fn test_group_hash_is_order_and_case_independent() {
        let a = compute_group_hash(&["B@x.com".to_string(), "a@x.com".to_string()]);
        let b = compute_group_hash(&["a@x.com".to_string(), "b@x.com".to_string(), "b@x.com".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_pattern_confidence_caps() {
        assert!((pattern_confidence(1) - 0.55).abs() < 1e-9);
        assert!((pattern_confidence(4) - 0.70).abs() < 1e-9);
        assert_eq!(pattern_confidence(20), 0.85);
    }

    #[test]
    fn test_mining_rebuilds_from_window() {
        let db = test_db();
        let now = Utc::now();
        let acme = EntityKey::account("acme");
        let group = ["a@x.com", "b@x.com"];
        for (i, days) in [5, 10, 20].iter().enumerate() {
            let id = format!("m{i}");
            db.upsert_event(&meeting(&id, &group, now - Duration::days(*days))).expect("event");
            db.link_event_entity(&id, &acme, "user").expect("link");
        }
        // Outside the window and solo meetings are ignored
        db.upsert_event(&meeting("old", &group, now - Duration::days(120))).expect("old");
        db.link_event_entity("old", &acme, "user").expect("link");
        db.upsert_event(&meeting("solo", &["a@x.com"], now - Duration::days(2))).expect("solo");
        db.link_event_entity("solo", &acme, "user").expect("link");

        assert_eq!(mine_attendee_patterns(&db, now).expect("mine"), 1);
        let hash = compute_group_hash(&group.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        let patterns = db.get_attendee_group_patterns(&hash).expect("get");
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].occurrence_count, 3);
        assert!((patterns[0].confidence - 0.65).abs() < 1e-9);

        // Re-mining does not double count
        assert_eq!(mine_attendee_patterns(&db, now).expect("mine"), 1);
        assert_eq!(db.get_attendee_group_patterns(&hash).expect("get")[0].occurrence_count, 3);
    }

    #[test]
    fn test_producer_matches_group() {
        let db = test_db();
        let now = Utc::now();
        let acme = EntityKey::account("acme");
        db.upsert_event(&meeting("m1", &["a@x.com", "b@x.com"], now - Duration::days(3))).expect("event");
        db.link_event_entity("m1", &acme, "user").expect("link");
        mine_attendee_patterns(&db, now).expect("mine");

        let next = meeting("m2", &["b@x.com", "A@x.com"], now);
        let signals = signal_attendee_group_pattern(&db, &next).expect("producer");
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].entity, acme);
        assert_eq!(signals[0].source, "group_pattern");
    }
}
