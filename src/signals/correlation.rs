//! Cross-channel correlation: email threads that precede a meeting.
//!
//! Messages sent in the window before an event, sharing at least one
//! participant with it, corroborate entities the other producers already
//! proposed. Correlation never introduces a new candidate.

use std::collections::{BTreeSet, HashSet};

use chrono::Duration;

use crate::db::{DbError, EventRecord, SignalDb};
use crate::entity::{EntityKey, EntityType};
use crate::resolver::ResolutionSignal;
use crate::util::{format_timestamp, normalize_emails, parse_timestamp};

pub const EMAIL_THREAD_SOURCE: &str = "email_thread";
pub const EMAIL_THREAD_CONFIDENCE: f64 = 0.60;

/// Supporting `email_thread` signals for entities in `candidates`.
pub fn correlate_messages(
    db: &SignalDb,
    event: &EventRecord,
    candidates: &BTreeSet<EntityKey>,
    window_hours: i64,
) -> Result<Vec<ResolutionSignal>, DbError> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let Some(start) = parse_timestamp(&event.start_time) else {
        return Ok(Vec::new());
    };
    let event_participants: HashSet<String> = normalize_emails(&event.participants).into_iter().collect();
    if event_participants.is_empty() {
        return Ok(Vec::new());
    }

    let window_start = format_timestamp(start - Duration::hours(window_hours));
    let messages = db.get_messages_between(&window_start, &format_timestamp(start))?;

    let mut supported: BTreeSet<EntityKey> = BTreeSet::new();
    for message in &messages {
        let shared: Vec<String> = normalize_emails(&message.participants)
            .into_iter()
            .filter(|e| event_participants.contains(e))
            .collect();
        if shared.is_empty() {
            continue;
        }

        if let Some(ref entity) = message.entity {
            if candidates.contains(entity) {
                supported.insert(entity.clone());
            }
        }

        // A person candidate who is on the shared thread is corroborated too
        for email in &shared {
            if let Some(person) = db.get_person_by_email(email)? {
                if person.key.entity_type == EntityType::Person && candidates.contains(&person.key) {
                    supported.insert(person.key);
                }
            }
        }
    }

    if !supported.is_empty() {
        log::debug!(
            "Correlation: event {} corroborated by email for {} candidate(s)",
            event.id,
            supported.len()
        );
    }

    Ok(supported
        .into_iter()
        .map(|entity| ResolutionSignal::new(entity, EMAIL_THREAD_CONFIDENCE, EMAIL_THREAD_SOURCE))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::MessageRecord;
    use chrono::Utc;

    fn setup(db: &SignalDb) -> EventRecord {
        let start = Utc::now() + Duration::hours(2);
        let event = EventRecord {
            id: "m1".to_string(),
            title: "Quarterly review".to_string(),
            description: None,
            participants: vec!["a@acme.com".to_string(), "me@us.com".to_string()],
            start_time: format_timestamp(start),
            created_at: format_timestamp(Utc::now()),
            archived: false,
        };
        db.upsert_event(&event).expect("event");
        event
    }

    fn message(id: &str, participants: &[&str], hours_before: i64, event: &EventRecord, entity: Option<EntityKey>) -> MessageRecord {
        let start = parse_timestamp(&event.start_time).expect("start");
        MessageRecord {
            id: id.to_string(),
            subject: Some("Agenda".to_string()),
            participants: participants.iter().map(|p| p.to_string()).collect(),
            sent_at: format_timestamp(start - Duration::hours(hours_before)),
            entity,
        }
    }

    #[test]
    fn test_only_existing_candidates_are_supported() {
        let db = test_db();
        let event = setup(&db);
        let acme = EntityKey::account("acme");
        let globex = EntityKey::account("globex");
        db.upsert_message(&message("e1", &["A@acme.com"], 10, &event, Some(acme.clone()))).expect("e1");
        db.upsert_message(&message("e2", &["a@acme.com"], 10, &event, Some(globex))).expect("e2");

        let candidates: BTreeSet<EntityKey> = [acme.clone()].into_iter().collect();
        let signals = correlate_messages(&db, &event, &candidates, 72).expect("correlate");
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].entity, acme);
        assert_eq!(signals[0].source, EMAIL_THREAD_SOURCE);
    }

    #[test]
    fn test_window_and_overlap_are_required() {
        let db = test_db();
        let event = setup(&db);
        let acme = EntityKey::account("acme");
        db.upsert_message(&message("old", &["a@acme.com"], 100, &event, Some(acme.clone()))).expect("old");
        db.upsert_message(&message("stranger", &["x@other.com"], 5, &event, Some(acme.clone()))).expect("x");

        let candidates: BTreeSet<EntityKey> = [acme].into_iter().collect();
        assert!(correlate_messages(&db, &event, &candidates, 72).expect("correlate").is_empty());
    }
}
