//! Entity graph mirror.
//!
//! External CRUD collaborators (calendar sync, account management, email
//! ingestion, the brief generator) own these records. They write them here
//! through the `upsert_*` / `link_*` / `register_*` contracts so that the
//! resolver producers and propagation rules can query the graph locally.

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, Row};

use super::{
    AccountEvent, ArtifactRecord, CommitmentRecord, DbError, EventRecord, MessageRecord,
    PersonLink, SignalDb,
};
use crate::entity::{EntityKey, EntityRecord, EntityType};
use crate::util::{format_timestamp, normalize_email, normalize_emails, now_timestamp, parse_date, parse_timestamp};

/// Junction row linking an event to an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLink {
    pub entity: EntityKey,
    /// `user`, `auto_resolution`, or whatever the writing collaborator set.
    pub link_source: String,
}

/// Re-render a timestamp in storage format so lexical comparisons hold.
fn canonical_timestamp(raw: &str) -> String {
    parse_timestamp(raw)
        .map(format_timestamp)
        .unwrap_or_else(|| raw.to_string())
}

fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default()
}

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<EntityRecord> {
    let entity_type: String = row.get(0)?;
    let id: String = row.get(1)?;
    Ok(EntityRecord {
        key: EntityKey::new(EntityType::from_str_lossy(&entity_type), id),
        name: row.get(2)?,
        keywords: json_list(row.get(3)?),
        reference_text: row.get(4)?,
        email: row.get(5)?,
        archived: row.get::<_, i32>(6)? != 0,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        participants: json_list(row.get(3)?),
        start_time: row.get(4)?,
        created_at: row.get(5)?,
        archived: row.get::<_, i32>(6)? != 0,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let entity_type: Option<String> = row.get(4)?;
    let entity_id: Option<String> = row.get(5)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        subject: row.get(1)?,
        participants: json_list(row.get(2)?),
        sent_at: row.get(3)?,
        entity: match (entity_type, entity_id) {
            (Some(et), Some(id)) => Some(EntityKey::new(EntityType::from_str_lossy(&et), id)),
            _ => None,
        },
    })
}

fn row_to_artifact(row: &Row<'_>) -> rusqlite::Result<ArtifactRecord> {
    let entity_type: String = row.get(2)?;
    Ok(ArtifactRecord {
        id: row.get(0)?,
        kind: row.get(1)?,
        entity: EntityKey::new(EntityType::from_str_lossy(&entity_type), row.get::<_, String>(3)?),
        created_at: row.get(4)?,
        consumed_at: row.get(5)?,
    })
}

const ENTITY_COLUMNS: &str = "entity_type, id, name, keywords, reference_text, email, archived";
const EVENT_COLUMNS: &str = "id, title, description, participants, start_time, created_at, archived";
const MESSAGE_COLUMNS: &str = "id, subject, participants, sent_at, entity_type, entity_id";

impl SignalDb {
    // =========================================================================
    // Entities
    // =========================================================================

    /// Insert or update an entity. Unarchives on upsert only if the record says so.
    pub fn upsert_entity(&self, entity: &EntityRecord) -> Result<(), DbError> {
        let keywords = serde_json::to_string(&entity.keywords)?;
        let email = entity.email.as_deref().and_then(normalize_email);
        self.conn_ref().execute(
            "INSERT INTO entities (entity_type, id, name, keywords, reference_text, email, archived, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (entity_type, id) DO UPDATE SET
                name = excluded.name,
                keywords = excluded.keywords,
                reference_text = excluded.reference_text,
                email = excluded.email,
                archived = excluded.archived,
                updated_at = excluded.updated_at",
            params![
                entity.key.entity_type.as_str(),
                entity.key.entity_id,
                entity.name,
                keywords,
                entity.reference_text,
                email,
                entity.archived as i32,
                now_timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Archive an entity. Returns false if it was not present.
    pub fn archive_entity(&self, key: &EntityKey) -> Result<bool, DbError> {
        let changed = self.conn_ref().execute(
            "UPDATE entities SET archived = 1, updated_at = ?3
             WHERE entity_type = ?1 AND id = ?2",
            params![key.entity_type.as_str(), key.entity_id, now_timestamp()],
        )?;
        Ok(changed > 0)
    }

    pub fn get_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, DbError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_type = ?1 AND id = ?2"
        );
        let entity = self
            .conn_ref()
            .query_row(&sql, params![key.entity_type.as_str(), key.entity_id], row_to_entity)
            .optional()?;
        Ok(entity)
    }

    /// True if the entity exists and is not archived.
    pub fn entity_is_active(&self, key: &EntityKey) -> Result<bool, DbError> {
        Ok(self.get_entity(key)?.map(|e| !e.archived).unwrap_or(false))
    }

    /// All non-archived entities an event can resolve to, ordered by key.
    pub fn list_resolution_targets(&self) -> Result<Vec<EntityRecord>, DbError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities
             WHERE archived = 0 AND entity_type IN ('account', 'project', 'person')
             ORDER BY entity_type, id"
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map([], row_to_entity)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// All non-archived entities of one type.
    pub fn list_entities_of_type(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>, DbError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities
             WHERE archived = 0 AND entity_type = ?1
             ORDER BY id"
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map([entity_type.as_str()], row_to_entity)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Look up a non-archived person by email.
    pub fn get_person_by_email(&self, email: &str) -> Result<Option<EntityRecord>, DbError> {
        let Some(email) = normalize_email(email) else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities
             WHERE entity_type = 'person' AND email = ?1 AND archived = 0"
        );
        let person = self
            .conn_ref()
            .query_row(&sql, [email], row_to_entity)
            .optional()?;
        Ok(person)
    }

    // =========================================================================
    // Person links
    // =========================================================================

    pub fn link_person(&self, link: &PersonLink) -> Result<(), DbError> {
        self.conn_ref().execute(
            "INSERT INTO person_links (person_id, entity_type, entity_id, role)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (person_id, entity_type, entity_id) DO UPDATE SET role = excluded.role",
            params![
                link.person_id,
                link.entity.entity_type.as_str(),
                link.entity.entity_id,
                link.role,
            ],
        )?;
        Ok(())
    }

    /// Accounts and projects a person is linked to.
    pub fn get_links_for_person(&self, person_id: &str) -> Result<Vec<PersonLink>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT person_id, entity_type, entity_id, role FROM person_links
             WHERE person_id = ?1
             ORDER BY entity_type, entity_id",
        )?;
        let rows = stmt.query_map([person_id], |row| {
            let entity_type: String = row.get(1)?;
            Ok(PersonLink {
                person_id: row.get(0)?,
                entity: EntityKey::new(EntityType::from_str_lossy(&entity_type), row.get::<_, String>(2)?),
                role: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // =========================================================================
    // Account milestones
    // =========================================================================

    pub fn upsert_account_event(&self, event: &AccountEvent) -> Result<(), DbError> {
        let date = parse_date(&event.event_date)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| event.event_date.clone());
        self.conn_ref().execute(
            "INSERT OR IGNORE INTO account_events (account_id, event_type, event_date)
             VALUES (?1, ?2, ?3)",
            params![event.account_id, event.event_type, date],
        )?;
        Ok(())
    }

    pub fn get_account_events(&self, account_id: &str) -> Result<Vec<AccountEvent>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT account_id, event_type, event_date FROM account_events
             WHERE account_id = ?1
             ORDER BY event_date",
        )?;
        let rows = stmt.query_map([account_id], |row| {
            Ok(AccountEvent {
                account_id: row.get(0)?,
                event_type: row.get(1)?,
                event_date: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Earliest renewal-type milestone on or after `today`.
    pub fn next_renewal_date(&self, account_id: &str, today: NaiveDate) -> Result<Option<NaiveDate>, DbError> {
        Ok(self
            .get_account_events(account_id)?
            .iter()
            .filter(|e| e.is_renewal())
            .filter_map(|e| parse_date(&e.event_date))
            .filter(|d| *d >= today)
            .min())
    }

    /// Accounts with any renewal-type milestone.
    pub fn accounts_with_renewals(&self) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT DISTINCT account_id FROM account_events
             WHERE event_type IN ('renewal', 'contract_end')
             ORDER BY account_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // =========================================================================
    // Events (meetings)
    // =========================================================================

    /// Insert or replace an event and its participant index.
    pub fn upsert_event(&self, event: &EventRecord) -> Result<(), DbError> {
        let participants = normalize_emails(&event.participants);
        let participants_json = serde_json::to_string(&participants)?;
        self.with_transaction(|tx| tx.write_event(event, &participants, &participants_json))
    }

    fn write_event(&self, event: &EventRecord, participants: &[String], participants_json: &str) -> Result<(), DbError> {
        self.conn_ref().execute(
            "INSERT INTO events (id, title, description, participants, start_time, created_at, archived)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                participants = excluded.participants,
                start_time = excluded.start_time,
                archived = excluded.archived",
            params![
                event.id,
                event.title,
                event.description,
                participants_json,
                canonical_timestamp(&event.start_time),
                canonical_timestamp(&event.created_at),
                event.archived as i32,
            ],
        )?;
        self.conn_ref().execute(
            "DELETE FROM event_participants WHERE event_id = ?1",
            [&event.id],
        )?;
        for email in participants {
            self.conn_ref().execute(
                "INSERT OR IGNORE INTO event_participants (event_id, email) VALUES (?1, ?2)",
                params![event.id, email],
            )?;
        }
        Ok(())
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<EventRecord>, DbError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1");
        let event = self
            .conn_ref()
            .query_row(&sql, [event_id], row_to_event)
            .optional()?;
        Ok(event)
    }

    /// Archive an event. Returns false if it was not present.
    pub fn archive_event(&self, event_id: &str) -> Result<bool, DbError> {
        let changed = self
            .conn_ref()
            .execute("UPDATE events SET archived = 1 WHERE id = ?1", [event_id])?;
        Ok(changed > 0)
    }

    /// Non-archived events created at or after `since`, with no junction link
    /// and no prior resolution attempt.
    pub fn get_unresolved_events_since(&self, since: &str) -> Result<Vec<EventRecord>, DbError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e
             WHERE e.archived = 0
               AND e.created_at >= ?1
               AND NOT EXISTS (SELECT 1 FROM event_entities ee WHERE ee.event_id = e.id)
               AND NOT EXISTS (
                   SELECT 1 FROM signal_events s
                   WHERE s.signal_type = 'entity_resolution'
                     AND json_extract(s.metadata, '$.event_id') = e.id
               )
             ORDER BY e.created_at, e.id"
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map([since], row_to_event)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Non-archived events whose start time falls in `[start, end)`.
    pub fn get_events_between(&self, start: &str, end: &str) -> Result<Vec<EventRecord>, DbError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE archived = 0 AND start_time >= ?1 AND start_time < ?2
             ORDER BY start_time, id"
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map(params![start, end], row_to_event)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // =========================================================================
    // Event-entity junction
    // =========================================================================

    pub fn link_event_entity(&self, event_id: &str, entity: &EntityKey, link_source: &str) -> Result<(), DbError> {
        self.conn_ref().execute(
            "INSERT INTO event_entities (event_id, entity_type, entity_id, link_source)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (event_id, entity_type, entity_id) DO UPDATE SET link_source = excluded.link_source",
            params![event_id, entity.entity_type.as_str(), entity.entity_id, link_source],
        )?;
        Ok(())
    }

    /// Link only if the pair is not linked yet; an existing link keeps its
    /// source. Returns true if a row was written.
    pub fn link_event_entity_if_absent(
        &self,
        event_id: &str,
        entity: &EntityKey,
        link_source: &str,
    ) -> Result<bool, DbError> {
        let changed = self.conn_ref().execute(
            "INSERT INTO event_entities (event_id, entity_type, entity_id, link_source)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (event_id, entity_type, entity_id) DO NOTHING",
            params![event_id, entity.entity_type.as_str(), entity.entity_id, link_source],
        )?;
        Ok(changed > 0)
    }

    /// Drop all junction links for an event and link it to `entity` alone.
    pub fn replace_event_entities(&self, event_id: &str, entity: &EntityKey, link_source: &str) -> Result<(), DbError> {
        self.conn_ref()
            .execute("DELETE FROM event_entities WHERE event_id = ?1", [event_id])?;
        self.link_event_entity(event_id, entity, link_source)
    }

    pub fn get_event_entities(&self, event_id: &str) -> Result<Vec<EventLink>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT entity_type, entity_id, link_source FROM event_entities
             WHERE event_id = ?1
             ORDER BY entity_type, entity_id",
        )?;
        let rows = stmt.query_map([event_id], |row| {
            let entity_type: String = row.get(0)?;
            Ok(EventLink {
                entity: EntityKey::new(EntityType::from_str_lossy(&entity_type), row.get::<_, String>(1)?),
                link_source: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Number of other events linked to `entity` that share at least one
    /// participant with `participants`.
    pub fn count_linked_events_sharing_participants(
        &self,
        entity: &EntityKey,
        participants: &[String],
        exclude_event_id: &str,
    ) -> Result<usize, DbError> {
        if participants.is_empty() {
            return Ok(0);
        }
        let participants_json = serde_json::to_string(participants)?;
        let count: i64 = self.conn_ref().query_row(
            "SELECT COUNT(DISTINCT ee.event_id)
             FROM event_entities ee
             JOIN event_participants ep ON ep.event_id = ee.event_id
             JOIN events e ON e.id = ee.event_id
             WHERE ee.entity_type = ?1 AND ee.entity_id = ?2
               AND ee.event_id != ?3
               AND e.archived = 0
               AND ep.email IN (SELECT value FROM json_each(?4))",
            params![entity.entity_type.as_str(), entity.entity_id, exclude_event_id, participants_json],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Meetings linked to `entity` with start time in `[since, until)`.
    pub fn count_linked_events_between(&self, entity: &EntityKey, since: &str, until: &str) -> Result<usize, DbError> {
        let count: i64 = self.conn_ref().query_row(
            "SELECT COUNT(DISTINCT e.id)
             FROM event_entities ee
             JOIN events e ON e.id = ee.event_id
             WHERE ee.entity_type = ?1 AND ee.entity_id = ?2
               AND e.archived = 0
               AND e.start_time >= ?3 AND e.start_time < ?4",
            params![entity.entity_type.as_str(), entity.entity_id, since, until],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    pub fn upsert_message(&self, message: &MessageRecord) -> Result<(), DbError> {
        let participants = serde_json::to_string(&normalize_emails(&message.participants))?;
        let (entity_type, entity_id) = match &message.entity {
            Some(key) => (Some(key.entity_type.as_str()), Some(key.entity_id.as_str())),
            None => (None, None),
        };
        self.conn_ref().execute(
            "INSERT INTO messages (id, subject, participants, sent_at, entity_type, entity_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                subject = excluded.subject,
                participants = excluded.participants,
                sent_at = excluded.sent_at,
                entity_type = excluded.entity_type,
                entity_id = excluded.entity_id",
            params![
                message.id,
                message.subject,
                participants,
                canonical_timestamp(&message.sent_at),
                entity_type,
                entity_id,
            ],
        )?;
        Ok(())
    }

    /// Messages sent in `[start, end)`.
    pub fn get_messages_between(&self, start: &str, end: &str) -> Result<Vec<MessageRecord>, DbError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE sent_at >= ?1 AND sent_at < ?2
             ORDER BY sent_at, id"
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map(params![start, end], row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Messages attributed to `entity` sent in `[since, until)`.
    pub fn count_messages_between(&self, entity: &EntityKey, since: &str, until: &str) -> Result<usize, DbError> {
        let count: i64 = self.conn_ref().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE entity_type = ?1 AND entity_id = ?2
               AND sent_at >= ?3 AND sent_at < ?4",
            params![entity.entity_type.as_str(), entity.entity_id, since, until],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    // =========================================================================
    // Commitments
    // =========================================================================

    pub fn upsert_commitment(&self, commitment: &CommitmentRecord) -> Result<(), DbError> {
        let due = commitment
            .due_date
            .as_deref()
            .and_then(parse_date)
            .map(|d| d.format("%Y-%m-%d").to_string());
        self.conn_ref().execute(
            "INSERT INTO commitments (id, entity_type, entity_id, title, due_date, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                entity_type = excluded.entity_type,
                entity_id = excluded.entity_id,
                title = excluded.title,
                due_date = excluded.due_date,
                status = excluded.status",
            params![
                commitment.id,
                commitment.entity.entity_type.as_str(),
                commitment.entity.entity_id,
                commitment.title,
                due,
                commitment.status,
            ],
        )?;
        Ok(())
    }

    /// Open commitments on `entity` whose due date is before `today`.
    pub fn count_overdue_commitments(&self, entity: &EntityKey, today: NaiveDate) -> Result<usize, DbError> {
        Ok(self.get_overdue_commitment_ids(entity, today)?.len())
    }

    /// Ids of open commitments on `entity` due before `today`, sorted.
    pub fn get_overdue_commitment_ids(&self, entity: &EntityKey, today: NaiveDate) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT id FROM commitments
             WHERE entity_type = ?1 AND entity_id = ?2
               AND status = 'open'
               AND due_date IS NOT NULL AND due_date < ?3
             ORDER BY id",
        )?;
        let rows = stmt.query_map(
            params![
                entity.entity_type.as_str(),
                entity.entity_id,
                today.format("%Y-%m-%d").to_string(),
            ],
            |row| row.get::<_, String>(0),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // =========================================================================
    // Downstream artifacts
    // =========================================================================

    pub fn register_artifact(&self, artifact: &ArtifactRecord) -> Result<(), DbError> {
        self.conn_ref().execute(
            "INSERT INTO artifacts (id, kind, entity_type, entity_id, created_at, consumed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                kind = excluded.kind,
                entity_type = excluded.entity_type,
                entity_id = excluded.entity_id,
                consumed_at = excluded.consumed_at",
            params![
                artifact.id,
                artifact.kind,
                artifact.entity.entity_type.as_str(),
                artifact.entity.entity_id,
                canonical_timestamp(&artifact.created_at),
                artifact.consumed_at,
            ],
        )?;
        Ok(())
    }

    /// Mark an artifact as presented to the user. Consumed artifacts are
    /// no longer invalidated.
    pub fn mark_artifact_consumed(&self, artifact_id: &str) -> Result<bool, DbError> {
        let changed = self.conn_ref().execute(
            "UPDATE artifacts SET consumed_at = ?2 WHERE id = ?1 AND consumed_at IS NULL",
            params![artifact_id, now_timestamp()],
        )?;
        Ok(changed > 0)
    }

    pub fn get_unconsumed_artifacts(&self, entity: &EntityKey) -> Result<Vec<ArtifactRecord>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT id, kind, entity_type, entity_id, created_at, consumed_at FROM artifacts
             WHERE entity_type = ?1 AND entity_id = ?2 AND consumed_at IS NULL
             ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![entity.entity_type.as_str(), entity.entity_id], row_to_artifact)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    fn event(id: &str, participants: &[&str], start: &str) -> EventRecord {
        EventRecord {
            id: id.to_string(),
            title: format!("Meeting {id}"),
            description: None,
            participants: participants.iter().map(|p| p.to_string()).collect(),
            start_time: start.to_string(),
            created_at: start.to_string(),
            archived: false,
        }
    }

    #[test]
    fn test_upsert_entity_and_archive() {
        let db = test_db();
        let key = EntityKey::account("acme");
        db.upsert_entity(&EntityRecord::new(key.clone(), "Acme Corp").with_keywords(&["acme"]))
            .expect("upsert");
        let loaded = db.get_entity(&key).expect("get").expect("present");
        assert_eq!(loaded.keywords, vec!["acme"]);
        assert!(db.entity_is_active(&key).expect("active"));

        assert!(db.archive_entity(&key).expect("archive"));
        assert!(!db.entity_is_active(&key).expect("active"));
        assert!(db.list_resolution_targets().expect("list").is_empty());
    }

    #[test]
    fn test_person_lookup_by_email_is_case_insensitive() {
        let db = test_db();
        db.upsert_entity(&EntityRecord::new(EntityKey::person("p1"), "Pat").with_email("Pat@Acme.com"))
            .expect("upsert");
        let found = db.get_person_by_email("PAT@acme.COM").expect("lookup");
        assert_eq!(found.map(|p| p.key), Some(EntityKey::person("p1")));
    }

    #[test]
    fn test_upsert_event_indexes_participants() {
        let db = test_db();
        db.upsert_event(&event("m1", &["A@x.com", "b@x.com", "a@x.com"], "2026-01-10T10:00:00Z"))
            .expect("upsert");
        let loaded = db.get_event("m1").expect("get").expect("present");
        assert_eq!(loaded.participants, vec!["a@x.com", "b@x.com"]);
        assert_eq!(loaded.start_time, "2026-01-10T10:00:00.000000Z");

        let idx: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM event_participants WHERE event_id = 'm1'", [], |r| r.get(0))
            .expect("count");
        assert_eq!(idx, 2);
    }

    #[test]
    fn test_failed_participant_write_rolls_back_event() {
        let db = test_db();
        db.upsert_event(&event("m1", &["a@x.com"], "2026-01-10T10:00:00Z"))
            .expect("first upsert");
        db.conn_ref()
            .execute_batch(
                "CREATE TRIGGER lock_participants BEFORE DELETE ON event_participants
                 BEGIN SELECT RAISE(ABORT, 'participants locked'); END;",
            )
            .expect("trigger");

        let mut changed = event("m1", &["b@x.com"], "2026-01-10T10:00:00Z");
        changed.title = "Renamed".to_string();
        assert!(db.upsert_event(&changed).is_err());

        let loaded = db.get_event("m1").expect("get").expect("present");
        assert_eq!(loaded.title, "Meeting m1");
        assert_eq!(loaded.participants, vec!["a@x.com"]);
    }

    #[test]
    fn test_link_if_absent_keeps_existing_source() {
        let db = test_db();
        let acme = EntityKey::account("acme");
        db.link_event_entity("m1", &acme, "user").expect("link");
        assert!(!db.link_event_entity_if_absent("m1", &acme, "auto_resolution").expect("no-op"));
        assert!(db
            .link_event_entity_if_absent("m1", &EntityKey::project("p"), "auto_resolution")
            .expect("insert"));
        let links = db.get_event_entities("m1").expect("links");
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].link_source, "user");
    }

    #[test]
    fn test_replace_event_entities() {
        let db = test_db();
        db.link_event_entity("m1", &EntityKey::account("a"), "user").expect("link a");
        db.link_event_entity("m1", &EntityKey::project("p"), "user").expect("link p");
        db.replace_event_entities("m1", &EntityKey::account("b"), "user")
            .expect("replace");
        let links = db.get_event_entities("m1").expect("links");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].entity, EntityKey::account("b"));
    }

    #[test]
    fn test_count_linked_events_sharing_participants() {
        let db = test_db();
        let acme = EntityKey::account("acme");
        db.upsert_event(&event("m1", &["a@x.com"], "2026-01-01T10:00:00Z")).expect("m1");
        db.upsert_event(&event("m2", &["a@x.com", "c@x.com"], "2026-01-02T10:00:00Z")).expect("m2");
        db.upsert_event(&event("m3", &["z@x.com"], "2026-01-03T10:00:00Z")).expect("m3");
        for id in ["m1", "m2", "m3"] {
            db.link_event_entity(id, &acme, "user").expect("link");
        }
        let count = db
            .count_linked_events_sharing_participants(&acme, &["a@x.com".to_string()], "m9")
            .expect("count");
        assert_eq!(count, 2);
    }

    #[test]
    fn test_overdue_commitments_only_open_and_past_due() {
        let db = test_db();
        let project = EntityKey::project("p1");
        let today = NaiveDate::from_ymd_opt(2026, 2, 1).expect("date");
        let mk = |id: &str, due: Option<&str>, status: &str| CommitmentRecord {
            id: id.to_string(),
            entity: project.clone(),
            title: id.to_string(),
            due_date: due.map(str::to_string),
            status: status.to_string(),
        };
        db.upsert_commitment(&mk("c1", Some("2026-01-05"), "open")).expect("c1");
        db.upsert_commitment(&mk("c2", Some("2026-01-20"), "open")).expect("c2");
        db.upsert_commitment(&mk("c3", Some("2026-01-20"), "done")).expect("c3");
        db.upsert_commitment(&mk("c4", Some("2026-03-01"), "open")).expect("c4");
        db.upsert_commitment(&mk("c5", None, "open")).expect("c5");
        assert_eq!(db.count_overdue_commitments(&project, today).expect("count"), 2);
    }

    #[test]
    fn test_next_renewal_skips_past_dates() {
        let db = test_db();
        for (t, d) in [("renewal", "2025-06-01"), ("contract_end", "2026-04-01"), ("kickoff", "2026-02-10")] {
            db.upsert_account_event(&AccountEvent {
                account_id: "acme".into(),
                event_type: t.into(),
                event_date: d.into(),
            })
            .expect("upsert");
        }
        let today = NaiveDate::from_ymd_opt(2026, 2, 1).expect("date");
        assert_eq!(
            db.next_renewal_date("acme", today).expect("renewal"),
            NaiveDate::from_ymd_opt(2026, 4, 1)
        );
    }

    #[test]
    fn test_artifact_consumption() {
        let db = test_db();
        let acme = EntityKey::account("acme");
        db.register_artifact(&ArtifactRecord {
            id: "brief-1".into(),
            kind: "meeting_brief".into(),
            entity: acme.clone(),
            created_at: now_timestamp(),
            consumed_at: None,
        })
        .expect("register");
        assert_eq!(db.get_unconsumed_artifacts(&acme).expect("list").len(), 1);
        assert!(db.mark_artifact_consumed("brief-1").expect("consume"));
        assert!(db.get_unconsumed_artifacts(&acme).expect("list").is_empty());
    }
}
