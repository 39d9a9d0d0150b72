use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::EntityKey;

/// Errors from the signal store.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Transaction failed: {0}")]
    Transaction(String),
}

/// A calendar event (meeting) mirrored from the calendar sync collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Participant emails, normalized to lowercase on write.
    #[serde(default)]
    pub participants: Vec<String>,
    pub start_time: String,
    pub created_at: String,
    #[serde(default)]
    pub archived: bool,
}

impl EventRecord {
    /// Title plus description, the text keyword and embedding producers search.
    pub fn search_text(&self) -> String {
        match self.description.as_deref() {
            Some(desc) if !desc.trim().is_empty() => format!("{} {}", self.title, desc),
            _ => self.title.clone(),
        }
    }
}

/// A message (email/chat) mirrored from correspondence ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    pub sent_at: String,
    #[serde(default)]
    pub entity: Option<EntityKey>,
}

/// A tracked commitment (action item) owned by an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentRecord {
    pub id: String,
    pub entity: EntityKey,
    pub title: String,
    /// `%Y-%m-%d`
    #[serde(default)]
    pub due_date: Option<String>,
    pub status: String,
}

/// A downstream artifact (e.g. a meeting brief) that depends on an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub id: String,
    pub kind: String,
    pub entity: EntityKey,
    pub created_at: String,
    #[serde(default)]
    pub consumed_at: Option<String>,
}

/// A person's link to an account or project, with an optional role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonLink {
    pub person_id: String,
    pub entity: EntityKey,
    #[serde(default)]
    pub role: Option<String>,
}

impl PersonLink {
    pub fn is_champion(&self) -> bool {
        self.role
            .as_deref()
            .map(|r| r.trim().eq_ignore_ascii_case("champion"))
            .unwrap_or(false)
    }
}

/// A dated account milestone (renewal, contract end, kickoff).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEvent {
    pub account_id: String,
    pub event_type: String,
    /// `%Y-%m-%d`
    pub event_date: String,
}

impl AccountEvent {
    /// Renewal-type milestones.
    pub fn is_renewal(&self) -> bool {
        matches!(self.event_type.as_str(), "renewal" | "contract_end")
    }
}
