//! Addressable objects in the relationship graph.
//!
//! Accounts (organizations), projects (initiatives) and people are the
//! entities signals bear on. Events are addressable too so a resolution
//! attempt that found nothing still has a target to record against.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of entity a signal targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Account,
    Project,
    Person,
    Event,
    Other,
}

impl EntityType {
    /// String label for SQL storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Account => "account",
            EntityType::Project => "project",
            EntityType::Person => "person",
            EntityType::Event => "event",
            EntityType::Other => "other",
        }
    }

    /// Parse from SQL string.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "account" => EntityType::Account,
            "project" => EntityType::Project,
            "person" => EntityType::Person,
            "event" | "meeting" => EntityType::Event,
            _ => EntityType::Other,
        }
    }

    /// Entity kinds an event can be resolved to.
    pub fn is_resolution_target(&self) -> bool {
        matches!(self, EntityType::Account | EntityType::Project | EntityType::Person)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully-qualified reference to one entity.
///
/// Ordering is (type, id) so candidate tie-breaks are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    pub fn account(id: impl Into<String>) -> Self {
        Self::new(EntityType::Account, id)
    }

    pub fn project(id: impl Into<String>) -> Self {
        Self::new(EntityType::Project, id)
    }

    pub fn person(id: impl Into<String>) -> Self {
        Self::new(EntityType::Person, id)
    }

    pub fn event(id: impl Into<String>) -> Self {
        Self::new(EntityType::Event, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// A row from the `entities` mirror table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub key: EntityKey,
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Free text describing the entity, embedded for semantic matching.
    #[serde(default)]
    pub reference_text: Option<String>,
    /// Primary email, people only.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

impl EntityRecord {
    pub fn new(key: EntityKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            keywords: Vec::new(),
            reference_text: None,
            email: None,
            archived: false,
        }
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.trim().to_lowercase());
        self
    }

    pub fn with_reference_text(mut self, text: &str) -> Self {
        self.reference_text = Some(text.to_string());
        self
    }

    /// Text embedded as the entity's semantic fingerprint.
    pub fn embedding_text(&self) -> String {
        let mut parts = vec![self.name.clone()];
        if !self.keywords.is_empty() {
            parts.push(self.keywords.join(" "));
        }
        if let Some(ref text) = self.reference_text {
            parts.push(text.clone());
        }
        parts.join(" ")
    }
}
