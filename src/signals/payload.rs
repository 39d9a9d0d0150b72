//! Signal types and typed signal payloads.
//!
//! `SignalType` is stored as its snake_case label. `SignalPayload` is the
//! `metadata` column, a JSON object tagged by `kind`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::EntityKey;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalType {
    EntityResolution,
    TitleChange,
    CompanyChange,
    PersonDeparted,
    NegativeSentiment,
    MeetingFrequency,
    CommitmentOverdue,
    RenewalProximity,
    StakeholderChange,
    EngagementWarning,
    ProjectHealthWarning,
    ChampionRisk,
    RenewalRiskEscalation,
    RenewalAtRisk,
    ProactiveInsight,
    Custom(String),
}

impl SignalType {
    pub fn as_str(&self) -> &str {
        match self {
            SignalType::EntityResolution => "entity_resolution",
            SignalType::TitleChange => "title_change",
            SignalType::CompanyChange => "company_change",
            SignalType::PersonDeparted => "person_departed",
            SignalType::NegativeSentiment => "negative_sentiment",
            SignalType::MeetingFrequency => "meeting_frequency",
            SignalType::CommitmentOverdue => "commitment_overdue",
            SignalType::RenewalProximity => "renewal_proximity",
            SignalType::StakeholderChange => "stakeholder_change",
            SignalType::EngagementWarning => "engagement_warning",
            SignalType::ProjectHealthWarning => "project_health_warning",
            SignalType::ChampionRisk => "champion_risk",
            SignalType::RenewalRiskEscalation => "renewal_risk_escalation",
            SignalType::RenewalAtRisk => "renewal_at_risk",
            SignalType::ProactiveInsight => "proactive_insight",
            SignalType::Custom(s) => s.as_str(),
        }
    }

    /// Parse a stored label. Unknown labels become `Custom`.
    pub fn parse(label: &str) -> Self {
        match label {
            "entity_resolution" => SignalType::EntityResolution,
            "title_change" => SignalType::TitleChange,
            "company_change" => SignalType::CompanyChange,
            "person_departed" => SignalType::PersonDeparted,
            "negative_sentiment" => SignalType::NegativeSentiment,
            "meeting_frequency" => SignalType::MeetingFrequency,
            "commitment_overdue" => SignalType::CommitmentOverdue,
            "renewal_proximity" => SignalType::RenewalProximity,
            "stakeholder_change" => SignalType::StakeholderChange,
            "engagement_warning" => SignalType::EngagementWarning,
            "project_health_warning" => SignalType::ProjectHealthWarning,
            "champion_risk" => SignalType::ChampionRisk,
            "renewal_risk_escalation" => SignalType::RenewalRiskEscalation,
            "renewal_at_risk" => SignalType::RenewalAtRisk,
            "proactive_insight" => SignalType::ProactiveInsight,
            other => SignalType::Custom(other.to_string()),
        }
    }

    /// Human-readable label for headlines.
    pub fn display_label(&self) -> String {
        let label = self.as_str().replace('_', " ");
        let mut chars = label.chars();
        match chars.next() {
            Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
            None => String::new(),
        }
    }
}

impl From<String> for SignalType {
    fn from(s: String) -> Self {
        SignalType::parse(&s)
    }
}

impl From<&str> for SignalType {
    fn from(s: &str) -> Self {
        SignalType::parse(s)
    }
}

impl From<SignalType> for String {
    fn from(t: SignalType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One candidate considered by a resolution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub entity: EntityKey,
    pub confidence: f64,
    pub sources: Vec<String>,
}

/// Structured metadata attached to a signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    /// Outcome of one resolution attempt (or a user correction).
    EntityResolution {
        event_id: String,
        tier: String,
        contributing_sources: Vec<String>,
        candidates: Vec<CandidateSummary>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        corrected_from: Vec<EntityKey>,
    },
    /// A profile field on a person changed (title, company, departure).
    ProfileChange {
        field: String,
        #[serde(default)]
        old_value: Option<String>,
        #[serde(default)]
        new_value: Option<String>,
    },
    MeetingFrequency {
        current_count: u32,
        baseline_count: f64,
    },
    RenewalProximity {
        renewal_date: String,
        days_until: i64,
    },
    CommitmentOverdue {
        #[serde(default)]
        commitment_id: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        due_date: Option<String>,
    },
    /// Free text evidence (sentiment excerpts, transcript notes).
    Note { text: String },
    /// Output of a proactive detector.
    Insight {
        detector: String,
        headline: String,
        detail: String,
    },
    /// Output of a propagation rule.
    Derived {
        rule: String,
        source_signal_ids: Vec<String>,
        origin: EntityKey,
        detail: String,
    },
    #[default]
    Empty,
}

impl SignalPayload {
    /// Parse the stored `metadata` column. Malformed payloads degrade to `Empty`.
    pub fn from_stored(raw: &str, signal_id: &str) -> Self {
        match serde_json::from_str(raw) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Signal {}: unreadable payload ({}), treating as empty", signal_id, e);
                SignalPayload::Empty
            }
        }
    }

    /// Event id for resolution payloads.
    pub fn event_id(&self) -> Option<&str> {
        match self {
            SignalPayload::EntityResolution { event_id, .. } => Some(event_id),
            _ => None,
        }
    }

    /// Plain-text rendering used for ranking and callout detail.
    pub fn describe(&self) -> String {
        match self {
            SignalPayload::EntityResolution { event_id, tier, contributing_sources, .. } => {
                format!("Event {} resolved ({}) via {}", event_id, tier, contributing_sources.join(", "))
            }
            SignalPayload::ProfileChange { field, old_value, new_value } => match (old_value, new_value) {
                (Some(old), Some(new)) => format!("{} changed from {} to {}", field, old, new),
                (None, Some(new)) => format!("{} is now {}", field, new),
                (Some(old), None) => format!("{} {} no longer applies", field, old),
                (None, None) => format!("{} changed", field),
            },
            SignalPayload::MeetingFrequency { current_count, baseline_count } => format!(
                "{} meetings in the last 30 days against a baseline of {:.1}",
                current_count, baseline_count
            ),
            SignalPayload::RenewalProximity { renewal_date, days_until } => {
                format!("Renewal on {} ({} days away)", renewal_date, days_until)
            }
            SignalPayload::CommitmentOverdue { title, due_date, .. } => match (title, due_date) {
                (Some(t), Some(d)) => format!("Commitment \"{}\" overdue since {}", t, d),
                (Some(t), None) => format!("Commitment \"{}\" overdue", t),
                _ => "Commitment overdue".to_string(),
            },
            SignalPayload::Note { text } => text.clone(),
            SignalPayload::Insight { headline, detail, .. } => format!("{}. {}", headline, detail),
            SignalPayload::Derived { detail, .. } => detail.clone(),
            SignalPayload::Empty => String::new(),
        }
    }
}
