//! Proactive detection engine.
//!
//! Manages a registry of pattern detectors, runs them against the store,
//! deduplicates insights by fingerprint, and emits signals onto the bus.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::db::{DbError, SignalDb};
use crate::entity::EntityKey;
use crate::signals::bus::{self, NewSignal};
use crate::signals::payload::{SignalPayload, SignalType};
use crate::util::format_timestamp;

/// Source recorded on detector signals.
pub const PROACTIVE_SOURCE: &str = "proactive";
/// An identical insight is not re-emitted within this window.
const DEDUP_WINDOW_DAYS: i64 = 7;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An insight produced by a detector.
#[derive(Debug, Clone)]
pub struct DetectorInsight {
    pub detector_name: String,
    pub fingerprint: String,
    pub entity: EntityKey,
    pub signal_type: SignalType,
    pub headline: String,
    pub detail: String,
    pub confidence: f64,
    /// Typed payload for the emitted signal. `Empty` means a generic
    /// `Insight` payload built from headline and detail.
    pub payload: SignalPayload,
}

/// Context passed to each detector.
#[derive(Debug, Clone)]
pub struct DetectorContext {
    pub now: DateTime<Utc>,
    pub today: NaiveDate,
}

impl DetectorContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            today: now.date_naive(),
        }
    }
}

/// Function signature for a pattern detector.
pub type DetectorFn = fn(&SignalDb, &DetectorContext) -> Result<Vec<DetectorInsight>, DbError>;

pub struct DetectorEntry {
    pub name: String,
    pub detector: DetectorFn,
}

/// The proactive detection engine.
#[derive(Default)]
pub struct ProactiveEngine {
    detectors: Vec<DetectorEntry>,
}

impl ProactiveEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, detector: DetectorFn) {
        self.detectors.push(DetectorEntry {
            name: name.to_string(),
            detector,
        });
    }

    pub fn detector_names(&self) -> Vec<&str> {
        self.detectors.iter().map(|d| d.name.as_str()).collect()
    }

    /// Run every detector, dedup, emit signals.
    /// Returns the ids of newly emitted signals.
    ///
    /// A failing detector is logged and skipped.
    pub fn run_scan(&self, db: &SignalDb, ctx: &DetectorContext) -> Result<Vec<String>, DbError> {
        let mut emitted = Vec::new();

        for entry in &self.detectors {
            let insights = match (entry.detector)(db, ctx) {
                Ok(insights) => insights,
                Err(e) => {
                    log::warn!("Proactive scan: detector {} failed: {}", entry.name, e);
                    continue;
                }
            };

            for insight in insights {
                if db.is_recently_emitted(&insight.fingerprint, ctx.now)? {
                    continue;
                }
                emitted.push(emit_insight(db, &insight, ctx.now)?);
            }
        }

        if !emitted.is_empty() {
            log::info!("Proactive scan: {} new insight(s)", emitted.len());
        }
        Ok(emitted)
    }
}

fn emit_insight(db: &SignalDb, insight: &DetectorInsight, now: DateTime<Utc>) -> Result<String, DbError> {
    let payload = match &insight.payload {
        SignalPayload::Empty => SignalPayload::Insight {
            detector: insight.detector_name.clone(),
            headline: insight.headline.clone(),
            detail: insight.detail.clone(),
        },
        other => other.clone(),
    };
    let signal = NewSignal::new(
        PROACTIVE_SOURCE,
        insight.signal_type.clone(),
        insight.entity.clone(),
        insight.confidence,
    )
    .with_payload(payload);

    db.with_transaction(|tx| {
        let signal_id = bus::emit_at(tx, &signal, now)?;
        tx.record_detector_insight(insight, &signal_id, now)?;
        Ok(signal_id)
    })
}

/// Build a default engine with the shipped detectors registered.
pub fn default_engine() -> ProactiveEngine {
    use super::detectors;

    let mut engine = ProactiveEngine::new();
    engine.register("detect_renewal_proximity", detectors::detect_renewal_proximity);
    engine
}

/// Compute a dedup fingerprint from key components.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// SignalDb methods
// ---------------------------------------------------------------------------

impl SignalDb {
    /// True if this fingerprint was emitted in the 7 days before `now`.
    pub fn is_recently_emitted(&self, fingerprint: &str, now: DateTime<Utc>) -> Result<bool, DbError> {
        let cutoff = format_timestamp(now - Duration::days(DEDUP_WINDOW_DAYS));
        let found = self
            .conn_ref()
            .query_row(
                "SELECT 1 FROM detector_insights WHERE fingerprint = ?1 AND emitted_at >= ?2",
                params![fingerprint, cutoff],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn record_detector_insight(
        &self,
        insight: &DetectorInsight,
        signal_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.conn_ref().execute(
            "INSERT INTO detector_insights
                (fingerprint, detector_name, signal_id, entity_type, entity_id, headline, emitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (fingerprint) DO UPDATE SET
                signal_id = excluded.signal_id,
                headline = excluded.headline,
                emitted_at = excluded.emitted_at",
            params![
                insight.fingerprint,
                insight.detector_name,
                signal_id,
                insight.entity.entity_type.as_str(),
                insight.entity.entity_id,
                insight.headline,
                format_timestamp(now),
            ],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
