//! Signal propagation engine.
//!
//! Registered rules look at a source signal and derive new signals on
//! related entities. For example, a `title_change` on a person propagates
//! `stakeholder_change` to every linked account.
//!
//! Rules run in a background batch over the signal log, following a
//! persisted rowid cursor. Each derivation is fingerprinted so replaying a
//! batch never duplicates a derived signal.

use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::{DbError, SignalDb};
use crate::entity::EntityKey;
use crate::util::now_timestamp;

use super::bus::{self, NewSignal, SignalEvent};
use super::payload::{SignalPayload, SignalType};

pub const PROPAGATION_SOURCE: &str = "propagation";
pub const PROPAGATION_CURSOR: &str = "propagation";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A signal derived from one or more source signals by a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSignal {
    pub target: EntityKey,
    pub signal_type: SignalType,
    pub confidence: f64,
    pub source_signal_ids: Vec<String>,
    pub detail: String,
    /// Identity of the condition the rule saw. When set, it replaces the
    /// source ids in the fingerprint, so repeated evidence for an unchanged
    /// condition is a duplicate.
    pub condition_key: Option<String>,
}

/// Read-only inputs shared by every rule in one evaluation.
pub struct RuleContext<'a> {
    pub now: DateTime<Utc>,
    pub config: &'a EngineConfig,
}

impl<'a> RuleContext<'a> {
    pub fn new(now: DateTime<Utc>, config: &'a EngineConfig) -> Self {
        Self { now, config }
    }

    /// Half-life for a source, honoring configured overrides.
    pub fn half_life(&self, source: &str) -> f64 {
        self.config.profile_for(source).decay_half_life_days
    }
}

/// A named propagation rule.
pub type PropagationRule = fn(&RuleContext<'_>, &SignalEvent, &SignalDb) -> Result<Vec<DerivedSignal>, DbError>;

/// Outcome of propagating one source signal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropagationReport {
    pub derived_ids: Vec<String>,
    /// Derivations skipped because their fingerprint was already recorded.
    pub duplicates: usize,
    /// `(rule_name, error)` for rules that failed or panicked.
    pub rule_failures: Vec<(String, String)>,
}

impl PropagationReport {
    fn absorb(&mut self, other: PropagationReport) {
        self.derived_ids.extend(other.derived_ids);
        self.duplicates += other.duplicates;
        self.rule_failures.extend(other.rule_failures);
    }
}

/// Outcome of one cursor batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub processed: usize,
    pub cursor: i64,
    pub propagation: PropagationReport,
}

/// Registry of propagation rules.
pub struct PropagationEngine {
    rules: Vec<(String, PropagationRule)>,
}

impl Default for PropagationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PropagationEngine {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Register a named propagation rule.
    pub fn register(&mut self, name: &str, rule: PropagationRule) {
        self.rules.push((name.to_string(), rule));
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Evaluate every rule against one source signal and persist new derivations.
    ///
    /// A rule that errors or panics is logged and reported; the remaining
    /// rules still run. Storage errors while persisting are propagated.
    pub fn propagate(
        &self,
        db: &SignalDb,
        ctx: &RuleContext<'_>,
        source_signal: &SignalEvent,
    ) -> Result<PropagationReport, DbError> {
        let mut report = PropagationReport::default();

        for (rule_name, rule_fn) in &self.rules {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| rule_fn(ctx, source_signal, db)));
            let derived = match outcome {
                Ok(Ok(derived)) => derived,
                Ok(Err(e)) => {
                    log::warn!("Propagation: rule {} failed on {}: {}", rule_name, source_signal.id, e);
                    report.rule_failures.push((rule_name.clone(), e.to_string()));
                    continue;
                }
                Err(payload) => {
                    let msg = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "rule panicked".to_string());
                    log::error!("Propagation: rule {} panicked on {}: {}", rule_name, source_signal.id, msg);
                    report.rule_failures.push((rule_name.clone(), msg));
                    continue;
                }
            };

            for ds in derived {
                match persist_derived(db, rule_name, source_signal, &ds)? {
                    Some(id) => {
                        log::info!(
                            "Propagation: {} derived {} on {} from {}",
                            rule_name,
                            ds.signal_type,
                            ds.target,
                            source_signal.id
                        );
                        report.derived_ids.push(id);
                    }
                    None => report.duplicates += 1,
                }
            }
        }

        Ok(report)
    }

    /// Propagate the next batch of signals after the persisted cursor.
    ///
    /// `observer` sees every signal in the batch after its rules ran (the
    /// invalidation manager hooks in here). The cursor advances per signal,
    /// so a storage failure mid-batch resumes where it stopped.
    pub fn run_batch(
        &self,
        db: &SignalDb,
        ctx: &RuleContext<'_>,
        limit: usize,
        observer: &mut dyn FnMut(&SignalDb, &SignalEvent) -> Result<(), DbError>,
    ) -> Result<BatchReport, DbError> {
        let mut cursor = db.get_cursor(PROPAGATION_CURSOR)?;
        let batch = bus::get_signals_after(db, cursor, limit)?;
        let mut report = BatchReport {
            cursor,
            ..Default::default()
        };

        for signal in &batch {
            let propagated = self.propagate(db, ctx, signal)?;
            report.propagation.absorb(propagated);
            observer(db, signal)?;
            cursor = signal.seq;
            db.set_cursor(PROPAGATION_CURSOR, cursor)?;
            report.processed += 1;
        }

        report.cursor = cursor;
        Ok(report)
    }
}

/// Construct a propagation engine with all default rules.
pub fn default_engine() -> PropagationEngine {
    let mut engine = PropagationEngine::new();

    engine.register("rule_person_job_change", super::rules::rule_person_job_change);
    engine.register("rule_meeting_frequency_drop", super::rules::rule_meeting_frequency_drop);
    engine.register("rule_overdue_commitments", super::rules::rule_overdue_commitments);
    engine.register("rule_champion_sentiment", super::rules::rule_champion_sentiment);
    engine.register("rule_departure_renewal", super::rules::rule_departure_renewal);
    engine.register("rule_renewal_engagement_compound", super::rules::rule_renewal_engagement_compound);

    engine
}

/// Identity of a derivation: rule, target, and the sorted source signals.
pub fn derivation_fingerprint(rule_name: &str, target: &EntityKey, source_signal_ids: &[String]) -> String {
    let mut ids: Vec<&str> = source_signal_ids.iter().map(String::as_str).collect();
    ids.sort_unstable();
    ids.dedup();
    let mut hasher = Sha256::new();
    hasher.update(rule_name.as_bytes());
    hasher.update(b"|");
    hasher.update(target.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(ids.join(",").as_bytes());
    hex::encode(hasher.finalize())
}

/// Check the fingerprint, append the derived signal and record the
/// derivation in one transaction. Returns `None` for a duplicate.
fn persist_derived(
    db: &SignalDb,
    rule_name: &str,
    source_signal: &SignalEvent,
    ds: &DerivedSignal,
) -> Result<Option<String>, DbError> {
    let mut source_ids = ds.source_signal_ids.clone();
    if source_ids.is_empty() {
        source_ids.push(source_signal.id.clone());
    }
    source_ids.sort();
    source_ids.dedup();
    let fingerprint = match &ds.condition_key {
        Some(key) => derivation_fingerprint(rule_name, &ds.target, std::slice::from_ref(key)),
        None => derivation_fingerprint(rule_name, &ds.target, &source_ids),
    };

    db.with_transaction(|tx| {
        if tx.derivation_exists(&fingerprint)? {
            return Ok(None);
        }
        let signal = NewSignal::new(PROPAGATION_SOURCE, ds.signal_type.clone(), ds.target.clone(), ds.confidence)
            .with_payload(SignalPayload::Derived {
                rule: rule_name.to_string(),
                source_signal_ids: source_ids.clone(),
                origin: source_signal.target.clone(),
                detail: ds.detail.clone(),
            });
        let id = bus::emit(tx, &signal)?;
        tx.insert_signal_derivation(&fingerprint, &source_ids, rule_name, &id)?;
        Ok(Some(id))
    })
}

// ---------------------------------------------------------------------------
// SignalDb methods
// ---------------------------------------------------------------------------

impl SignalDb {
    pub fn derivation_exists(&self, fingerprint: &str) -> Result<bool, DbError> {
        let found = self
            .conn_ref()
            .query_row(
                "SELECT 1 FROM signal_derivations WHERE fingerprint = ?1",
                [fingerprint],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record a derivation. The fingerprint column is UNIQUE.
    pub fn insert_signal_derivation(
        &self,
        fingerprint: &str,
        source_signal_ids: &[String],
        rule_name: &str,
        derived_signal_id: &str,
    ) -> Result<(), DbError> {
        let id = format!("sd-{}", Uuid::new_v4());
        let sources = serde_json::to_string(source_signal_ids)?;
        self.conn_ref().execute(
            "INSERT INTO signal_derivations (id, fingerprint, source_signal_ids, rule_name, derived_signal_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, fingerprint, sources, rule_name, derived_signal_id, now_timestamp()],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
