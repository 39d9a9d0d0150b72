//! Per-account meeting cadence monitoring.
//!
//! Compares meetings linked to each account over the trailing 30 days with
//! the monthly average of the preceding 90 days and emits a
//! `meeting_frequency` signal. The engagement-drop rule decides whether the
//! change matters.

use chrono::{DateTime, Duration, Utc};

use crate::db::{DbError, SignalDb};
use crate::entity::{EntityKey, EntityType};
use crate::util::format_timestamp;

use super::bus::{self, NewSignal};
use super::payload::{SignalPayload, SignalType};

pub const CADENCE_SOURCE: &str = "proactive";
const CURRENT_WINDOW_DAYS: i64 = 30;
const BASELINE_WINDOW_DAYS: i64 = 90;
/// One measurement per account per week at most.
const REEMIT_AFTER_DAYS: i64 = 7;
const CADENCE_CONFIDENCE: f64 = 0.8;

/// One account's measured cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct CadenceMeasurement {
    pub account: EntityKey,
    pub current_count: u32,
    /// Meetings per 30 days over the baseline window.
    pub baseline_count: f64,
}

impl CadenceMeasurement {
    /// Current cadence below half the baseline.
    pub fn is_drop(&self) -> bool {
        self.baseline_count > 0.0 && (self.current_count as f64) < 0.5 * self.baseline_count
    }
}

/// Measure one account.
pub fn measure_account(db: &SignalDb, account: &EntityKey, now: DateTime<Utc>) -> Result<CadenceMeasurement, DbError> {
    let current_start = now - Duration::days(CURRENT_WINDOW_DAYS);
    let baseline_start = current_start - Duration::days(BASELINE_WINDOW_DAYS);
    let current =
        db.count_linked_events_between(account, &format_timestamp(current_start), &format_timestamp(now))?;
    let baseline = db.count_linked_events_between(
        account,
        &format_timestamp(baseline_start),
        &format_timestamp(current_start),
    )?;
    Ok(CadenceMeasurement {
        account: account.clone(),
        current_count: current as u32,
        baseline_count: baseline as f64 * CURRENT_WINDOW_DAYS as f64 / BASELINE_WINDOW_DAYS as f64,
    })
}

/// Measure every active account and emit `meeting_frequency` signals.
///
/// Accounts without at least one meeting per month of baseline are skipped,
/// as are accounts measured within the last week. Returns emitted signal ids.
pub fn compute_and_emit_cadence(db: &SignalDb, now: DateTime<Utc>) -> Result<Vec<String>, DbError> {
    let recent_cutoff = format_timestamp(now - Duration::days(REEMIT_AFTER_DAYS));
    let mut emitted = Vec::new();

    for account in db.list_entities_of_type(EntityType::Account)? {
        let measurement = measure_account(db, &account.key, now)?;
        if measurement.baseline_count < 1.0 {
            continue;
        }
        let recent =
            bus::get_entity_signals_of_type(db, &account.key, &SignalType::MeetingFrequency, &recent_cutoff)?;
        if !recent.is_empty() {
            continue;
        }

        let signal = NewSignal::new(
            CADENCE_SOURCE,
            SignalType::MeetingFrequency,
            account.key.clone(),
            CADENCE_CONFIDENCE,
        )
        .with_payload(SignalPayload::MeetingFrequency {
            current_count: measurement.current_count,
            baseline_count: measurement.baseline_count,
        });
        let id = bus::emit_at(db, &signal, now)?;
        if measurement.is_drop() {
            log::info!(
                "Cadence: {} dropped to {} meetings (baseline {:.1})",
                account.key,
                measurement.current_count,
                measurement.baseline_count
            );
        }
        emitted.push(id);
    }

    Ok(emitted)
}
