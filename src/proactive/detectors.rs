//! Pattern detectors for the proactive engine.
//!
//! Each detector is a pure read over the store returning insights; the
//! engine handles dedup and emission.

use crate::db::{DbError, SignalDb};
use crate::entity::EntityKey;
use crate::signals::payload::{SignalPayload, SignalType};

use super::engine::{fingerprint, DetectorContext, DetectorInsight};

const RENEWAL_HORIZON_DAYS: i64 = 90;

/// Tiered confidence by days until renewal.
pub fn renewal_proximity_confidence(days_until: i64) -> f64 {
    if days_until <= 30 {
        0.90
    } else if days_until <= 60 {
        0.80
    } else {
        0.70
    }
}

/// Accounts with a renewal or contract end within 90 days.
///
/// Archived and churned accounts are skipped. The fingerprint includes the
/// renewal date so a rescheduled renewal is reported again.
pub fn detect_renewal_proximity(db: &SignalDb, ctx: &DetectorContext) -> Result<Vec<DetectorInsight>, DbError> {
    let mut insights = Vec::new();

    for account_id in db.accounts_with_renewals()? {
        let key = EntityKey::account(account_id.as_str());
        let record = db.get_entity(&key)?;
        if record.as_ref().map(|r| r.archived).unwrap_or(false) {
            continue;
        }
        let events = db.get_account_events(&account_id)?;
        if events.iter().any(|e| e.event_type == "churn") {
            continue;
        }
        let Some(renewal) = db.next_renewal_date(&account_id, ctx.today)? else {
            continue;
        };
        let days_until = (renewal - ctx.today).num_days();
        if days_until > RENEWAL_HORIZON_DAYS {
            continue;
        }

        let name = record.map(|r| r.name).unwrap_or_else(|| account_id.clone());
        let renewal_date = renewal.format("%Y-%m-%d").to_string();
        insights.push(DetectorInsight {
            detector_name: "detect_renewal_proximity".to_string(),
            fingerprint: fingerprint(&["account", &account_id, "renewal_proximity", &renewal_date]),
            entity: key,
            signal_type: SignalType::RenewalProximity,
            headline: format!("{} renews in {} days", name, days_until),
            detail: format!("Account {} has a renewal on {} ({} days away).", name, renewal_date, days_until),
            confidence: renewal_proximity_confidence(days_until),
            payload: SignalPayload::RenewalProximity {
                renewal_date,
                days_until,
            },
        });
    }

    Ok(insights)
}
