//! Cross-entity propagation rules.
//!
//! Each rule takes a source `SignalEvent` and read access to the store and
//! returns zero or more `DerivedSignal`s on related entities. Rules never
//! write; the propagation engine persists what they return.

use chrono::Duration;

use crate::db::{DbError, SignalDb};
use crate::entity::{EntityKey, EntityType};
use crate::util::format_timestamp;

use super::bus::{self, SignalEvent};
use super::decay;
use super::fusion;
use super::payload::{SignalPayload, SignalType};
use super::propagation::{DerivedSignal, RuleContext};

const RENEWAL_ESCALATION_WINDOW_DAYS: i64 = 90;
const SILENCE_WINDOW_DAYS: i64 = 30;
const OVERDUE_THRESHOLD: usize = 3;
/// Floor on the "no engagement" evidence when nothing stronger is on record.
const SILENCE_EVIDENCE: f64 = 0.80;

fn derived(signal: &SignalEvent, target: EntityKey, signal_type: SignalType, confidence: f64, detail: String) -> DerivedSignal {
    DerivedSignal {
        target,
        signal_type,
        confidence,
        source_signal_ids: vec![signal.id.clone()],
        detail,
        condition_key: None,
    }
}

/// Non-archived accounts a person is linked to, optionally champion-only.
fn linked_accounts(db: &SignalDb, person_id: &str, champion_only: bool) -> Result<Vec<EntityKey>, DbError> {
    let mut accounts = Vec::new();
    for link in db.get_links_for_person(person_id)? {
        if link.entity.entity_type != EntityType::Account {
            continue;
        }
        if champion_only && !link.is_champion() {
            continue;
        }
        if let Some(record) = db.get_entity(&link.entity)? {
            if record.archived {
                continue;
            }
        }
        accounts.push(link.entity);
    }
    Ok(accounts)
}

// ---------------------------------------------------------------------------
// Rule: Person job change → Account stakeholder_change
// ---------------------------------------------------------------------------

/// When a person's title or company changes, emit `stakeholder_change` on
/// each linked account.
pub fn rule_person_job_change(
    _ctx: &RuleContext<'_>,
    signal: &SignalEvent,
    db: &SignalDb,
) -> Result<Vec<DerivedSignal>, DbError> {
    if signal.target.entity_type != EntityType::Person {
        return Ok(Vec::new());
    }
    if !matches!(signal.signal_type, SignalType::TitleChange | SignalType::CompanyChange) {
        return Ok(Vec::new());
    }

    let change = signal.metadata.describe();
    Ok(linked_accounts(db, &signal.target.entity_id, false)?
        .into_iter()
        .map(|account| {
            let detail = if change.is_empty() {
                format!("Stakeholder {} had a {}", signal.target.entity_id, signal.signal_type.display_label().to_lowercase())
            } else {
                format!("Stakeholder {}: {}", signal.target.entity_id, change)
            };
            derived(signal, account, SignalType::StakeholderChange, 0.85, detail)
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Rule: Meeting frequency drop → Account engagement_warning
// ---------------------------------------------------------------------------

/// When an account's meeting frequency falls below half its baseline, emit
/// `engagement_warning`.
pub fn rule_meeting_frequency_drop(
    _ctx: &RuleContext<'_>,
    signal: &SignalEvent,
    _db: &SignalDb,
) -> Result<Vec<DerivedSignal>, DbError> {
    if signal.target.entity_type != EntityType::Account || signal.signal_type != SignalType::MeetingFrequency {
        return Ok(Vec::new());
    }
    let SignalPayload::MeetingFrequency { current_count, baseline_count } = &signal.metadata else {
        return Ok(Vec::new());
    };
    let (current_count, baseline_count) = (*current_count, *baseline_count);
    let current = current_count as f64;
    if baseline_count <= 0.0 || current >= baseline_count * 0.5 {
        return Ok(Vec::new());
    }

    let drop_pct = ((baseline_count - current) / baseline_count * 100.0).round();
    Ok(vec![derived(
        signal,
        signal.target.clone(),
        SignalType::EngagementWarning,
        0.75,
        format!(
            "Meeting cadence down {}%: {} in the last 30 days vs {:.1} baseline",
            drop_pct, current_count, baseline_count
        ),
    )])
}

// ---------------------------------------------------------------------------
// Rule: Overdue commitments threshold → project_health_warning
// ---------------------------------------------------------------------------

/// When a project has a `commitment_overdue` signal and at least three open
/// commitments are past due, emit `project_health_warning`.
pub fn rule_overdue_commitments(
    ctx: &RuleContext<'_>,
    signal: &SignalEvent,
    db: &SignalDb,
) -> Result<Vec<DerivedSignal>, DbError> {
    if signal.signal_type != SignalType::CommitmentOverdue || signal.target.entity_type != EntityType::Project {
        return Ok(Vec::new());
    }

    let overdue = db.get_overdue_commitment_ids(&signal.target, ctx.now.date_naive())?;
    if overdue.len() < OVERDUE_THRESHOLD {
        return Ok(Vec::new());
    }

    let mut warning = derived(
        signal,
        signal.target.clone(),
        SignalType::ProjectHealthWarning,
        0.70,
        format!("{} open commitments are overdue", overdue.len()),
    );
    // One warning per set of overdue commitments, however many signals report it
    warning.condition_key = Some(format!("overdue:{}", overdue.join(",")));
    Ok(vec![warning])
}

// ---------------------------------------------------------------------------
// Rule: Champion negative sentiment → Account champion_risk
// ---------------------------------------------------------------------------

/// When a person with a champion role shows negative sentiment, emit
/// `champion_risk` on the accounts they champion.
pub fn rule_champion_sentiment(
    _ctx: &RuleContext<'_>,
    signal: &SignalEvent,
    db: &SignalDb,
) -> Result<Vec<DerivedSignal>, DbError> {
    if signal.target.entity_type != EntityType::Person || signal.signal_type != SignalType::NegativeSentiment {
        return Ok(Vec::new());
    }

    let excerpt = signal.metadata.describe();
    Ok(linked_accounts(db, &signal.target.entity_id, true)?
        .into_iter()
        .map(|account| {
            let detail = if excerpt.is_empty() {
                format!("Champion {} expressed negative sentiment", signal.target.entity_id)
            } else {
                format!("Champion {} expressed negative sentiment: {}", signal.target.entity_id, excerpt)
            };
            derived(signal, account, SignalType::ChampionRisk, 0.80, detail)
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Rule: Champion departure + renewal ≤90d → Account renewal_risk_escalation
// ---------------------------------------------------------------------------

/// When a champion departs or changes company and one of their accounts
/// renews within 90 days, emit `renewal_risk_escalation`.
pub fn rule_departure_renewal(
    ctx: &RuleContext<'_>,
    signal: &SignalEvent,
    db: &SignalDb,
) -> Result<Vec<DerivedSignal>, DbError> {
    if signal.target.entity_type != EntityType::Person {
        return Ok(Vec::new());
    }
    if !matches!(signal.signal_type, SignalType::PersonDeparted | SignalType::CompanyChange) {
        return Ok(Vec::new());
    }

    let today = ctx.now.date_naive();
    let horizon = today + Duration::days(RENEWAL_ESCALATION_WINDOW_DAYS);

    let mut out = Vec::new();
    for account in linked_accounts(db, &signal.target.entity_id, true)? {
        let Some(renewal) = db.next_renewal_date(&account.entity_id, today)? else {
            continue;
        };
        if renewal > horizon {
            continue;
        }
        let days = (renewal - today).num_days();
        out.push(derived(
            signal,
            account,
            SignalType::RenewalRiskEscalation,
            0.90,
            format!(
                "Champion {} left ({}) with renewal in {} days on {}",
                signal.target.entity_id,
                signal.signal_type,
                days,
                renewal.format("%Y-%m-%d")
            ),
        ));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Rule: Renewal proximity + no recent engagement → renewal_at_risk
// ---------------------------------------------------------------------------

/// When `renewal_proximity` fires for an account with no meeting or message
/// in the last 30 days, derive `renewal_at_risk`.
///
/// Confidence fuses the decayed renewal signal with the engagement gap at
/// equal weight. The gap counts as at least 0.80, or as the strongest live
/// `engagement_warning` if that is higher.
pub fn rule_renewal_engagement_compound(
    ctx: &RuleContext<'_>,
    signal: &SignalEvent,
    db: &SignalDb,
) -> Result<Vec<DerivedSignal>, DbError> {
    if signal.target.entity_type != EntityType::Account || signal.signal_type != SignalType::RenewalProximity {
        return Ok(Vec::new());
    }

    let since = format_timestamp(ctx.now - Duration::days(SILENCE_WINDOW_DAYS));
    let until = format_timestamp(ctx.now);
    let meetings = db.count_linked_events_between(&signal.target, &since, &until)?;
    let messages = db.count_messages_between(&signal.target, &since, &until)?;
    if meetings > 0 || messages > 0 {
        return Ok(Vec::new());
    }

    let renewal = decay::decayed_confidence(
        signal.confidence,
        &signal.created_at,
        ctx.half_life(&signal.source),
        ctx.now,
    );

    let strongest_warning = bus::get_entity_signals_of_type(db, &signal.target, &SignalType::EngagementWarning, &since)?
        .iter()
        .map(|w| decay::decayed_confidence(w.confidence, &w.created_at, ctx.half_life(&w.source), ctx.now))
        .fold(0.0_f64, f64::max);
    let engagement_gap = SILENCE_EVIDENCE.max(strongest_warning);

    let confidence = fusion::fuse(&[(renewal, 0.5), (engagement_gap, 0.5)]);

    let detail = match &signal.metadata {
        SignalPayload::RenewalProximity { renewal_date, days_until } => format!(
            "Renewal on {} ({} days) with no meetings or messages in {} days",
            renewal_date, days_until, SILENCE_WINDOW_DAYS
        ),
        _ => format!("Renewal approaching with no meetings or messages in {} days", SILENCE_WINDOW_DAYS),
    };

    Ok(vec![derived(signal, signal.target.clone(), SignalType::RenewalAtRisk, confidence, detail)])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
