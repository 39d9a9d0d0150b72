//! Temporal decay for signal confidence (pure math, no DB).
//!
//! Decay is always computed at read time; stored confidences are raw.

use chrono::{DateTime, Utc};

use crate::util::parse_timestamp;

/// Attenuate a confidence by age using exponential half-life decay.
///
/// `c * 2^(-age_days / half_life_days)`
pub fn decay(confidence: f64, age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 || age_days < 0.0 || !age_days.is_finite() {
        return confidence;
    }
    confidence * (2.0_f64).powf(-age_days / half_life_days)
}

/// Fractional days between `created_at` and `now`. Unparseable or future
/// timestamps give 0.
pub fn age_days(created_at: &str, now: DateTime<Utc>) -> f64 {
    let Some(parsed) = parse_timestamp(created_at) else {
        return 0.0;
    };
    let millis = (now - parsed).num_milliseconds() as f64;
    (millis / 86_400_000.0).max(0.0)
}

/// Decayed value of a stored confidence as of `now`.
pub fn decayed_confidence(confidence: f64, created_at: &str, half_life_days: f64, now: DateTime<Utc>) -> f64 {
    decay(confidence, age_days(created_at, now), half_life_days)
}
