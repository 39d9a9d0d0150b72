//! Weighted log-odds confidence fusion.
//!
//! Each input contributes `w * ln(c / (1 - c))`; the sum is mapped back
//! through the logistic function. Agreeing signals compound, contradicting
//! signals pull toward 0.5.

use chrono::{DateTime, Utc};

use super::bus::SourceProfile;
use super::decay;

/// Inputs are clamped into `[EPSILON, 1 - EPSILON]` so log-odds stay finite.
pub const EPSILON: f64 = 0.001;

/// Fuse `(confidence, weight)` pairs. No inputs means no opinion (0.5).
pub fn fuse(signals: &[(f64, f64)]) -> f64 {
    if signals.is_empty() {
        return 0.5;
    }

    let mut weighted_log_odds_sum = 0.0_f64;
    for &(confidence, weight) in signals {
        let p = if confidence.is_finite() { confidence } else { 0.5 };
        let p = p.clamp(EPSILON, 1.0 - EPSILON);
        let w = if weight.is_finite() { weight.max(0.0) } else { 0.0 };
        weighted_log_odds_sum += w * (p / (1.0 - p)).ln();
    }

    let combined = 1.0 / (1.0 + (-weighted_log_odds_sum).exp());
    combined.clamp(EPSILON, 1.0 - EPSILON)
}

/// Learned multiplier applied on top of a source's base weight.
///
/// A sampled reliability of 0.5 (the uninformative prior) is neutral.
pub fn reliability_multiplier(sampled_reliability: f64) -> f64 {
    2.0 * sampled_reliability.clamp(0.0, 1.0)
}

/// Per-signal fusion weight: base weight scaled by learned reliability.
pub fn signal_weight(profile: &SourceProfile, sampled_reliability: f64) -> f64 {
    profile.base_weight * reliability_multiplier(sampled_reliability)
}

/// A raw observation awaiting decay-then-fuse.
#[derive(Debug, Clone)]
pub struct RawSignal<'a> {
    pub confidence: f64,
    pub created_at: &'a str,
    pub half_life_days: f64,
    pub weight: f64,
}

/// Decay every input to its as-of-`now` confidence, then fuse.
pub fn decay_then_fuse(signals: &[RawSignal<'_>], now: DateTime<Utc>) -> f64 {
    let decayed: Vec<(f64, f64)> = signals
        .iter()
        .map(|s| {
            (
                decay::decayed_confidence(s.confidence, s.created_at, s.half_life_days, now),
                s.weight,
            )
        })
        .collect();
    fuse(&decayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::format_timestamp;
    use chrono::Duration;

    #[test]
    fn test_empty_returns_prior() {
        assert_eq!(fuse(&[]), 0.5);
    }

    #[test]
    fn test_single_signal_passthrough() {
        assert!((fuse(&[(0.9, 1.0)]) - 0.9).abs() < 1e-9);
        assert!((fuse(&[(0.75, 1.0)]) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_agreement_compounds() {
        let result = fuse(&[(0.8, 1.0), (0.8, 1.0)]);
        assert!(result > 0.9, "two agreeing 0.8s should exceed 0.9, got {}", result);
    }

    #[test]
    fn test_contradiction_cancels_toward_middle() {
        let result = fuse(&[(0.9, 1.0), (0.1, 1.0)]);
        assert!(result > 0.1 && result < 0.9);
        assert!((result - 0.5).abs() < 1e-9, "symmetric contradiction should cancel, got {}", result);
    }

    #[test]
    fn test_strong_dominates_weak_contradiction() {
        let result = fuse(&[(0.9, 1.0), (0.1, 0.4)]);
        assert!(result > 0.70 && result < 0.9, "got {}", result);
    }

    #[test]
    fn test_low_weight_reduces_influence() {
        let full = fuse(&[(0.5, 1.0), (0.9, 1.0)]);
        let low = fuse(&[(0.5, 1.0), (0.9, 0.1)]);
        assert!(full > low, "full={}, low={}", full, low);
    }

    #[test]
    fn test_extremes_stay_bounded() {
        let result = fuse(&[(1.0, 1.0), (1.0, 1.0)]);
        assert!(result <= 1.0 - EPSILON);
        let result = fuse(&[(0.0, 1.0)]);
        assert!(result >= EPSILON);
    }

    #[test]
    fn test_neutral_reliability_keeps_base_weight() {
        let profile = SourceProfile::for_source("keyword");
        assert!((signal_weight(&profile, 0.5) - 0.4).abs() < 1e-9);
        assert!(signal_weight(&profile, 0.9) > 0.4);
    }

    #[test]
    fn test_decay_then_fuse_weakens_old_evidence() {
        let now = Utc::now();
        let fresh = format_timestamp(now);
        let stale = format_timestamp(now - Duration::days(60));
        let fresh_result = decay_then_fuse(
            &[RawSignal { confidence: 0.9, created_at: &fresh, half_life_days: 30.0, weight: 1.0 }],
            now,
        );
        let stale_result = decay_then_fuse(
            &[RawSignal { confidence: 0.9, created_at: &stale, half_life_days: 30.0, weight: 1.0 }],
            now,
        );
        assert!((fresh_result - 0.9).abs() < 1e-6);
        assert!((stale_result - 0.225).abs() < 1e-6, "got {}", stale_result);
    }
}
