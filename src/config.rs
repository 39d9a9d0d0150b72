//! Engine configuration, loaded from `~/.dailyos/signals.json`.
//!
//! Every field has a default, so a missing file or a partial file is valid.
//! A file that exists but does not parse is an error.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::signals::bus::SourceProfile;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Store location. Defaults to `~/.dailyos/signals.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    pub resolution: ResolutionConfig,
    pub reliability: ReliabilityConfig,
    pub invalidation: InvalidationConfig,
    pub scheduler: SchedulerConfig,
    pub callouts: CalloutConfig,
    /// Size of the blocking pool running embedding work.
    pub embedding_workers: usize,
    /// Per-source overrides of base weight and half-life.
    pub source_profiles: HashMap<String, SourceProfileOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            resolution: ResolutionConfig::default(),
            reliability: ReliabilityConfig::default(),
            invalidation: InvalidationConfig::default(),
            scheduler: SchedulerConfig::default(),
            callouts: CalloutConfig::default(),
            embedding_workers: 2,
            source_profiles: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolutionConfig {
    pub resolved_threshold: f64,
    pub flagged_threshold: f64,
    pub suggestion_threshold: f64,
    /// Minimum Jaro-Winkler similarity for a fuzzy keyword hit.
    pub fuzzy_threshold: f64,
    /// Embedding candidates below this cosine similarity are dropped.
    pub embedding_similarity_threshold: f64,
    /// Pre-event window searched for correlated messages.
    pub correlation_window_hours: i64,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            resolved_threshold: 0.85,
            flagged_threshold: 0.60,
            suggestion_threshold: 0.30,
            fuzzy_threshold: 0.85,
            embedding_similarity_threshold: 0.75,
            correlation_window_hours: 72,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReliabilityConfig {
    /// Corrections needed before Thompson draws replace the neutral 0.5.
    pub min_updates: i64,
    /// Fixed RNG seed for reproducible runs. Entropy-seeded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            min_updates: 5,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvalidationConfig {
    pub window_hours: i64,
    pub threshold: f64,
    pub signal_types: Vec<String>,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            window_hours: 48,
            threshold: 0.70,
            signal_types: [
                "stakeholder_change",
                "champion_risk",
                "renewal_risk_escalation",
                "renewal_at_risk",
                "engagement_warning",
                "project_health_warning",
                "title_change",
                "company_change",
                "person_departed",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub startup_delay_secs: u64,
    pub poll_interval_secs: u64,
    /// Events created within this window are candidates for resolution.
    pub lookback_minutes: i64,
    pub maintenance_interval_secs: u64,
    /// Max signals consumed per propagation batch.
    pub propagation_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            startup_delay_secs: 30,
            poll_interval_secs: 300,
            lookback_minutes: 30,
            maintenance_interval_secs: 3600,
            propagation_batch_size: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CalloutConfig {
    pub window_hours: i64,
    /// Decayed confidence a signal needs to become a callout.
    pub min_confidence: f64,
    pub default_limit: usize,
}

impl Default for CalloutConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            min_confidence: 0.55,
            default_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceProfileOverride {
    #[serde(default)]
    pub base_weight: Option<f64>,
    #[serde(default)]
    pub half_life_days: Option<f64>,
}

impl EngineConfig {
    /// Profile for a source, with any configured override applied.
    pub fn profile_for(&self, source: &str) -> SourceProfile {
        let mut profile = SourceProfile::for_source(source);
        if let Some(over) = self.source_profiles.get(source) {
            if let Some(w) = over.base_weight {
                profile.base_weight = w.clamp(0.0, 1.0);
            }
            if let Some(h) = over.half_life_days {
                profile.decay_half_life_days = h;
            }
        }
        profile
    }

    /// Resolved store path.
    pub fn db_path(&self) -> Result<PathBuf, EngineError> {
        match &self.db_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => crate::db::SignalDb::default_path().map_err(EngineError::from),
        }
    }

    /// Reject threshold settings the tier classifier cannot honor.
    pub fn validate(&self) -> Result<(), EngineError> {
        let r = &self.resolution;
        if !(0.0..=1.0).contains(&r.suggestion_threshold)
            || r.suggestion_threshold > r.flagged_threshold
            || r.flagged_threshold > r.resolved_threshold
            || r.resolved_threshold > 1.0
        {
            return Err(EngineError::Config(format!(
                "Resolution thresholds must satisfy 0 <= suggestion ({}) <= flagged ({}) <= resolved ({}) <= 1",
                r.suggestion_threshold, r.flagged_threshold, r.resolved_threshold
            )));
        }
        if self.embedding_workers == 0 {
            return Err(EngineError::Config("embeddingWorkers must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Default config location: `~/.dailyos/signals.json`.
pub fn config_path() -> Result<PathBuf, EngineError> {
    let home = dirs::home_dir().ok_or_else(|| EngineError::Config("Could not find home directory".to_string()))?;
    Ok(home.join(".dailyos").join("signals.json"))
}

/// Load config from the default location. Missing file means defaults.
pub fn load_config() -> Result<EngineConfig, EngineError> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<EngineConfig, EngineError> {
    if !path.exists() {
        log::info!("No config at {}, using defaults", path.display());
        return Ok(EngineConfig::default());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("Failed to read config: {}", e)))?;

    let config: EngineConfig = serde_json::from_str(&content)
        .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{ "resolution": { "resolvedThreshold": 0.9 }, "embeddingWorkers": 4 }"#,
        )
        .expect("parse");
        assert_eq!(config.resolution.resolved_threshold, 0.9);
        assert_eq!(config.resolution.flagged_threshold, 0.60);
        assert_eq!(config.embedding_workers, 4);
        assert_eq!(config.scheduler.poll_interval_secs, 300);
        assert_eq!(config.invalidation.signal_types.len(), 9);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from(&dir.path().join("absent.json")).expect("load");
        assert_eq!(config.reliability.min_updates, 5);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("signals.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(matches!(load_config_from(&path), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = EngineConfig::default();
        config.resolution.flagged_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_profile_override() {
        let mut config = EngineConfig::default();
        config.source_profiles.insert(
            "keyword".to_string(),
            SourceProfileOverride {
                base_weight: Some(0.3),
                half_life_days: None,
            },
        );
        let profile = config.profile_for("keyword");
        assert_eq!(profile.base_weight, 0.3);
        assert_eq!(profile.decay_half_life_days, 7.0);
    }
}
