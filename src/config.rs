use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Streak values at which a member enters each tier. Anything below
/// `warning_from` is good standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TierBoundaries {
    pub warning_from: u32,
    pub follow_up_from: u32,
}

impl Default for TierBoundaries {
    fn default() -> Self {
        Self {
            warning_from: 1,
            follow_up_from: 3,
        }
    }
}

impl TierBoundaries {
    #[cfg(test)]
    pub fn new(warning_from: u32, follow_up_from: u32) -> Result<Self, ConfigError> {
        let boundaries = Self {
            warning_from,
            follow_up_from,
        };
        boundaries.validate()?;
        Ok(boundaries)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.warning_from == 0 {
            return Err(ConfigError::Validation(
                "boundaries.warning_from must be at least 1".into(),
            ));
        }
        if self.follow_up_from <= self.warning_from {
            return Err(ConfigError::Validation(format!(
                "boundaries.follow_up_from ({}) must be greater than warning_from ({})",
                self.follow_up_from, self.warning_from
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    #[default]
    Saturate,
    Graded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ProgressSettings {
    pub mode: ProgressMode,
    /// Streak at which the graded follow-up bar reaches 100%.
    pub graded_ceiling: Option<u32>,
}

/// How the follow-up tier fills its progress bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressPolicy {
    #[default]
    Saturate,
    Graded { ceiling: u32 },
}

impl ProgressSettings {
    pub fn policy(&self, boundaries: &TierBoundaries) -> Result<ProgressPolicy, ConfigError> {
        match self.mode {
            ProgressMode::Saturate => Ok(ProgressPolicy::Saturate),
            ProgressMode::Graded => {
                let ceiling = self
                    .graded_ceiling
                    .unwrap_or(boundaries.follow_up_from.saturating_mul(2));
                if ceiling <= boundaries.follow_up_from {
                    return Err(ConfigError::Validation(format!(
                        "progress.graded_ceiling ({ceiling}) must exceed follow_up_from ({})",
                        boundaries.follow_up_from
                    )));
                }
                Ok(ProgressPolicy::Graded { ceiling })
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub boundaries: TierBoundaries,
    #[serde(default)]
    pub progress: ProgressSettings,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_max_connections() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            boundaries: TierBoundaries::default(),
            progress: ProgressSettings::default(),
            store_timeout_ms: default_store_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

/// Validated values the engine runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub boundaries: TierBoundaries,
    pub progress: ProgressPolicy,
    pub store_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            boundaries: TierBoundaries::default(),
            progress: ProgressPolicy::Saturate,
            store_timeout: Duration::from_millis(default_store_timeout_ms()),
        }
    }
}

impl EngineConfig {
    pub fn settings(&self) -> Result<EngineSettings, ConfigError> {
        self.boundaries.validate()?;
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "store_timeout_ms must be > 0".into(),
            ));
        }
        Ok(EngineSettings {
            boundaries: self.boundaries,
            progress: self.progress.policy(&self.boundaries)?,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
        })
    }
}

/// Load configuration from an optional `attendance.toml` plus environment
/// overrides such as `ATTENDANCE__BOUNDARIES__FOLLOW_UP_FROM=4`.
/// `DATABASE_URL` is honoured when no database url is configured.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name("attendance").required(false))
        .add_source(
            Environment::with_prefix("ATTENDANCE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let mut app: EngineConfig = cfg.try_deserialize()?;
    if app.database_url.is_none() {
        app.database_url = std::env::var("DATABASE_URL").ok();
    }
    app.settings()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_boundaries_match_three_tier_model() {
        let b = TierBoundaries::default();
        assert_eq!(b.warning_from, 1);
        assert_eq!(b.follow_up_from, 3);
        assert!(b.validate().is_ok());
    }

    #[test]
    fn rejects_overlapping_boundaries() {
        assert!(TierBoundaries::new(0, 3).is_err());
        assert!(TierBoundaries::new(2, 2).is_err());
        assert!(TierBoundaries::new(3, 1).is_err());
        assert!(TierBoundaries::new(2, 5).is_ok());
    }

    #[test]
    fn graded_policy_requires_ceiling_past_threshold() {
        let b = TierBoundaries::default();
        let settings = ProgressSettings {
            mode: ProgressMode::Graded,
            graded_ceiling: Some(3),
        };
        assert!(settings.policy(&b).is_err());

        let settings = ProgressSettings {
            mode: ProgressMode::Graded,
            graded_ceiling: None,
        };
        assert_eq!(
            settings.policy(&b).unwrap(),
            ProgressPolicy::Graded { ceiling: 6 }
        );
    }

    #[test]
    fn settings_reject_zero_timeout() {
        let config = EngineConfig {
            store_timeout_ms: 0,
            ..EngineConfig::default()
        };
        assert!(config.settings().is_err());
        assert!(EngineConfig::default().settings().is_ok());
    }
}
