// ⚙️ Pipeline Configuration
// TOML-backed. Every section has defaults so a missing file is a valid config.
//
// K (units per run), C (target cycle), D (inter-request delay), R (retry budget)
// and the plausibility constants all live here; components only consume them.

use crate::error::ConfigError;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for `validation.jump_window_days` (ten years)
pub const MAX_JUMP_WINDOW_DAYS: i64 = 3_650;

// ============================================================================
// TOP-LEVEL CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    pub catalog_path: PathBuf,
    pub capture_resolution: CaptureResolution,
    pub rotation: RotationConfig,
    pub fetch: FetchConfig,
    pub validation: ValidationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            database_path: PathBuf::from("data/estimates.db"),
            catalog_path: PathBuf::from("units.csv"),
            capture_resolution: CaptureResolution::default(),
            rotation: RotationConfig::default(),
            fetch: FetchConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rotation.units_per_run == Some(0) {
            return Err(ConfigError::Invalid {
                field: "rotation.units_per_run",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.rotation.target_cycle_runs == 0 {
            return Err(ConfigError::Invalid {
                field: "rotation.target_cycle_runs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.fetch.delay_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "fetch.delay_ms",
                reason: "a zero delay disables the request throttle".to_string(),
            });
        }

        let v = &self.validation;
        if !(v.band_low > 0.0 && v.band_low < 1.0) {
            return Err(ConfigError::Invalid {
                field: "validation.band_low",
                reason: format!("must be in (0, 1), got {}", v.band_low),
            });
        }
        if !(v.band_high > 1.0 && v.band_high.is_finite()) {
            return Err(ConfigError::Invalid {
                field: "validation.band_high",
                reason: format!("must be finite and above 1, got {}", v.band_high),
            });
        }
        if !(v.jump_threshold > 0.0 && v.jump_threshold.is_finite()) {
            return Err(ConfigError::Invalid {
                field: "validation.jump_threshold",
                reason: format!("must be positive, got {}", v.jump_threshold),
            });
        }
        if !(1..=MAX_JUMP_WINDOW_DAYS).contains(&v.jump_window_days) {
            return Err(ConfigError::Invalid {
                field: "validation.jump_window_days",
                reason: format!("must be in 1..={}, got {}", MAX_JUMP_WINDOW_DAYS, v.jump_window_days),
            });
        }

        Ok(())
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// K. When unset, derived from the population so a cycle fits in C runs.
    pub units_per_run: Option<usize>,

    /// C, in runs (one run per day in this deployment)
    pub target_cycle_runs: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            units_per_run: None,
            target_cycle_runs: 12,
        }
    }
}

impl RotationConfig {
    /// Effective K for a population of `population` units
    pub fn effective_units_per_run(&self, population: usize) -> usize {
        match self.units_per_run {
            Some(k) => k.max(1),
            None => population.div_ceil(self.target_cycle_runs.max(1)).max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// D: minimum spacing between any two outbound requests
    pub delay_ms: u64,

    /// R: retries after the first attempt on transient failure
    pub max_retries: u32,

    /// Upper bound on a remote Retry-After hint
    pub max_retry_after_secs: u64,

    /// Program implementing the raw fetch capability (binary only)
    pub command: Option<String>,

    /// Leading arguments passed before `<source> <lookup_key>`
    pub args: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            delay_ms: 1500,
            max_retries: 2,
            max_retry_after_secs: 60,
            command: None,
            args: Vec::new(),
        }
    }
}

impl FetchConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_secs(self.max_retry_after_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Lower multiplicative bound vs the reference price
    pub band_low: f64,

    /// Upper multiplicative bound vs the reference price
    pub band_high: f64,

    /// Relative change vs the prior sample that counts as a jump
    pub jump_threshold: f64,

    /// Jumps only count when the prior sample is at most this old
    pub jump_window_days: i64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            band_low: 0.4,
            band_high: 2.5,
            jump_threshold: 0.15,
            jump_window_days: 7,
        }
    }
}

/// Granularity `captured_at` is truncated to before storage.
/// With `Day`, a calendar day (UTC) is the collection window: re-running the
/// same day hits the duplicate check instead of double-counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureResolution {
    /// Microsecond precision (storage precision)
    Exact,
    #[default]
    Day,
}

impl CaptureResolution {
    pub fn apply(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let step = match self {
            CaptureResolution::Exact => TimeDelta::microseconds(1),
            CaptureResolution::Day => TimeDelta::days(1),
        };
        at.duration_trunc(step).unwrap_or(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fetch.delay(), Duration::from_millis(1500));
        assert_eq!(config.fetch.max_retries, 2);
        assert_eq!(config.validation.jump_threshold, 0.15);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            database_path = "/tmp/x.db"

            [rotation]
            units_per_run = 6

            [fetch]
            delay_ms = 2000
            command = "fetch-estimate"
            "#,
        )
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.rotation.units_per_run, Some(6));
        assert_eq!(config.rotation.target_cycle_runs, 12);
        assert_eq!(config.fetch.delay_ms, 2000);
        assert_eq!(config.fetch.max_retries, 2);
        assert_eq!(config.fetch.command.as_deref(), Some("fetch-estimate"));
        assert_eq!(config.capture_resolution, CaptureResolution::Day);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            PipelineConfig::from_toml("[validation]\nband_low = 1.2\n"),
            Err(ConfigError::Invalid { field: "validation.band_low", .. })
        ));
        assert!(matches!(
            PipelineConfig::from_toml("[rotation]\nunits_per_run = 0\n"),
            Err(ConfigError::Invalid { field: "rotation.units_per_run", .. })
        ));
        assert!(matches!(
            PipelineConfig::from_toml("[fetch]\ndelay_ms = 0\n"),
            Err(ConfigError::Invalid { field: "fetch.delay_ms", .. })
        ));
        assert!(matches!(
            PipelineConfig::from_toml("[validation]\njump_window_days = 9223372036854775807\n"),
            Err(ConfigError::Invalid { field: "validation.jump_window_days", .. })
        ));
        assert!(matches!(
            PipelineConfig::from_toml("capture_resolution = \"hourly\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_effective_units_per_run() {
        let derived = RotationConfig::default();
        assert_eq!(derived.effective_units_per_run(60), 5);
        assert_eq!(derived.effective_units_per_run(61), 6);
        assert_eq!(derived.effective_units_per_run(3), 1);

        let explicit = RotationConfig {
            units_per_run: Some(4),
            target_cycle_runs: 12,
        };
        assert_eq!(explicit.effective_units_per_run(60), 4);
    }

    #[test]
    fn test_capture_resolution() {
        let at = Utc.with_ymd_and_hms(2025, 5, 4, 17, 31, 9).unwrap();
        assert_eq!(
            CaptureResolution::Day.apply(at),
            Utc.with_ymd_and_hms(2025, 5, 4, 0, 0, 0).unwrap()
        );
        assert_eq!(CaptureResolution::Exact.apply(at), at);
    }
}
