use crate::confirmation::ConfirmationConfig;
use crate::liveness::LivenessConfig;
use crate::matcher::MatchConfig;
use crate::quality::QualityConfig;
use crate::validator::ValidatorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_PATH_ENV: &str = "ROLLCALL_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{key}={value:?} is not a valid value")]
    InvalidEnv { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Timeouts applied to every collaborator call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Localizer, extractor and liveness model calls.
    pub external_call_ms: u64,
    pub store_ms: u64,
}

impl TimeoutConfig {
    pub fn external_call(&self) -> Duration {
        Duration::from_millis(self.external_call_ms)
    }

    pub fn store(&self) -> Duration {
        Duration::from_millis(self.store_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            external_call_ms: 5_000,
            store_ms: 5_000,
        }
    }
}

/// Every tunable of the verification pipeline.
///
/// Sources, later wins: built-in defaults, the TOML file named by
/// `ROLLCALL_CONFIG`, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub quality: QualityConfig,
    pub liveness: LivenessConfig,
    pub matching: MatchConfig,
    pub validation: ValidatorConfig,
    pub confirmation: ConfirmationConfig,
    pub timeouts: TimeoutConfig,
}

impl PipelineConfig {
    /// Load from the optional config file and the process environment,
    /// then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `ROLLCALL_*` overrides read through `lookup`. A set but
    /// unparseable variable is an error rather than silently ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        env.set("ROLLCALL_MIN_FACE_SIZE", &mut self.quality.min_face_size)?;
        env.set("ROLLCALL_MAX_FACE_SIZE", &mut self.quality.max_face_size)?;
        env.set("ROLLCALL_BLUR_THRESHOLD", &mut self.quality.blur_threshold)?;

        env.set("ROLLCALL_LIVENESS_THRESHOLD", &mut self.liveness.threshold)?;
        env.set("ROLLCALL_LIVENESS_CROP_SCALE", &mut self.liveness.crop_scale)?;
        env.set("ROLLCALL_LIVENESS_EDGE_DIVISOR", &mut self.liveness.edge_divisor)?;
        env.set(
            "ROLLCALL_LIVENESS_CONTRAST_DIVISOR",
            &mut self.liveness.contrast_divisor,
        )?;

        env.set("ROLLCALL_MATCH_THRESHOLD", &mut self.matching.threshold)?;
        env.set("ROLLCALL_MATCH_TOP_K", &mut self.matching.top_k)?;

        env.set("ROLLCALL_MIN_CONFIDENCE", &mut self.validation.min_confidence)?;
        env.set("ROLLCALL_MIN_CONFIDENCE_MARGIN", &mut self.validation.min_margin)?;
        env.set("ROLLCALL_DOMINANCE_FACTOR", &mut self.validation.dominance_factor)?;
        if let Some(ceiling) = env.parse::<f32>("ROLLCALL_DISTANCE_CEILING")? {
            // Zero or negative switches the stage off.
            self.validation.distance_ceiling = (ceiling > 0.0).then_some(ceiling);
        }

        env.set(
            "ROLLCALL_IDENTITY_CONFIDENCE_THRESHOLD",
            &mut self.confirmation.confidence_threshold,
        )?;
        env.set(
            "ROLLCALL_IDENTITY_REQUIRED_SIGHTINGS",
            &mut self.confirmation.required_sightings,
        )?;
        env.set(
            "ROLLCALL_IDENTITY_WINDOW_SECONDS",
            &mut self.confirmation.window_seconds,
        )?;

        env.set("ROLLCALL_EXTERNAL_TIMEOUT_MS", &mut self.timeouts.external_call_ms)?;
        env.set("ROLLCALL_STORE_TIMEOUT_MS", &mut self.timeouts.store_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.quality;
        if q.min_face_size == 0 || q.min_face_size > q.max_face_size {
            return Err(invalid(format!(
                "face size bounds {}..={} are empty",
                q.min_face_size, q.max_face_size
            )));
        }
        check_non_negative("blur_threshold", q.blur_threshold)?;

        check_unit("liveness.threshold", self.liveness.threshold)?;
        if !(self.liveness.crop_scale.is_finite() && self.liveness.crop_scale >= 1.0) {
            return Err(invalid("liveness.crop_scale must be at least 1.0"));
        }
        check_positive("liveness.edge_divisor", self.liveness.edge_divisor)?;
        check_positive("liveness.contrast_divisor", self.liveness.contrast_divisor)?;

        if !(-1.0..=1.0).contains(&self.matching.threshold) {
            return Err(invalid("matching.threshold must lie in [-1, 1]"));
        }
        if self.matching.top_k == 0 {
            return Err(invalid("matching.top_k must be at least 1"));
        }

        let v = &self.validation;
        check_unit("validation.min_confidence", v.min_confidence)?;
        check_non_negative("validation.min_margin", v.min_margin)?;
        check_non_negative("validation.dominance_factor", v.dominance_factor)?;
        if let Some(ceiling) = v.distance_ceiling {
            check_positive("validation.distance_ceiling", ceiling)?;
        }

        let c = &self.confirmation;
        check_unit("confirmation.confidence_threshold", c.confidence_threshold)?;
        if c.required_sightings == 0 {
            return Err(invalid("confirmation.required_sightings must be at least 1"));
        }
        if !(c.window_seconds.is_finite() && c.window_seconds > 0.0) {
            return Err(invalid("confirmation.window_seconds must be positive"));
        }

        if self.timeouts.external_call_ms == 0 || self.timeouts.store_ms == 0 {
            return Err(invalid("timeouts must be non-zero"));
        }
        Ok(())
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match (self.0)(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidEnv {
                    key: key.to_string(),
                    value: raw,
                }),
        }
    }

    fn set<T: FromStr>(&self, key: &str, slot: &mut T) -> Result<(), ConfigError> {
        if let Some(value) = self.parse(key)? {
            *slot = value;
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn check_unit(name: &str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{name} must lie in [0, 1], got {value}")))
    }
}

fn check_non_negative(name: &str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be non-negative, got {value}")))
    }
}

fn check_positive(name: &str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be positive, got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = PipelineConfig::default();
        assert_eq!(c.quality.min_face_size, 80);
        assert_eq!(c.quality.max_face_size, 1200);
        assert_eq!(c.quality.blur_threshold, 30.0);
        assert_eq!(c.liveness.threshold, 0.5);
        assert_eq!(c.liveness.crop_scale, 1.35);
        assert_eq!(c.matching.threshold, 0.5);
        assert_eq!(c.matching.top_k, 5);
        assert_eq!(c.validation.min_confidence, 0.85);
        assert_eq!(c.validation.min_margin, 0.20);
        assert_eq!(c.validation.distance_ceiling, None);
        assert_eq!(c.confirmation.confidence_threshold, 0.65);
        assert_eq!(c.confirmation.required_sightings, 2);
        assert_eq!(c.confirmation.window_seconds, 8.0);
        assert_eq!(c.timeouts.external_call(), Duration::from_secs(5));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = PipelineConfig::from_toml(
            r#"
            [validation]
            min_margin = 0.3

            [confirmation]
            required_sightings = 3
            "#,
        )
        .unwrap();
        assert_eq!(c.validation.min_margin, 0.3);
        assert_eq!(c.validation.min_confidence, 0.85);
        assert_eq!(c.confirmation.required_sightings, 3);
        assert_eq!(c.quality.min_face_size, 80);
    }

    #[test]
    fn test_env_overrides() {
        let mut c = PipelineConfig::default();
        c.apply_overrides(lookup(&[
            ("ROLLCALL_MIN_FACE_SIZE", "64"),
            ("ROLLCALL_MATCH_TOP_K", "10"),
            ("ROLLCALL_IDENTITY_WINDOW_SECONDS", " 12.5 "),
            ("ROLLCALL_DISTANCE_CEILING", "0.9"),
        ]))
        .unwrap();
        assert_eq!(c.quality.min_face_size, 64);
        assert_eq!(c.matching.top_k, 10);
        assert_eq!(c.confirmation.window_seconds, 12.5);
        assert_eq!(c.validation.distance_ceiling, Some(0.9));
    }

    #[test]
    fn test_heuristic_divisor_overrides() {
        let mut c = PipelineConfig::default();
        assert_eq!(c.liveness.edge_divisor, 350.0);
        assert_eq!(c.liveness.contrast_divisor, 80.0);

        c.apply_overrides(lookup(&[
            ("ROLLCALL_LIVENESS_EDGE_DIVISOR", "200"),
            ("ROLLCALL_LIVENESS_CONTRAST_DIVISOR", "64.5"),
        ]))
        .unwrap();
        assert_eq!(c.liveness.edge_divisor, 200.0);
        assert_eq!(c.liveness.contrast_divisor, 64.5);

        c.liveness.contrast_divisor = 0.0;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_distance_ceiling_disables_stage() {
        let mut c = PipelineConfig::default();
        c.validation.distance_ceiling = Some(1.0);
        c.apply_overrides(lookup(&[("ROLLCALL_DISTANCE_CEILING", "0")]))
            .unwrap();
        assert_eq!(c.validation.distance_ceiling, None);
    }

    #[test]
    fn test_unparseable_env_is_error() {
        let mut c = PipelineConfig::default();
        let err = c
            .apply_overrides(lookup(&[("ROLLCALL_BLUR_THRESHOLD", "sharp")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == "ROLLCALL_BLUR_THRESHOLD"));
    }

    #[test]
    fn test_validate_rejects_inverted_face_bounds() {
        let mut c = PipelineConfig::default();
        c.quality.min_face_size = 500;
        c.quality.max_face_size = 100;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_sightings_and_top_k() {
        let mut c = PipelineConfig::default();
        c.confirmation.required_sightings = 0;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.matching.top_k = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let mut c = PipelineConfig::default();
        c.liveness.threshold = 1.5;
        assert!(c.validate().is_err());
    }
}
