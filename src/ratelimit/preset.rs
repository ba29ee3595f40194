//! Limiter presets, per-limiter overrides and validated limiter configuration.
//!
//! A limiter starts from a named [`Preset`], has its [`LimiterOptions`] merged
//! over it, and is validated into an immutable [`LimiterConfig`] before the
//! first request is ever seen.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TollgateError};

/// Key prefix used when neither the preset nor the overrides name one.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// Upper bound for window and penalty lengths (ten years).
pub const MAX_DURATION_SECS: i64 = 10 * 365 * 86_400;

/// Named default budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Standard,
    Strict,
    Relaxed,
    #[serde(alias = "aiInference", alias = "ai-inference")]
    AiInference,
    Authentication,
    Webhook,
}

impl Preset {
    /// Every preset, in declaration order.
    pub const ALL: [Preset; 6] = [
        Preset::Standard,
        Preset::Strict,
        Preset::Relaxed,
        Preset::AiInference,
        Preset::Authentication,
        Preset::Webhook,
    ];

    /// `(points, duration_secs, block_duration_secs)` for this preset.
    pub fn budget(&self) -> (u32, u64, u64) {
        match self {
            Preset::Standard => (100, 60, 60),
            Preset::Strict => (20, 60, 300),
            Preset::Relaxed => (1000, 60, 30),
            Preset::AiInference => (10, 60, 120),
            Preset::Authentication => (5, 300, 900),
            Preset::Webhook => (50, 60, 60),
        }
    }

    /// Canonical name of the preset.
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Standard => "standard",
            Preset::Strict => "strict",
            Preset::Relaxed => "relaxed",
            Preset::AiInference => "ai_inference",
            Preset::Authentication => "authentication",
            Preset::Webhook => "webhook",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "standard" => Ok(Preset::Standard),
            "strict" => Ok(Preset::Strict),
            "relaxed" => Ok(Preset::Relaxed),
            "ai_inference" | "ai-inference" | "aiInference" => Ok(Preset::AiInference),
            "authentication" => Ok(Preset::Authentication),
            "webhook" => Ok(Preset::Webhook),
            other => Err(TollgateError::Config(format!("unknown preset '{}'", other))),
        }
    }
}

/// Overrides applied on top of a preset.
///
/// Values are signed so that out-of-range input from configuration files is
/// reported by validation instead of failing deserialization with a less
/// helpful message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterOptions {
    /// Preset to start from (defaults to the preset matching the limiter name,
    /// then `standard`)
    #[serde(default)]
    pub preset: Option<Preset>,
    /// Budget per window
    #[serde(default)]
    pub points: Option<i64>,
    /// Window length in seconds
    #[serde(default)]
    pub duration_secs: Option<i64>,
    /// Penalty length in seconds
    #[serde(default)]
    pub block_duration_secs: Option<i64>,
    /// Prefix for store keys
    #[serde(default)]
    pub key_prefix: Option<String>,
}

impl LimiterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset(mut self, preset: Preset) -> Self {
        self.preset = Some(preset);
        self
    }

    pub fn points(mut self, points: i64) -> Self {
        self.points = Some(points);
        self
    }

    pub fn duration_secs(mut self, secs: i64) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    pub fn block_duration_secs(mut self, secs: i64) -> Self {
        self.block_duration_secs = Some(secs);
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }
}

/// Validated, immutable configuration of a single limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    name: String,
    points: u32,
    duration_secs: u64,
    block_duration_secs: u64,
    key_prefix: String,
}

impl LimiterConfig {
    /// Merge `options` over the base preset and validate the result.
    ///
    /// The base preset is `options.preset`, else the preset named like the
    /// limiter, else [`Preset::Standard`].
    pub fn resolve(name: &str, options: &LimiterOptions) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(TollgateError::Config("limiter name must not be empty".to_string()));
        }

        let preset = options
            .preset
            .or_else(|| name.parse::<Preset>().ok())
            .unwrap_or(Preset::Standard);
        let (points, duration_secs, block_duration_secs) = preset.budget();

        let points = options.points.unwrap_or(points as i64);
        let duration_secs = options.duration_secs.unwrap_or(duration_secs as i64);
        let block_duration_secs = options
            .block_duration_secs
            .unwrap_or(block_duration_secs as i64);

        if points <= 0 || points > u32::MAX as i64 {
            return Err(TollgateError::Config(format!(
                "limiter '{}': points must be between 1 and {}, got {}",
                name,
                u32::MAX,
                points
            )));
        }
        if duration_secs <= 0 || duration_secs > MAX_DURATION_SECS {
            return Err(TollgateError::Config(format!(
                "limiter '{}': duration_secs must be between 1 and {}, got {}",
                name, MAX_DURATION_SECS, duration_secs
            )));
        }
        if !(0..=MAX_DURATION_SECS).contains(&block_duration_secs) {
            return Err(TollgateError::Config(format!(
                "limiter '{}': block_duration_secs must be between 0 and {}, got {}",
                name, MAX_DURATION_SECS, block_duration_secs
            )));
        }

        let key_prefix = options
            .key_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
        if key_prefix.is_empty() {
            return Err(TollgateError::Config(format!(
                "limiter '{}': key_prefix must not be empty",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            points: points as u32,
            duration_secs: duration_secs as u64,
            block_duration_secs: block_duration_secs as u64,
            key_prefix,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> u32 {
        self.points
    }

    pub fn duration_secs(&self) -> u64 {
        self.duration_secs
    }

    pub fn block_duration_secs(&self) -> u64 {
        self.block_duration_secs
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Millisecond view of the budget handed to store backends.
    pub fn quota(&self) -> Quota {
        Quota {
            points: self.points,
            duration_ms: (self.duration_secs as i64).saturating_mul(1000),
            block_ms: (self.block_duration_secs as i64).saturating_mul(1000),
        }
    }
}

/// Budget of a limiter in the units store backends work with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Points per window
    pub points: u32,
    /// Window length in milliseconds
    pub duration_ms: i64,
    /// Penalty length in milliseconds
    pub block_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_budgets() {
        assert_eq!(Preset::Standard.budget(), (100, 60, 60));
        assert_eq!(Preset::Strict.budget(), (20, 60, 300));
        assert_eq!(Preset::Relaxed.budget(), (1000, 60, 30));
        assert_eq!(Preset::AiInference.budget(), (10, 60, 120));
        assert_eq!(Preset::Authentication.budget(), (5, 300, 900));
        assert_eq!(Preset::Webhook.budget(), (50, 60, 60));
    }

    #[test]
    fn test_preset_names_round_trip() {
        for preset in Preset::ALL {
            assert_eq!(preset.as_str().parse::<Preset>().unwrap(), preset);
        }
        assert_eq!("aiInference".parse::<Preset>().unwrap(), Preset::AiInference);
        assert!("bogus".parse::<Preset>().is_err());
    }

    #[test]
    fn test_unnamed_limiter_uses_standard() {
        let config = LimiterConfig::resolve("api", &LimiterOptions::new()).unwrap();
        assert_eq!(config.points(), 100);
        assert_eq!(config.duration_secs(), 60);
        assert_eq!(config.block_duration_secs(), 60);
        assert_eq!(config.key_prefix(), DEFAULT_KEY_PREFIX);
    }

    #[test]
    fn test_limiter_named_after_preset() {
        let config = LimiterConfig::resolve("authentication", &LimiterOptions::new()).unwrap();
        assert_eq!(config.points(), 5);
        assert_eq!(config.duration_secs(), 300);
        assert_eq!(config.block_duration_secs(), 900);
    }

    #[test]
    fn test_overrides_merge_over_preset() {
        let options = LimiterOptions::new()
            .preset(Preset::Strict)
            .points(7)
            .key_prefix("svc");
        let config = LimiterConfig::resolve("login", &options).unwrap();

        assert_eq!(config.points(), 7);
        assert_eq!(config.duration_secs(), 60);
        assert_eq!(config.block_duration_secs(), 300);
        assert_eq!(config.key_prefix(), "svc");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            LimiterOptions::new().points(0),
            LimiterOptions::new().points(-3),
            LimiterOptions::new().duration_secs(0),
            LimiterOptions::new().block_duration_secs(-1),
            LimiterOptions::new().key_prefix(""),
            LimiterOptions::new().duration_secs(i64::MAX / 10),
            LimiterOptions::new().duration_secs(MAX_DURATION_SECS + 1),
            LimiterOptions::new().block_duration_secs(i64::MAX),
        ];
        for options in cases {
            let err = LimiterConfig::resolve("api", &options).unwrap_err();
            assert!(matches!(err, TollgateError::Config(_)), "{:?}", options);
        }

        assert!(LimiterConfig::resolve("", &LimiterOptions::new()).is_err());
    }

    #[test]
    fn test_zero_block_duration_is_valid() {
        let config =
            LimiterConfig::resolve("api", &LimiterOptions::new().block_duration_secs(0)).unwrap();
        assert_eq!(config.block_duration_secs(), 0);
    }

    #[test]
    fn test_longest_durations_fit_in_quota() {
        let options = LimiterOptions::new()
            .duration_secs(MAX_DURATION_SECS)
            .block_duration_secs(MAX_DURATION_SECS);
        let quota = LimiterConfig::resolve("api", &options).unwrap().quota();
        assert_eq!(quota.duration_ms, MAX_DURATION_SECS * 1000);
        assert_eq!(quota.block_ms, MAX_DURATION_SECS * 1000);
    }

    #[test]
    fn test_quota_in_milliseconds() {
        let config = LimiterConfig::resolve("webhook", &LimiterOptions::new()).unwrap();
        let quota = config.quota();
        assert_eq!(quota.points, 50);
        assert_eq!(quota.duration_ms, 60_000);
        assert_eq!(quota.block_ms, 60_000);
    }

    #[test]
    fn test_options_from_yaml() {
        let yaml = r#"
preset: aiInference
points: 3
"#;
        let options: LimiterOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.preset, Some(Preset::AiInference));
        assert_eq!(options.points, Some(3));
        assert_eq!(options.duration_secs, None);
    }
}
