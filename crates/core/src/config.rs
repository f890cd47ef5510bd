use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Missing required configuration: {0}")]
    Missing(String),
}

/// Everything tunable about one pipeline deployment. Loaded from TOML with
/// env-supplied secrets; a missing required secret aborts the run before any
/// write happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_reporting_currency")]
    pub reporting_currency: String,
    #[serde(default)]
    pub matcher: MatcherSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Base URL of the exchange-rate service.
    pub rates_url: Option<String>,
    /// Base URL of the AI classification service.
    pub classifier_url: Option<String>,
    /// Filled from the environment, never from the TOML file.
    #[serde(skip)]
    pub classifier_api_key: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            reporting_currency: default_reporting_currency(),
            matcher: MatcherSettings::default(),
            retry: RetrySettings::default(),
            batch_size: default_batch_size(),
            rates_url: None,
            classifier_url: None,
            classifier_api_key: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Pulls secrets from the environment. Must run, and succeed, before the
    /// pipeline touches storage.
    pub fn resolve_secrets(&mut self) -> Result<(), ConfigError> {
        if self.classifier_url.is_some() {
            let key = std::env::var("TALLY_CLASSIFIER_API_KEY")
                .map_err(|_| ConfigError::Missing("TALLY_CLASSIFIER_API_KEY".to_string()))?;
            if key.trim().is_empty() {
                return Err(ConfigError::Missing("TALLY_CLASSIFIER_API_KEY".to_string()));
            }
            self.classifier_api_key = Some(key);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherSettings {
    /// How far back (days) the historical pool reaches from a new
    /// transaction's date.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    /// Minimum Jaccard score (0-100) for a fuzzy description match.
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    /// Amount tolerance as a fraction of the new transaction's amount.
    #[serde(default = "default_amount_tolerance")]
    pub amount_tolerance_ratio: f64,
    #[serde(default = "default_match_limit")]
    pub match_limit: usize,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        MatcherSettings {
            lookback_days: default_lookback_days(),
            fuzzy_threshold: default_fuzzy_threshold(),
            amount_tolerance_ratio: default_amount_tolerance(),
            match_limit: default_match_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_reporting_currency() -> String {
    "GBP".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_lookback_days() -> i64 {
    90
}
fn default_fuzzy_threshold() -> f64 {
    60.0
}
fn default_amount_tolerance() -> f64 {
    0.10
}
fn default_match_limit() -> usize {
    5
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay_ms() -> u64 {
    2_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    32_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let cfg = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.reporting_currency, "GBP");
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.matcher.lookback_days, 90);
        assert_eq!(cfg.matcher.fuzzy_threshold, 60.0);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.initial_delay_ms, 2_000);
        assert_eq!(cfg.retry.max_delay_ms, 32_000);
    }

    #[test]
    fn partial_toml_overrides() {
        let cfg = PipelineConfig::from_toml_str(
            r#"
            reporting_currency = "EUR"

            [matcher]
            lookback_days = 30
            "#,
        )
        .unwrap();
        assert_eq!(cfg.reporting_currency, "EUR");
        assert_eq!(cfg.matcher.lookback_days, 30);
        assert_eq!(cfg.matcher.match_limit, 5);
    }

    #[test]
    fn garbage_toml_is_a_parse_error() {
        assert!(matches!(
            PipelineConfig::from_toml_str("reporting_currency = ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn secrets_not_required_without_classifier() {
        let mut cfg = PipelineConfig::default();
        cfg.resolve_secrets().unwrap();
        assert!(cfg.classifier_api_key.is_none());
    }
}
