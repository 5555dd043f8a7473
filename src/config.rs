// Configuration File Support
//
// This module provides configuration parsing for the admission engine.
// The document format is JSON with camelCase keys, matching the config
// consumed by the wider deployment, with environment variable overrides.
// Precedence: environment > file > built-in defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default requests per second for the global bucket
pub const DEFAULT_GLOBAL_RPS: f64 = 1000.0;

/// Default burst capacity for the global bucket
pub const DEFAULT_GLOBAL_BURST: f64 = 2000.0;

/// Default cap on admitted-but-unreleased requests
pub const DEFAULT_MAX_CONCURRENT: usize = 50;

/// Default queue wait deadline in milliseconds
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 30_000;

/// Default maximum number of waiting queue entries
pub const DEFAULT_QUEUE_MAX_SIZE: usize = 1000;

/// Default drain loop interval in milliseconds
pub const DEFAULT_DRAIN_INTERVAL_MS: u64 = 100;

/// Tier assigned to users never seen before
pub const DEFAULT_TIER: &str = "free";

/// Main configuration for the admission engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AdmissionConfig {
    /// Global throughput and queue settings
    pub global: GlobalConfig,

    /// Per-provider rate limits
    pub providers: Vec<ProviderConfig>,

    /// Per-model rate limits and request costs
    pub models: Vec<ModelConfig>,

    /// Named user tiers (rate + quota profiles)
    pub user_tiers: HashMap<String, TierConfig>,

    /// Quota alert thresholds as fractions of the limit
    pub alert_thresholds: Vec<f64>,
}

/// Global tier and queue settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Requests per second for the global bucket
    pub requests_per_second: f64,

    /// Burst capacity for the global bucket
    pub burst_capacity: f64,

    /// Maximum admitted-but-unreleased requests
    pub max_concurrent_requests: usize,

    /// Default wait deadline for queued requests (milliseconds; the key
    /// `queueTimeout` is accepted as well as `queueTimeoutMs`)
    #[serde(alias = "queueTimeout")]
    pub queue_timeout_ms: u64,

    /// Maximum waiting entries before enqueues are rejected
    pub queue_max_size: usize,

    /// Drain loop interval (milliseconds)
    pub drain_interval_ms: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            requests_per_second: DEFAULT_GLOBAL_RPS,
            burst_capacity: DEFAULT_GLOBAL_BURST,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT,
            queue_timeout_ms: DEFAULT_QUEUE_TIMEOUT_MS,
            queue_max_size: DEFAULT_QUEUE_MAX_SIZE,
            drain_interval_ms: DEFAULT_DRAIN_INTERVAL_MS,
        }
    }
}

/// Rate limit for one provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Provider name (e.g. "openai", "anthropic")
    pub provider: String,

    /// Requests per second for this provider's bucket
    pub requests_per_second: f64,

    /// Burst capacity for this provider's bucket
    pub burst_capacity: f64,

    /// Optional per-provider concurrency hint (parsed, not gated here)
    pub max_concurrent: Option<usize>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            requests_per_second: 10.0,
            burst_capacity: 20.0,
            max_concurrent: None,
        }
    }
}

/// Rate limit and cost for one model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelConfig {
    /// Model identifier (e.g. "gpt-4o")
    pub model_id: String,

    /// Provider the model belongs to
    pub provider: String,

    /// Requests per second for this model's bucket
    pub requests_per_second: f64,

    /// Burst capacity for this model's bucket
    pub burst_capacity: f64,

    /// Flat cost charged against the user's quota per admitted request (USD)
    pub cost_per_request: Option<f64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            provider: String::new(),
            requests_per_second: 10.0,
            burst_capacity: 20.0,
            cost_per_request: None,
        }
    }
}

/// Rate and quota profile for a user tier
///
/// Quota limits of 0 mean unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TierConfig {
    /// Requests per second for each user's bucket in this tier
    pub requests_per_second: f64,

    /// Burst capacity for each user's bucket in this tier
    pub burst_capacity: f64,

    /// Requests allowed per UTC day (0 = unlimited)
    pub daily_quota: u64,

    /// Requests allowed per calendar month (0 = unlimited)
    pub monthly_quota: u64,

    /// Spend allowed per UTC day in USD (0 = unlimited)
    pub cost_limit: f64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5.0,
            burst_capacity: 5.0,
            daily_quota: 200,
            monthly_quota: 5000,
            cost_limit: 5.0,
        }
    }
}

fn default_tiers() -> HashMap<String, TierConfig> {
    let mut tiers = HashMap::new();
    tiers.insert("free".to_string(), TierConfig::default());
    tiers.insert(
        "pro".to_string(),
        TierConfig {
            requests_per_second: 50.0,
            burst_capacity: 100.0,
            daily_quota: 5000,
            monthly_quota: 100_000,
            cost_limit: 100.0,
        },
    );
    tiers.insert(
        "enterprise".to_string(),
        TierConfig {
            requests_per_second: 500.0,
            burst_capacity: 1000.0,
            daily_quota: 0,
            monthly_quota: 0,
            cost_limit: 0.0,
        },
    );
    tiers
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            providers: Vec::new(),
            models: Vec::new(),
            user_tiers: default_tiers(),
            alert_thresholds: vec![0.5, 0.8, 0.9, 0.95],
        }
    }
}

impl AdmissionConfig {
    /// Parse a configuration document from a JSON string
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed or fails validation.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: AdmissionConfig =
            serde_json::from_str(content).context("Failed to parse admission config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or is
    /// invalid. If the config file does not exist, returns defaults (with
    /// environment overrides applied).
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default().apply_env_overrides());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: AdmissionConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        // Apply environment variable overrides
        let config = config.apply_env_overrides();

        // Validate configuration
        config.validate()?;

        tracing::info!("Loaded admission config from {:?}", path);
        Ok(config)
    }

    /// Load configuration, falling back to built-in defaults on any error
    ///
    /// Invalid or unreadable config never fails startup; the problem is
    /// logged and defaults (plus environment overrides) are used instead.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load_from_path(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "Failed to load admission config from {:?}: {e:#}; using defaults",
                    path.as_ref()
                );
                Self::default().apply_env_overrides()
            }
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - RATE_LIMIT_MAX_CONCURRENT
    /// - RATE_LIMIT_QUEUE_TIMEOUT (milliseconds)
    /// - RATE_LIMIT_QUEUE_MAX_SIZE
    /// - <PROVIDER>_RATE_LIMIT (e.g. OPENAI_RATE_LIMIT)
    /// - <PROVIDER>_BURST_LIMIT
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("RATE_LIMIT_MAX_CONCURRENT") {
            match value.parse::<usize>() {
                Ok(n) if n > 0 => self.global.max_concurrent_requests = n,
                _ => tracing::warn!("Ignoring invalid RATE_LIMIT_MAX_CONCURRENT: {value}"),
            }
        }
        if let Ok(value) = std::env::var("RATE_LIMIT_QUEUE_TIMEOUT") {
            match value.parse::<u64>() {
                Ok(ms) if ms > 0 => self.global.queue_timeout_ms = ms,
                _ => tracing::warn!("Ignoring invalid RATE_LIMIT_QUEUE_TIMEOUT: {value}"),
            }
        }
        if let Ok(value) = std::env::var("RATE_LIMIT_QUEUE_MAX_SIZE") {
            match value.parse::<usize>() {
                Ok(n) if n > 0 => self.global.queue_max_size = n,
                _ => tracing::warn!("Ignoring invalid RATE_LIMIT_QUEUE_MAX_SIZE: {value}"),
            }
        }

        for provider in &mut self.providers {
            let key = env_key(&provider.provider);

            if let Ok(value) = std::env::var(format!("{key}_RATE_LIMIT")) {
                match value.parse::<f64>() {
                    Ok(rps) if rps > 0.0 => provider.requests_per_second = rps,
                    _ => tracing::warn!("Ignoring invalid {key}_RATE_LIMIT: {value}"),
                }
            }
            if let Ok(value) = std::env::var(format!("{key}_BURST_LIMIT")) {
                match value.parse::<f64>() {
                    Ok(burst) if burst > 0.0 => provider.burst_capacity = burst,
                    _ => tracing::warn!("Ignoring invalid {key}_BURST_LIMIT: {value}"),
                }
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.global.requests_per_second <= 0.0 {
            anyhow::bail!("Global requestsPerSecond must be > 0");
        }
        if self.global.burst_capacity < self.global.requests_per_second {
            anyhow::bail!("Global burstCapacity must be >= requestsPerSecond");
        }
        if self.global.max_concurrent_requests == 0 {
            anyhow::bail!("maxConcurrentRequests must be > 0");
        }
        if self.global.queue_max_size == 0 {
            anyhow::bail!("queueMaxSize must be > 0");
        }
        if self.global.queue_timeout_ms == 0 {
            anyhow::bail!("queueTimeoutMs must be > 0");
        }
        if self.global.drain_interval_ms == 0 {
            anyhow::bail!("drainIntervalMs must be > 0");
        }

        for provider in &self.providers {
            if provider.provider.is_empty() {
                anyhow::bail!("Provider entry has empty provider name");
            }
            if provider.requests_per_second <= 0.0 {
                anyhow::bail!(
                    "Provider '{}' requestsPerSecond must be > 0",
                    provider.provider
                );
            }
            if provider.burst_capacity < provider.requests_per_second {
                anyhow::bail!(
                    "Provider '{}' burstCapacity must be >= requestsPerSecond",
                    provider.provider
                );
            }
        }

        for model in &self.models {
            if model.model_id.is_empty() {
                anyhow::bail!("Model entry has empty modelId");
            }
            if model.requests_per_second <= 0.0 {
                anyhow::bail!("Model '{}' requestsPerSecond must be > 0", model.model_id);
            }
            if model.burst_capacity < model.requests_per_second {
                anyhow::bail!(
                    "Model '{}' burstCapacity must be >= requestsPerSecond",
                    model.model_id
                );
            }
            if model.cost_per_request.is_some_and(|cost| cost < 0.0) {
                anyhow::bail!("Model '{}' costPerRequest must be >= 0", model.model_id);
            }
        }

        for (name, tier) in &self.user_tiers {
            if name.is_empty() {
                anyhow::bail!("User tier with empty name");
            }
            if tier.requests_per_second <= 0.0 {
                anyhow::bail!("Tier '{}' requestsPerSecond must be > 0", name);
            }
            if tier.burst_capacity < tier.requests_per_second {
                anyhow::bail!("Tier '{}' burstCapacity must be >= requestsPerSecond", name);
            }
            if tier.cost_limit < 0.0 {
                anyhow::bail!("Tier '{}' costLimit must be >= 0", name);
            }
        }

        if !self.user_tiers.contains_key(DEFAULT_TIER) {
            anyhow::bail!("User tiers must include the default '{}' tier", DEFAULT_TIER);
        }

        for threshold in &self.alert_thresholds {
            if !(0.0..=1.0).contains(threshold) || *threshold == 0.0 {
                anyhow::bail!("Alert thresholds must be in (0, 1], got {}", threshold);
            }
        }

        Ok(())
    }

    /// Default wait deadline for queued requests
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.global.queue_timeout_ms)
    }

    /// Drain loop interval
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.global.drain_interval_ms)
    }

    /// Look up a user tier by name
    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.user_tiers.get(name)
    }
}

/// Uppercase a provider name into its environment variable prefix
/// ("mistral-large" -> "MISTRAL_LARGE").
fn env_key(provider: &str) -> String {
    provider.to_uppercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AdmissionConfig::default();
        assert_eq!(config.global.requests_per_second, DEFAULT_GLOBAL_RPS);
        assert_eq!(config.global.max_concurrent_requests, DEFAULT_MAX_CONCURRENT);
        assert_eq!(config.global.queue_max_size, DEFAULT_QUEUE_MAX_SIZE);
        assert!(config.user_tiers.contains_key("free"));
        assert!(config.user_tiers.contains_key("pro"));
        assert!(config.user_tiers.contains_key("enterprise"));
        assert_eq!(config.alert_thresholds, vec![0.5, 0.8, 0.9, 0.95]);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(AdmissionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_camel_case_document() {
        let json = r#"{
            "global": { "requestsPerSecond": 100, "burstCapacity": 200,
                        "maxConcurrentRequests": 8, "queueTimeoutMs": 5000,
                        "queueMaxSize": 50, "drainIntervalMs": 100 },
            "providers": [
                { "provider": "openai", "requestsPerSecond": 10, "burstCapacity": 20 }
            ],
            "models": [
                { "modelId": "gpt-4o", "provider": "openai",
                  "requestsPerSecond": 5, "burstCapacity": 10, "costPerRequest": 0.02 }
            ],
            "userTiers": {
                "free": { "requestsPerSecond": 5, "burstCapacity": 5,
                          "dailyQuota": 200, "monthlyQuota": 5000, "costLimit": 5.0 }
            }
        }"#;

        let config = AdmissionConfig::from_json_str(json).unwrap();
        assert_eq!(config.global.max_concurrent_requests, 8);
        assert_eq!(config.providers[0].provider, "openai");
        assert_eq!(config.models[0].cost_per_request, Some(0.02));
        assert_eq!(config.tier("free").unwrap().daily_quota, 200);
        // Omitted sections fall back to defaults
        assert_eq!(config.alert_thresholds, vec![0.5, 0.8, 0.9, 0.95]);
    }

    #[test]
    fn test_parse_queue_timeout_alias() {
        let config =
            AdmissionConfig::from_json_str(r#"{ "global": { "queueTimeout": 5000 } }"#).unwrap();
        assert_eq!(config.global.queue_timeout_ms, 5000);
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        assert!(AdmissionConfig::from_json_str("{ not json").is_err());
    }

    #[test]
    fn test_validation_rejects_zero_global_rate() {
        let mut config = AdmissionConfig::default();
        config.global.requests_per_second = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_burst_below_rate() {
        let mut config = AdmissionConfig::default();
        config.global.burst_capacity = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_missing_default_tier() {
        let mut config = AdmissionConfig::default();
        config.user_tiers.remove(DEFAULT_TIER);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_threshold() {
        let mut config = AdmissionConfig::default();
        config.alert_thresholds = vec![0.5, 1.5];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_queue_size() {
        let mut config = AdmissionConfig::default();
        config.global.queue_max_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_nonexistent_path_returns_defaults() {
        let config = AdmissionConfig::load_from_path("/nonexistent/admission.json").unwrap();
        assert_eq!(config.global.queue_max_size, DEFAULT_QUEUE_MAX_SIZE);
    }

    #[test]
    fn test_load_from_file() {
        let file = NamedTempFile::new().unwrap();
        fs::write(
            file.path(),
            r#"{ "global": { "maxConcurrentRequests": 3 } }"#,
        )
        .unwrap();

        let config = AdmissionConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.global.max_concurrent_requests, 3);
        // Untouched fields keep defaults
        assert_eq!(config.global.queue_timeout_ms, DEFAULT_QUEUE_TIMEOUT_MS);
    }

    #[test]
    fn test_load_or_default_swallows_parse_errors() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "definitely not json").unwrap();

        let config = AdmissionConfig::load_or_default(file.path());
        assert_eq!(config.global.queue_max_size, DEFAULT_QUEUE_MAX_SIZE);
    }

    #[test]
    fn test_provider_env_overrides() {
        std::env::set_var("COHERETEST_RATE_LIMIT", "42.0");
        std::env::set_var("COHERETEST_BURST_LIMIT", "84.0");

        let mut config = AdmissionConfig::default();
        config.providers.push(ProviderConfig {
            provider: "coheretest".to_string(),
            requests_per_second: 10.0,
            burst_capacity: 20.0,
            max_concurrent: None,
        });

        let config = config.apply_env_overrides();
        assert_eq!(config.providers[0].requests_per_second, 42.0);
        assert_eq!(config.providers[0].burst_capacity, 84.0);

        std::env::remove_var("COHERETEST_RATE_LIMIT");
        std::env::remove_var("COHERETEST_BURST_LIMIT");
    }

    #[test]
    fn test_provider_env_key_replaces_dashes() {
        std::env::set_var("MISTRAL_TEST_RATE_LIMIT", "7.5");

        let mut config = AdmissionConfig::default();
        config.providers.push(ProviderConfig {
            provider: "mistral-test".to_string(),
            ..ProviderConfig::default()
        });

        let config = config.apply_env_overrides();
        assert_eq!(config.providers[0].requests_per_second, 7.5);

        std::env::remove_var("MISTRAL_TEST_RATE_LIMIT");
    }

    #[test]
    fn test_invalid_env_override_is_ignored() {
        std::env::set_var("BADPROV_RATE_LIMIT", "not-a-number");

        let mut config = AdmissionConfig::default();
        config.providers.push(ProviderConfig {
            provider: "badprov".to_string(),
            ..ProviderConfig::default()
        });

        let config = config.apply_env_overrides();
        assert_eq!(config.providers[0].requests_per_second, 10.0);

        std::env::remove_var("BADPROV_RATE_LIMIT");
    }
}
