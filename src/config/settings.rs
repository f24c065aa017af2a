use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::channel::ChannelType;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub prompt_cache: PromptCacheConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Channels seeded into the store on boot.
    #[serde(default)]
    pub channels: Vec<ChannelSeed>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    FirstAvailable,
    RoundRobin,
    Random,
}

impl Default for BalanceStrategy {
    fn default() -> Self {
        Self::FirstAvailable
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub database_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            database_path: "data/gateway.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub request_timeout_secs: u64,
    pub strategy: BalanceStrategy,
    /// Hosts reached directly even when a proxy is configured in the environment.
    pub proxy_bypass_hosts: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
            strategy: BalanceStrategy::default(),
            proxy_bypass_hosts: Vec::new(),
        }
    }
}

impl RelayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub thinking_adapter_enabled: bool,
    pub default_version: String,
    /// Per-model API version overrides, e.g. `"gemini-1.0-pro" = "v1"`.
    pub version_overrides: HashMap<String, String>,
    /// Applied to every harm category when set (e.g. `BLOCK_NONE`).
    pub safety_threshold: Option<String>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            thinking_adapter_enabled: true,
            default_version: "v1beta".to_string(),
            version_overrides: HashMap::new(),
            safety_threshold: None,
        }
    }
}

impl GeminiConfig {
    pub fn version_for(&self, model: &str) -> &str {
        self.version_overrides
            .get(model)
            .map(|s| s.as_str())
            .unwrap_or(&self.default_version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptCacheConfig {
    pub enabled: bool,
    /// Lifetime requested for the upstream cached content.
    pub ttl_secs: u64,
    /// Lifetime of the hash -> handle mapping in the shared store.
    pub mapping_ttl_secs: u64,
    pub namespace: String,
    /// Scope keys by channel id so handles never cross credentials.
    pub per_channel: bool,
    /// Shared store; an in-process map is used when absent.
    pub redis_url: Option<String>,
    pub store_timeout_ms: u64,
}

impl Default for PromptCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 3600,
            mapping_ttl_secs: 3600,
            namespace: "gemini_cache".to_string(),
            per_channel: true,
            redis_url: None,
            store_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub automatic_disable_channel_enabled: bool,
    pub automatic_enable_channel_enabled: bool,
    /// Latency above this many seconds counts as a failure in batch tests. 0 disables the check.
    pub channel_disable_threshold_secs: f64,
    pub request_interval_ms: u64,
    /// Period of the automatic batch test in minutes. 0 turns it off.
    pub test_frequency_minutes: u64,
    pub disable_keywords: Vec<String>,
    pub disable_status_codes: Vec<u16>,
    pub notify_webhook_url: Option<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            automatic_disable_channel_enabled: true,
            automatic_enable_channel_enabled: true,
            channel_disable_threshold_secs: 5.0,
            request_interval_ms: 0,
            test_frequency_minutes: 0,
            disable_keywords: default_disable_keywords(),
            disable_status_codes: vec![401],
            notify_webhook_url: None,
        }
    }
}

fn default_disable_keywords() -> Vec<String> {
    [
        "your credit balance is too low",
        "this organization has been disabled.",
        "you exceeded your current quota",
        "permission denied",
        "the security token included in the request is invalid",
        "operation not allowed",
        "your account is not authorized",
        "api key not valid",
        "api key expired",
        "invalid api key",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl HealthConfig {
    pub fn disable_threshold(&self) -> Option<Duration> {
        if self.channel_disable_threshold_secs > 0.0 {
            Some(Duration::from_secs_f64(self.channel_disable_threshold_secs))
        } else {
            None
        }
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub quota_per_unit: f64,
    pub model_ratio: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    /// Flat per-call price; takes precedence over ratios.
    pub model_price: HashMap<String, f64>,
    /// Used for models missing from `model_ratio`; unpriced models are rejected when absent.
    pub default_model_ratio: Option<f64>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            quota_per_unit: 500_000.0,
            model_ratio: HashMap::new(),
            completion_ratio: HashMap::new(),
            model_price: HashMap::new(),
            default_model_ratio: Some(1.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSeed {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub base_url: Option<String>,
    pub keys: Vec<String>,
    pub models: Vec<String>,
    #[serde(default)]
    pub test_model: Option<String>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_true")]
    pub auto_ban: bool,
}

fn default_group() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl Settings {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = Self::find_config_file()?;
        let config_content = std::fs::read_to_string(&config_path)?;
        let settings: Settings = toml::from_str(&config_content)?;
        tracing::info!("Loaded configuration from {}", config_path);
        Ok(settings)
    }

    fn find_config_file() -> Result<String, Box<dyn std::error::Error>> {
        if let Ok(path) = std::env::var("RELAY_CONFIG")
            && !path.trim().is_empty()
        {
            return Ok(path);
        }

        let possible_names = ["custom-config.toml", "config.toml"];

        for name in &possible_names {
            if Path::new(name).exists() {
                return Ok(name.to_string());
            }
        }

        Err("Configuration file not found. Please create custom-config.toml or config.toml".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let s: Settings = toml::from_str("").unwrap();
        assert_eq!(s.server.port, 8000);
        assert_eq!(s.gemini.default_version, "v1beta");
        assert_eq!(s.prompt_cache.namespace, "gemini_cache");
        assert_eq!(s.pricing.quota_per_unit, 500_000.0);
        assert!(s.channels.is_empty());
    }

    #[test]
    fn parses_channels_and_overrides() {
        let s: Settings = toml::from_str(
            r#"
            [gemini]
            version_overrides = { "gemini-1.0-pro" = "v1" }

            [health]
            channel_disable_threshold_secs = 0.0

            [[channels]]
            id = 7
            name = "g"
            type = "gemini"
            keys = ["k1", "k2"]
            models = ["gemini-2.5-flash"]
            "#,
        )
        .unwrap();
        assert_eq!(s.gemini.version_for("gemini-1.0-pro"), "v1");
        assert_eq!(s.gemini.version_for("gemini-2.5-flash"), "v1beta");
        assert!(s.health.disable_threshold().is_none());
        assert_eq!(s.channels[0].channel_type, ChannelType::Gemini);
        assert_eq!(s.channels[0].group, "default");
        assert!(s.channels[0].auto_ban);
    }
}
