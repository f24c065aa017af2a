use chrono::Utc;

use crate::config::PricingConfig;
use crate::error::{ErrorKind, RelayError};
use crate::logging::types::ConsumeLog;
use crate::providers::openai::types::{Usage, cached_tokens};
use crate::relay::RelayInfo;
use crate::server::storage_traits::ConsumeLogStore;

#[derive(Debug, Clone, PartialEq)]
pub struct PriceData {
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub model_price: f64,
    pub use_price: bool,
}

pub trait PricingProvider: Send + Sync {
    fn price_for(&self, model: &str) -> Result<PriceData, RelayError>;
    fn quota_per_unit(&self) -> f64;
}

/// Prices read from the `[pricing]` config section.
pub struct ConfigPricing {
    config: PricingConfig,
}

impl ConfigPricing {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }
}

impl PricingProvider for ConfigPricing {
    fn price_for(&self, model: &str) -> Result<PriceData, RelayError> {
        if let Some(price) = self.config.model_price.get(model) {
            return Ok(PriceData {
                model_ratio: 0.0,
                completion_ratio: 0.0,
                model_price: *price,
                use_price: true,
            });
        }
        let model_ratio = self
            .config
            .model_ratio
            .get(model)
            .copied()
            .or(self.config.default_model_ratio)
            .ok_or_else(|| {
                RelayError::new(
                    ErrorKind::ModelPriceError,
                    format!("model {} ratio or price not set", model),
                )
            })?;
        let completion_ratio = self
            .config
            .completion_ratio
            .get(model)
            .copied()
            .unwrap_or(1.0);
        Ok(PriceData {
            model_ratio,
            completion_ratio,
            model_price: 0.0,
            use_price: false,
        })
    }

    fn quota_per_unit(&self) -> f64 {
        self.config.quota_per_unit
    }
}

/// Quota charged for one call.
///
/// Ratio pricing: `round(round(prompt + round(completion * completion_ratio)) * model_ratio)`,
/// floored at 1 unless the model ratio is zero. Flat pricing: `model_price * quota_per_unit`.
pub fn compute_quota(price: &PriceData, usage: &Usage, quota_per_unit: f64) -> i64 {
    if price.use_price {
        return (price.model_price * quota_per_unit) as i64;
    }
    let completion = (usage.completion_tokens as f64 * price.completion_ratio).round();
    let tokens = (usage.prompt_tokens as f64 + completion).round();
    let mut quota = (tokens * price.model_ratio).round() as i64;
    if price.model_ratio != 0.0 && quota <= 0 {
        quota = 1;
    }
    quota
}

/// Computes the quota and records one consume log. Ledger failures are logged only.
pub async fn settle(
    ledger: &dyn ConsumeLogStore,
    info: &RelayInfo,
    price: &PriceData,
    usage: &Usage,
    quota_per_unit: f64,
    token_name: &str,
    content: String,
) -> i64 {
    let quota = compute_quota(price, usage, quota_per_unit);
    let other = serde_json::json!({
        "model_ratio": price.model_ratio,
        "completion_ratio": price.completion_ratio,
        "model_price": price.model_price,
        "use_price": price.use_price,
        "cache_tokens": cached_tokens(usage),
        "cache_write_tokens": info.cache_write_tokens,
        "upstream_model_name": info.upstream_model_name,
    });
    let log = ConsumeLog {
        id: None,
        created_at: Utc::now(),
        channel_id: info.channel_id,
        model_name: info.origin_model_name.clone(),
        token_name: token_name.to_string(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        quota,
        use_time_ms: info.start_time.elapsed().as_millis() as i64,
        is_stream: info.is_stream,
        group: info.group.clone(),
        content,
        other: other.to_string(),
    };
    if let Err(e) = ledger.record_consume_log(log).await {
        tracing::error!(channel_id = info.channel_id, "Failed to record consume log: {}", e);
    }
    quota
}
