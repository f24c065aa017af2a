use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ChannelSeed;
use crate::error::GatewayError;

/// Provider family of a channel. Several families may share one adaptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    #[serde(rename = "openai")]
    OpenAI,
    Gemini,
    Zhipu,
    MokaAi,
    Midjourney,
    MidjourneyPlus,
    SunoApi,
    Kling,
    Jimeng,
    Vidu,
}

/// Wire family an adaptor speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiType {
    OpenAI,
    Gemini,
    Zhipu,
}

impl ChannelType {
    pub fn as_db_value(&self) -> &'static str {
        match self {
            ChannelType::OpenAI => "openai",
            ChannelType::Gemini => "gemini",
            ChannelType::Zhipu => "zhipu",
            ChannelType::MokaAi => "moka_ai",
            ChannelType::Midjourney => "midjourney",
            ChannelType::MidjourneyPlus => "midjourney_plus",
            ChannelType::SunoApi => "suno_api",
            ChannelType::Kling => "kling",
            ChannelType::Jimeng => "jimeng",
            ChannelType::Vidu => "vidu",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        Some(match value {
            "openai" => ChannelType::OpenAI,
            "gemini" => ChannelType::Gemini,
            "zhipu" => ChannelType::Zhipu,
            "moka_ai" => ChannelType::MokaAi,
            "midjourney" => ChannelType::Midjourney,
            "midjourney_plus" => ChannelType::MidjourneyPlus,
            "suno_api" => ChannelType::SunoApi,
            "kling" => ChannelType::Kling,
            "jimeng" => ChannelType::Jimeng,
            "vidu" => ChannelType::Vidu,
            _ => return None,
        })
    }

    pub fn api_type(&self) -> Option<ApiType> {
        match self {
            ChannelType::OpenAI | ChannelType::MokaAi => Some(ApiType::OpenAI),
            ChannelType::Gemini => Some(ApiType::Gemini),
            ChannelType::Zhipu => Some(ApiType::Zhipu),
            _ => None,
        }
    }

    /// Display name of media-generation types that cannot be probed with a chat request.
    pub fn untestable_name(&self) -> Option<&'static str> {
        match self {
            ChannelType::Midjourney => Some("Midjourney"),
            ChannelType::MidjourneyPlus => Some("Midjourney Plus"),
            ChannelType::SunoApi => Some("Suno"),
            ChannelType::Kling => Some("Kling"),
            ChannelType::Jimeng => Some("Jimeng"),
            ChannelType::Vidu => Some("Vidu"),
            _ => None,
        }
    }

    /// Channel types that only serve embeddings.
    pub fn embedding_only(&self) -> bool {
        matches!(self, ChannelType::MokaAi)
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ChannelType::Gemini => "https://generativelanguage.googleapis.com",
            ChannelType::Zhipu => "https://open.bigmodel.cn",
            ChannelType::MokaAi => "https://api.moka.ai",
            _ => "https://api.openai.com",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub fn as_db_value(&self) -> i64 {
        match self {
            ChannelStatus::Enabled => 1,
            ChannelStatus::ManuallyDisabled => 2,
            ChannelStatus::AutoDisabled => 3,
        }
    }

    pub fn from_db_value(value: i64) -> Self {
        match value {
            1 => ChannelStatus::Enabled,
            3 => ChannelStatus::AutoDisabled,
            _ => ChannelStatus::ManuallyDisabled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub channel_type: ChannelType,
    pub base_url: Option<String>,
    /// One key per line.
    pub key: String,
    /// Comma separated.
    pub models: String,
    pub test_model: Option<String>,
    /// JSON object mapping requested names to upstream names.
    pub model_mapping: Option<String>,
    pub group: String,
    pub status: ChannelStatus,
    pub response_time_ms: i64,
    pub auto_ban: bool,
    pub test_time: Option<DateTime<Utc>>,
}

impl Channel {
    pub fn from_seed(seed: &ChannelSeed) -> Self {
        let model_mapping = if seed.model_mapping.is_empty() {
            None
        } else {
            serde_json::to_string(&seed.model_mapping).ok()
        };
        Self {
            id: seed.id,
            name: seed.name.clone(),
            channel_type: seed.channel_type,
            base_url: seed.base_url.clone(),
            key: seed.keys.join("\n"),
            models: seed.models.join(","),
            test_model: seed.test_model.clone(),
            model_mapping,
            group: seed.group.clone(),
            status: ChannelStatus::Enabled,
            response_time_ms: 0,
            auto_ban: seed.auto_ban,
            test_time: None,
        }
    }

    pub fn model_list(&self) -> Vec<String> {
        self.models
            .split(',')
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .map(|m| m.to_string())
            .collect()
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.split(',').any(|m| m.trim() == model)
    }

    pub fn keys(&self) -> Vec<String> {
        self.key
            .lines()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(|k| k.to_string())
            .collect()
    }

    pub fn base_url(&self) -> String {
        match self.base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => self.channel_type.default_base_url().to_string(),
        }
    }

    pub fn model_mapping(&self) -> Result<HashMap<String, String>, serde_json::Error> {
        match self.model_mapping.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() && raw != "{}" => serde_json::from_str(raw),
            _ => Ok(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn get_channel(&self, id: i64) -> Result<Option<Channel>, GatewayError>;
    async fn list_channels(&self) -> Result<Vec<Channel>, GatewayError>;
    async fn upsert_channel(&self, channel: &Channel) -> Result<(), GatewayError>;
    async fn update_channel_status(
        &self,
        id: i64,
        status: ChannelStatus,
        reason: Option<&str>,
    ) -> Result<bool, GatewayError>;
    async fn update_response_time(&self, id: i64, response_time_ms: i64)
    -> Result<(), GatewayError>;
}
