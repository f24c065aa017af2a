pub mod cache;
pub mod convert;
pub mod handlers;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::Value;

use self::types::GeminiChatRequest;
use super::{Adaptor, CanonicalRequest, Usage, header_value};
use crate::cache::prompt::PromptCacheManager;
use crate::config::GeminiConfig;
use crate::error::RelayError;
use crate::relay::{ClientSink, RelayInfo, RelayMode, estimate_tokens};

/// Thinking control carried in a model name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingSuffix {
    None,
    NoThinking,
    Thinking { budget: Option<u32> },
}

/// Splits `gemini-2.5-flash-thinking-1024` into the base model and its suffix.
pub fn parse_thinking_suffix(model: &str) -> (&str, ThinkingSuffix) {
    if let Some(base) = model.strip_suffix("-nothinking") {
        return (base, ThinkingSuffix::NoThinking);
    }
    if let Some(idx) = model.rfind("-thinking-") {
        let digits = &model[idx + "-thinking-".len()..];
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            let budget = digits.parse::<u32>().ok();
            return (&model[..idx], ThinkingSuffix::Thinking { budget });
        }
    }
    if let Some(base) = model.strip_suffix("-thinking") {
        return (base, ThinkingSuffix::Thinking { budget: None });
    }
    (model, ThinkingSuffix::None)
}

pub fn is_gemini_embedding_model(model: &str) -> bool {
    model.starts_with("text-embedding")
        || model.starts_with("embedding")
        || model.starts_with("gemini-embedding")
}

pub struct GeminiAdaptor {
    config: GeminiConfig,
    cache: Option<Arc<PromptCacheManager>>,
}

impl GeminiAdaptor {
    pub fn new(config: GeminiConfig, cache: Option<Arc<PromptCacheManager>>) -> Self {
        Self { config, cache }
    }

    /// Upstream model name with any thinking suffix removed.
    fn wire_model<'a>(&self, info: &'a RelayInfo) -> &'a str {
        if self.config.thinking_adapter_enabled {
            parse_thinking_suffix(&info.upstream_model_name).0
        } else {
            &info.upstream_model_name
        }
    }
}

#[async_trait]
impl Adaptor for GeminiAdaptor {
    fn channel_name(&self) -> &'static str {
        "google gemini"
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        let model = self.wire_model(info);
        let version = self.config.version_for(model);
        let base = info.base_url.trim_end_matches('/');

        let action = if model.starts_with("imagen") {
            "predict"
        } else if is_gemini_embedding_model(model) || info.relay_mode == RelayMode::Embeddings {
            "embedContent"
        } else if info.is_stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        Ok(format!("{}/{}/models/{}:{}", base, version, model, action))
    }

    fn convert_request(
        &self,
        info: &mut RelayInfo,
        request: &CanonicalRequest,
    ) -> Result<Value, RelayError> {
        let value = match request {
            CanonicalRequest::Chat(req) => {
                let out = convert::chat_request(req, &info.upstream_model_name, &self.config)?;
                serde_json::to_value(out)?
            }
            CanonicalRequest::Embedding(req) => {
                let out = convert::embedding_request(req, self.wire_model(info))?;
                info.prompt_tokens =
                    estimate_tokens(out.content.text_parts()).max(1) as u32;
                serde_json::to_value(out)?
            }
            CanonicalRequest::Image(req) => {
                let out = convert::image_request(req, self.wire_model(info))?;
                serde_json::to_value(out)?
            }
            CanonicalRequest::Native(body) => {
                let parsed: GeminiChatRequest = serde_json::from_value(body.clone())
                    .map_err(|e| RelayError::invalid_input(format!("invalid gemini request: {}", e)))?;
                info.prompt_tokens = estimate_tokens(
                    parsed
                        .system_instruction
                        .iter()
                        .chain(parsed.contents.iter())
                        .flat_map(|c| c.text_parts()),
                ) as u32;
                body.clone()
            }
            CanonicalRequest::Rerank(_) | CanonicalRequest::Audio(_) => {
                return Err(RelayError::not_implemented(format!(
                    "{} is not supported by {}",
                    request.capability(),
                    self.channel_name()
                )));
            }
        };
        Ok(value)
    }

    fn setup_headers(&self, info: &RelayInfo, headers: &mut HeaderMap) -> Result<(), RelayError> {
        headers.insert("x-goog-api-key", header_value(&info.api_key)?);
        Ok(())
    }

    async fn prepare_request(&self, info: &mut RelayInfo, body: Value) -> Value {
        if info.relay_mode != RelayMode::ChatCompletions {
            return body;
        }
        let Some(manager) = self.cache.as_deref() else {
            return body;
        };
        let request: GeminiChatRequest = match serde_json::from_value(body.clone()) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(channel_id = info.channel_id, "skip prompt cache: {}", e);
                return body;
            }
        };
        let model = self.wire_model(info).to_string();
        match cache::apply_prompt_cache(manager, info, &model, &request).await {
            Some(rewritten) => serde_json::to_value(rewritten).unwrap_or(body),
            None => body,
        }
    }

    async fn do_response(
        &self,
        info: &mut RelayInfo,
        response: reqwest::Response,
        sink: &mut dyn ClientSink,
    ) -> Result<Usage, RelayError> {
        if info.relay_mode == RelayMode::GeminiNative {
            return if info.is_stream {
                handlers::native_stream_handler(info, response, sink).await
            } else {
                handlers::native_handler(info, response, sink).await
            };
        }
        let model = self.wire_model(info);
        if model.starts_with("imagen") {
            return handlers::image_handler(info, response, sink).await;
        }
        if info.relay_mode == RelayMode::Embeddings || is_gemini_embedding_model(model) {
            return handlers::embedding_handler(info, response, sink).await;
        }
        if info.is_stream {
            handlers::chat_stream_handler(info, response, sink).await
        } else {
            handlers::chat_handler(info, response, sink).await
        }
    }
}
