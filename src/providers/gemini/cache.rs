use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::types::{
    GeminiCachedContent, GeminiCachedContentRequest, GeminiChatContent, GeminiChatRequest,
    GeminiTool, GeminiToolConfig,
};
use crate::cache::CacheError;
use crate::cache::prompt::{CacheBackend, PromptCacheManager, PromptPrefix};
use crate::http_client::client_for_url_with_timeout;
use crate::relay::RelayInfo;

const CACHE_API_VERSION: &str = "v1beta";

/// Everything in a chat request except the final turn.
#[derive(Serialize)]
struct ReusablePrefix<'a> {
    system_instruction: Option<&'a GeminiChatContent>,
    contents: &'a [GeminiChatContent],
    tools: Option<&'a Vec<GeminiTool>>,
    tool_config: Option<&'a GeminiToolConfig>,
}

fn split_prefix(request: &GeminiChatRequest) -> ReusablePrefix<'_> {
    let history = request.contents.len().saturating_sub(1);
    ReusablePrefix {
        system_instruction: request.system_instruction.as_ref(),
        contents: &request.contents[..history],
        tools: request.tools.as_ref(),
        tool_config: request.tool_config.as_ref(),
    }
}

fn prefix_of(prefix: &ReusablePrefix<'_>) -> Result<PromptPrefix, CacheError> {
    let texts = prefix
        .system_instruction
        .into_iter()
        .chain(prefix.contents.iter())
        .flat_map(|c| c.text_parts());
    PromptPrefix::new(prefix, texts)
}

/// Cached-content lifecycle against the Gemini REST API for one request prefix.
pub struct GeminiCacheClient<'a> {
    base_url: &'a str,
    api_key: &'a str,
    timeout: Duration,
    prefix: ReusablePrefix<'a>,
}

impl<'a> GeminiCacheClient<'a> {
    fn new(info: &'a RelayInfo, request: &'a GeminiChatRequest) -> Self {
        Self {
            base_url: info.base_url.trim_end_matches('/'),
            api_key: &info.api_key,
            timeout: info.timeout,
            prefix: split_prefix(request),
        }
    }
}

#[async_trait]
impl CacheBackend for GeminiCacheClient<'_> {
    async fn cache_exists(&self, handle: &str) -> Result<bool, CacheError> {
        let url = format!("{}/{}/{}", self.base_url, CACHE_API_VERSION, handle);
        let client = client_for_url_with_timeout(&url, self.timeout)?;
        let resp = client
            .get(&url)
            .header("x-goog-api-key", self.api_key)
            .send()
            .await?;
        match resp.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(CacheError::Upstream(format!(
                "verify cached content returned status {}",
                status
            ))),
        }
    }

    async fn create_cache(
        &self,
        model: &str,
        ttl: Duration,
        display_name: &str,
    ) -> Result<String, CacheError> {
        let url = format!("{}/{}/cachedContents", self.base_url, CACHE_API_VERSION);
        let body = GeminiCachedContentRequest {
            model: format!("models/{}", model),
            system_instruction: self.prefix.system_instruction,
            contents: self.prefix.contents,
            tools: self.prefix.tools,
            tool_config: self.prefix.tool_config,
            ttl: format!("{}s", ttl.as_secs()),
            display_name: display_name.to_string(),
        };
        let client = client_for_url_with_timeout(&url, self.timeout)?;
        let resp = client
            .post(&url)
            .header("x-goog-api-key", self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CacheError::Upstream(format!(
                "create cached content failed with status {}: {}",
                status.as_u16(),
                text
            )));
        }
        let created: GeminiCachedContent = resp.json().await?;
        if created.name.is_empty() {
            return Err(CacheError::Upstream(
                "create cached content returned no name".to_string(),
            ));
        }
        Ok(created.name)
    }
}

/// Rewrites `request` to reference an upstream cached prefix when one is worth
/// using. Returns `None` to send the request unchanged.
pub async fn apply_prompt_cache(
    manager: &PromptCacheManager,
    info: &mut RelayInfo,
    model: &str,
    request: &GeminiChatRequest,
) -> Option<GeminiChatRequest> {
    if request.cached_content.is_some() || request.contents.is_empty() {
        return None;
    }
    let prefix = match prefix_of(&split_prefix(request)) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(channel_id = info.channel_id, "fingerprint prompt prefix failed: {}", e);
            return None;
        }
    };
    if !manager.should_cache(model, &prefix) {
        return None;
    }

    let outcome = {
        let backend = GeminiCacheClient::new(info, request);
        manager
            .get_or_create(&backend, info.channel_id, model, &prefix)
            .await
    };
    let outcome = match outcome {
        Ok(o) => o,
        Err(e) => {
            tracing::warn!(
                channel_id = info.channel_id,
                model,
                "prompt cache unavailable, sending full request: {}",
                e
            );
            return None;
        }
    };

    if outcome.created {
        info.cache_write_tokens = outcome.estimated_tokens as u32;
    }

    let last = request.contents.last().cloned();
    Some(GeminiChatRequest {
        contents: last.into_iter().collect(),
        system_instruction: None,
        tools: None,
        tool_config: None,
        cached_content: Some(outcome.handle),
        safety_settings: request.safety_settings.clone(),
        generation_config: request.generation_config.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::cache::prompt::MIN_CACHE_TOKENS;
    use crate::channel::{Channel, ChannelStatus, ChannelType};
    use crate::config::PromptCacheConfig;
    use crate::providers::gemini::types::GeminiPart;
    use crate::relay::RelayMode;
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn info(base_url: &str) -> RelayInfo {
        let channel = Channel {
            id: 5,
            name: "gemini".into(),
            channel_type: ChannelType::Gemini,
            base_url: Some(base_url.to_string()),
            key: "secret".into(),
            models: "gemini-2.5-pro".into(),
            test_model: None,
            model_mapping: None,
            group: "default".into(),
            status: ChannelStatus::Enabled,
            response_time_ms: 0,
            auto_ban: true,
            test_time: None,
        };
        RelayInfo::new(
            &channel,
            "secret".into(),
            "gemini-2.5-pro",
            RelayMode::ChatCompletions,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn turn(role: &str, text: String) -> GeminiChatContent {
        GeminiChatContent {
            role: Some(role.to_string()),
            parts: vec![GeminiPart::text(text)],
        }
    }

    fn long_request() -> GeminiChatRequest {
        GeminiChatRequest {
            system_instruction: Some(turn("user", vec!["rule"; MIN_CACHE_TOKENS].join(" "))),
            contents: vec![
                turn("user", "first question".into()),
                turn("model", "first answer".into()),
                turn("user", "latest question".into()),
            ],
            ..Default::default()
        }
    }

    fn manager() -> PromptCacheManager {
        PromptCacheManager::new(
            Arc::new(MemoryStore::new()),
            PromptCacheConfig {
                enabled: true,
                ..PromptCacheConfig::default()
            },
        )
    }

    #[test]
    fn prefix_excludes_final_turn() {
        let req = long_request();
        let prefix = split_prefix(&req);
        assert_eq!(prefix.contents.len(), 2);
        let p = prefix_of(&prefix).unwrap();
        assert_eq!(p.estimated_tokens(), MIN_CACHE_TOKENS + 4);
    }

    #[tokio::test]
    async fn short_prompts_are_sent_unchanged() {
        let mut info = info("http://127.0.0.1:9");
        let req = GeminiChatRequest {
            contents: vec![turn("user", "hi".into())],
            ..Default::default()
        };
        assert!(
            apply_prompt_cache(&manager(), &mut info, "gemini-2.5-pro", &req)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn creates_cache_then_reuses_it() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/cachedContents"))
            .and(header("x-goog-api-key", "secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": "cachedContents/abc"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1beta/cachedContents/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": "cachedContents/abc"})))
            .expect(1)
            .mount(&server)
            .await;

        let manager = manager();
        let req = long_request();

        let mut first = info(&server.uri());
        let out = apply_prompt_cache(&manager, &mut first, "gemini-2.5-pro", &req)
            .await
            .unwrap();
        assert_eq!(out.cached_content.as_deref(), Some("cachedContents/abc"));
        assert!(out.system_instruction.is_none());
        assert_eq!(out.contents.len(), 1);
        assert_eq!(out.contents[0].text_parts().collect::<String>(), "latest question");
        assert_eq!(first.cache_write_tokens as usize, MIN_CACHE_TOKENS + 4);

        let mut second = info(&server.uri());
        let out = apply_prompt_cache(&manager, &mut second, "gemini-2.5-pro", &req)
            .await
            .unwrap();
        assert_eq!(out.cached_content.as_deref(), Some("cachedContents/abc"));
        assert_eq!(second.cache_write_tokens, 0);
    }

    #[tokio::test]
    async fn create_failure_falls_back_to_full_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/cachedContents"))
            .respond_with(ResponseTemplate::new(400).set_body_string("too small"))
            .mount(&server)
            .await;

        let mut info = info(&server.uri());
        let out = apply_prompt_cache(&manager(), &mut info, "gemini-2.5-pro", &long_request()).await;
        assert!(out.is_none());
        assert_eq!(info.cache_write_tokens, 0);
    }

    #[tokio::test]
    async fn verify_distinguishes_missing_from_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1beta/cachedContents/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1beta/cachedContents/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let info = info(&server.uri());
        let req = long_request();
        let client = GeminiCacheClient::new(&info, &req);
        assert!(!client.cache_exists("cachedContents/gone").await.unwrap());
        assert!(client.cache_exists("cachedContents/broken").await.is_err());
    }
}
