use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::channel::Channel;
use crate::error::{ErrorKind, GatewayError, RelayError};
use crate::providers::openai::types::{
    EmbeddingRequest, FunctionDefinition, GeneralOpenAIRequest, Message, ResponseFormat,
    ToolDefinition, Usage,
};
use crate::providers::{AdaptorRegistry, CanonicalRequest};
use crate::relay::quota::{PricingProvider, settle};
use crate::relay::{BufferSink, RelayInfo, RelayMode, relay_once};
use crate::server::storage_traits::ConsumeLogStore;

const FALLBACK_TEST_MODEL: &str = "gpt-4o-mini";
const TEST_LOG_NAME: &str = "channel test";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestKind {
    #[default]
    Text,
    Function,
    Json,
}

impl TestKind {
    /// Empty or missing selects `Text`; anything unknown is a bad request.
    pub fn parse(raw: Option<&str>) -> Result<Self, GatewayError> {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("text") => Ok(TestKind::Text),
            Some("function") => Ok(TestKind::Function),
            Some("json") => Ok(TestKind::Json),
            Some(other) => Err(GatewayError::BadRequest(format!(
                "unknown test type {}, expected text, function or json",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::Text => "text",
            TestKind::Function => "function",
            TestKind::Json => "json",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestResult {
    pub model: String,
    pub elapsed: Duration,
    pub error: Option<RelayError>,
    pub usage: Option<Usage>,
    pub quota: i64,
}

impl TestResult {
    fn failed(model: String, elapsed: Duration, error: RelayError) -> Self {
        Self {
            model,
            elapsed,
            error: Some(error),
            usage: None,
            quota: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One synthetic round trip against a channel.
#[async_trait]
pub trait ChannelProbe: Send + Sync {
    async fn test(&self, channel: &Channel, model: Option<&str>, kind: TestKind) -> TestResult;
}

pub fn is_embedding_model(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    lower.contains("embedding")
        || lower.contains("embed")
        || model.starts_with("m3e")
        || model.contains("bge-")
}

/// Requested model, else the channel's test model, else its first listed model.
pub fn resolve_test_model(channel: &Channel, requested: Option<&str>) -> String {
    if let Some(m) = requested.map(str::trim).filter(|m| !m.is_empty()) {
        return m.to_string();
    }
    if let Some(m) = channel
        .test_model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
    {
        return m.to_string();
    }
    channel
        .model_list()
        .into_iter()
        .next()
        .unwrap_or_else(|| FALLBACK_TEST_MODEL.to_string())
}

/// Smallest request that exercises `kind` on `model`.
pub fn build_test_request(model: &str, kind: TestKind) -> GeneralOpenAIRequest {
    let mut req = GeneralOpenAIRequest {
        model: model.to_string(),
        ..Default::default()
    };

    if is_embedding_model(model) {
        req.input = Some(json!(["hello world"]));
        return req;
    }

    if model.starts_with('o') {
        req.max_completion_tokens = Some(32);
    } else if model.contains("thinking") {
        if !model.contains("claude") {
            req.max_tokens = Some(64);
        }
    } else if model.contains("gemini") {
        req.max_tokens = Some(128);
    } else {
        req.max_tokens = Some(64);
    }
    req.temperature = Some(0.0);

    let system_role = req.system_role_name();
    match kind {
        TestKind::Json => {
            req.messages = vec![
                Message::text(
                    system_role,
                    "Return ONLY a valid JSON object. No prose, no code fences, no explanations.",
                ),
                Message::text(
                    "user",
                    format!(
                        "Return a minimal JSON with fields: {{\"ok\": true, \"model\": \"{}\", \"ts\": current unix timestamp integer}}.",
                        model
                    ),
                ),
            ];
            req.response_format = Some(ResponseFormat {
                kind: "json_object".to_string(),
                json_schema: None,
            });
        }
        TestKind::Function => {
            req.tools = Some(vec![ToolDefinition {
                kind: "function".to_string(),
                function: FunctionDefinition {
                    name: "add".to_string(),
                    description: Some("Sum two integers".to_string()),
                    parameters: Some(json!({
                        "type": "object",
                        "properties": {
                            "a": {"type": "integer"},
                            "b": {"type": "integer"}
                        },
                        "required": ["a", "b"],
                        "additionalProperties": false
                    })),
                },
            }]);
            req.tool_choice = Some(json!("required"));
            req.messages = vec![
                Message::text(
                    system_role,
                    "You are a function-calling assistant. Prefer calling tools when available.",
                ),
                Message::text("user", "Please add 2 and 3."),
            ];
        }
        TestKind::Text => {
            req.messages = vec![Message::text("user", "hi")];
        }
    }
    req
}

pub struct ChannelTester {
    adaptors: Arc<AdaptorRegistry>,
    pricing: Arc<dyn PricingProvider>,
    ledger: Arc<dyn ConsumeLogStore>,
    timeout: Duration,
}

impl ChannelTester {
    pub fn new(
        adaptors: Arc<AdaptorRegistry>,
        pricing: Arc<dyn PricingProvider>,
        ledger: Arc<dyn ConsumeLogStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            adaptors,
            pricing,
            ledger,
            timeout,
        }
    }

    async fn run(
        &self,
        channel: &Channel,
        model: &str,
        kind: TestKind,
    ) -> Result<(Usage, i64), RelayError> {
        if let Some(name) = channel.channel_type.untestable_name() {
            return Err(RelayError::new(
                ErrorKind::ChannelUnsupported,
                format!("{} channel test is not supported", name),
            ));
        }

        let mode = if is_embedding_model(model) || channel.channel_type.embedding_only() {
            RelayMode::Embeddings
        } else {
            RelayMode::ChatCompletions
        };
        // 多 key 渠道只测第一个 key
        let api_key = channel
            .keys()
            .into_iter()
            .next()
            .ok_or_else(|| RelayError::invalid_input("channel has no api key"))?;

        let mut info = RelayInfo::new(channel, api_key, model, mode, self.timeout)?;
        info.apply_model_mapping(channel)?;
        let upstream_model = info.upstream_model_name.clone();

        let adaptor = self.adaptors.get(info.api_type).ok_or_else(|| {
            RelayError::new(
                ErrorKind::InvalidApiType,
                format!("invalid api type {:?}, adaptor is nil", info.api_type),
            )
        })?;

        let request = build_test_request(&upstream_model, kind);
        let price = self.pricing.price_for(&info.origin_model_name)?;

        tracing::info!(
            channel_id = channel.id,
            model = %upstream_model,
            kind = kind.as_str(),
            adaptor = adaptor.channel_name(),
            "testing channel"
        );

        let canonical = match mode {
            RelayMode::Embeddings => CanonicalRequest::Embedding(EmbeddingRequest {
                model: upstream_model,
                input: request.input,
                encoding_format: None,
                dimensions: None,
                user: None,
            }),
            _ => {
                info = info.with_chat_request(&request);
                CanonicalRequest::Chat(request)
            }
        };

        let mut sink = BufferSink::default();
        let usage = relay_once(adaptor.as_ref(), &mut info, &canonical, &mut sink).await?;

        let quota = settle(
            self.ledger.as_ref(),
            &info,
            &price,
            &usage,
            self.pricing.quota_per_unit(),
            TEST_LOG_NAME,
            format!("{} test", kind.as_str()),
        )
        .await;

        tracing::debug!(channel_id = channel.id, response = %sink.body_text(), "channel test response");
        Ok((usage, quota))
    }
}

#[async_trait]
impl ChannelProbe for ChannelTester {
    async fn test(&self, channel: &Channel, model: Option<&str>, kind: TestKind) -> TestResult {
        let start = Instant::now();
        let model = resolve_test_model(channel, model);
        match self.run(channel, &model, kind).await {
            Ok((usage, quota)) => TestResult {
                model,
                elapsed: start.elapsed(),
                error: None,
                usage: Some(usage),
                quota,
            },
            Err(e) => {
                tracing::warn!(channel_id = channel.id, model = %model, "channel test failed: {}", e);
                TestResult::failed(model, start.elapsed(), e)
            }
        }
    }
}
