pub mod gemini;
pub mod openai;
pub mod streaming;
pub mod zhipu;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::{CONTENT_TYPE, HeaderValue};
use serde_json::Value;

use crate::cache::prompt::PromptCacheManager;
use crate::channel::ApiType;
use crate::config::Settings;
use crate::error::RelayError;
use crate::http_client::client_for_url_with_timeout;
use crate::relay::{ClientSink, RelayInfo};

pub use gemini::GeminiAdaptor;
pub use openai::OpenAIAdaptor;
pub use openai::types::{
    AudioSpeechRequest, EmbeddingRequest, GeneralOpenAIRequest, ImageRequest, RerankRequest, Usage,
};
pub use zhipu::ZhipuAdaptor;

/// A request in the gateway's unified shape, tagged by capability.
#[derive(Debug, Clone)]
pub enum CanonicalRequest {
    Chat(GeneralOpenAIRequest),
    Embedding(EmbeddingRequest),
    Image(ImageRequest),
    Rerank(RerankRequest),
    Audio(AudioSpeechRequest),
    /// Provider-native body, forwarded as is.
    Native(Value),
}

impl CanonicalRequest {
    pub fn capability(&self) -> &'static str {
        match self {
            CanonicalRequest::Chat(_) => "chat",
            CanonicalRequest::Embedding(_) => "embedding",
            CanonicalRequest::Image(_) => "image",
            CanonicalRequest::Rerank(_) => "rerank",
            CanonicalRequest::Audio(_) => "audio",
            CanonicalRequest::Native(_) => "native",
        }
    }
}

/// Translation contract between the canonical shape and one provider family.
///
/// `request_url` is pure. `convert_request` validates and builds the native body.
/// `prepare_request` may rewrite the native body before it is sent (prompt caching).
/// `do_response` parses or streams the upstream response into `sink` and returns usage.
#[async_trait]
pub trait Adaptor: Send + Sync {
    fn channel_name(&self) -> &'static str;

    fn request_url(&self, info: &RelayInfo) -> Result<String, RelayError>;

    fn convert_request(
        &self,
        info: &mut RelayInfo,
        request: &CanonicalRequest,
    ) -> Result<Value, RelayError>;

    fn setup_headers(&self, info: &RelayInfo, headers: &mut HeaderMap) -> Result<(), RelayError>;

    async fn prepare_request(&self, _info: &mut RelayInfo, body: Value) -> Value {
        body
    }

    async fn do_request(
        &self,
        info: &RelayInfo,
        body: &Value,
    ) -> Result<reqwest::Response, RelayError> {
        do_api_request(self, info, body).await
    }

    async fn do_response(
        &self,
        info: &mut RelayInfo,
        response: reqwest::Response,
        sink: &mut dyn ClientSink,
    ) -> Result<Usage, RelayError>;
}

/// POSTs `body` to the adaptor's URL with its headers and the per-call timeout.
pub async fn do_api_request<A: Adaptor + ?Sized>(
    adaptor: &A,
    info: &RelayInfo,
    body: &Value,
) -> Result<reqwest::Response, RelayError> {
    let url = adaptor.request_url(info)?;
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    adaptor.setup_headers(info, &mut headers)?;

    let client = client_for_url_with_timeout(&url, info.timeout)
        .map_err(|e| RelayError::unreachable(&e))?;
    tracing::debug!(channel_id = info.channel_id, %url, "sending upstream request");
    client
        .post(&url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(|e| RelayError::unreachable(&e))
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue, RelayError> {
    HeaderValue::from_str(value)
        .map_err(|_| RelayError::invalid_input("api key contains invalid header characters"))
}

/// Adaptors keyed by wire family, resolved once at startup.
pub struct AdaptorRegistry {
    adaptors: HashMap<ApiType, Arc<dyn Adaptor>>,
}

impl AdaptorRegistry {
    pub fn new(settings: &Settings, cache: Option<Arc<PromptCacheManager>>) -> Self {
        let mut adaptors: HashMap<ApiType, Arc<dyn Adaptor>> = HashMap::new();
        adaptors.insert(ApiType::OpenAI, Arc::new(OpenAIAdaptor));
        adaptors.insert(ApiType::Zhipu, Arc::new(ZhipuAdaptor));
        adaptors.insert(
            ApiType::Gemini,
            Arc::new(GeminiAdaptor::new(settings.gemini.clone(), cache)),
        );
        Self { adaptors }
    }

    pub fn get(&self, api_type: ApiType) -> Option<Arc<dyn Adaptor>> {
        self.adaptors.get(&api_type).cloned()
    }
}
