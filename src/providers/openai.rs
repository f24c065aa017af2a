pub mod handlers;
pub mod types;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use serde_json::Value;

use super::{Adaptor, CanonicalRequest, header_value};
use crate::error::RelayError;
use crate::relay::{ClientSink, RelayInfo, RelayMode, estimate_tokens};
use types::{StreamOptions, Usage};

/// OpenAI-compatible upstreams: the canonical shape is the wire shape.
pub struct OpenAIAdaptor;

pub(crate) fn mode_path(mode: RelayMode) -> Result<&'static str, RelayError> {
    match mode {
        RelayMode::ChatCompletions => Ok("chat/completions"),
        RelayMode::Embeddings => Ok("embeddings"),
        RelayMode::ImagesGenerations => Ok("images/generations"),
        RelayMode::Rerank => Ok("rerank"),
        RelayMode::AudioSpeech => Ok("audio/speech"),
        RelayMode::GeminiNative => Err(RelayError::not_implemented(
            "native gemini requests need a gemini channel",
        )),
    }
}

/// Serializes the canonical request under the upstream model name. Streams always
/// ask for usage so the gateway can settle; the client flag is kept in `info`.
pub(crate) fn passthrough_body(
    info: &mut RelayInfo,
    request: &CanonicalRequest,
) -> Result<Value, RelayError> {
    let model = info.upstream_model_name.clone();
    let mut value = match request {
        CanonicalRequest::Chat(req) => {
            let mut req = req.clone();
            if req.stream {
                req.stream_options = Some(StreamOptions {
                    include_usage: true,
                });
            }
            serde_json::to_value(req)?
        }
        CanonicalRequest::Embedding(req) => {
            let inputs = req.parse_input();
            if !inputs.iter().any(|s| !s.trim().is_empty()) {
                return Err(RelayError::invalid_input("embedding input is empty"));
            }
            info.prompt_tokens = estimate_tokens(inputs.iter().map(|s| s.as_str())) as u32;
            serde_json::to_value(req)?
        }
        CanonicalRequest::Image(req) => serde_json::to_value(req)?,
        CanonicalRequest::Rerank(req) => serde_json::to_value(req)?,
        CanonicalRequest::Audio(req) => {
            info.prompt_tokens = estimate_tokens([req.input.as_str()]) as u32;
            serde_json::to_value(req)?
        }
        CanonicalRequest::Native(_) => {
            return Err(RelayError::not_implemented(
                "native requests are not supported by openai compatible channels",
            ));
        }
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert("model".to_string(), Value::String(model));
    }
    Ok(value)
}

pub(crate) async fn dispatch_response(
    info: &mut RelayInfo,
    response: reqwest::Response,
    sink: &mut dyn ClientSink,
) -> Result<Usage, RelayError> {
    match info.relay_mode {
        RelayMode::ChatCompletions if info.is_stream => {
            handlers::stream_handler(info, response, sink).await
        }
        RelayMode::AudioSpeech => handlers::binary_handler(info, response, sink).await,
        _ => handlers::json_handler(info, response, sink).await,
    }
}

#[async_trait]
impl Adaptor for OpenAIAdaptor {
    fn channel_name(&self) -> &'static str {
        "openai"
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        Ok(format!(
            "{}/v1/{}",
            info.base_url.trim_end_matches('/'),
            mode_path(info.relay_mode)?
        ))
    }

    fn convert_request(
        &self,
        info: &mut RelayInfo,
        request: &CanonicalRequest,
    ) -> Result<Value, RelayError> {
        passthrough_body(info, request)
    }

    fn setup_headers(&self, info: &RelayInfo, headers: &mut HeaderMap) -> Result<(), RelayError> {
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", info.api_key))?);
        Ok(())
    }

    async fn do_response(
        &self,
        info: &mut RelayInfo,
        response: reqwest::Response,
        sink: &mut dyn ClientSink,
    ) -> Result<Usage, RelayError> {
        dispatch_response(info, response, sink).await
    }
}
