use async_openai::types as oai;
use axum::http::StatusCode;
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use uuid::Uuid;

use super::types::*;
use crate::error::RelayError;
use crate::providers::openai::types::{
    CompletionTokensDetails, EmbeddingData, EmbeddingResponse, FunctionCall, ImageData,
    ImageResponse, PromptTokensDetails, ToolCall, Usage, new_usage,
};
use crate::providers::streaming::{StreamChatCompletionChunk, StreamChoiceDelta, StreamMessage};
use crate::relay::writer::{
    start_event_stream, write_json, write_raw_json, write_sse_data, write_sse_done,
};
use crate::relay::{ClientSink, RelayInfo, estimate_tokens};

/// Prompt tokens charged per generated image.
pub const IMAGE_TOKENS_PER_IMAGE: u32 = 258;

pub fn usage_from_metadata(meta: &GeminiUsageMetadata) -> Usage {
    let completion = meta.candidates_token_count + meta.thoughts_token_count;
    let total = if meta.total_token_count > 0 {
        meta.total_token_count
    } else {
        meta.prompt_token_count + completion
    };
    Usage {
        prompt_tokens: meta.prompt_token_count,
        completion_tokens: completion,
        total_tokens: total,
        prompt_tokens_details: (meta.cached_content_token_count > 0).then(|| PromptTokensDetails {
            cached_tokens: Some(meta.cached_content_token_count),
            audio_tokens: None,
        }),
        completion_tokens_details: (meta.thoughts_token_count > 0).then(|| {
            CompletionTokensDetails {
                reasoning_tokens: Some(meta.thoughts_token_count),
                audio_tokens: None,
                accepted_prediction_tokens: None,
                rejected_prediction_tokens: None,
            }
        }),
    }
}

fn finish_reason(reason: Option<&str>, has_tool_calls: bool) -> Option<&'static str> {
    if has_tool_calls {
        return Some("tool_calls");
    }
    match reason? {
        "STOP" => Some("stop"),
        "MAX_TOKENS" => Some("length"),
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            Some("content_filter")
        }
        _ => Some("stop"),
    }
}

fn candidate_tool_calls(candidate: &GeminiCandidate) -> Vec<ToolCall> {
    candidate
        .content
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| p.function_call.as_ref())
        .enumerate()
        .map(|(i, call)| ToolCall {
            index: Some(i as u32),
            id: format!("call_{}", Uuid::new_v4().simple()),
            kind: "function".to_string(),
            function: FunctionCall {
                name: call.name.clone(),
                arguments: serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".into()),
            },
        })
        .collect()
}

/// Visible text and thought text of one candidate.
fn candidate_texts(candidate: &GeminiCandidate) -> (String, String) {
    let mut text = String::new();
    let mut thoughts = String::new();
    for part in candidate.content.iter().flat_map(|c| c.parts.iter()) {
        if let Some(t) = &part.text {
            if part.is_thought() {
                thoughts.push_str(t);
            } else {
                text.push_str(t);
            }
        }
    }
    (text, thoughts)
}

#[allow(deprecated)]
pub fn chat_response_to_openai(
    response: &GeminiChatResponse,
    model: &str,
    usage: Usage,
) -> oai::CreateChatCompletionResponse {
    let choices = response
        .candidates
        .iter()
        .enumerate()
        .map(|(i, candidate)| {
            let (text, _) = candidate_texts(candidate);
            let calls = candidate_tool_calls(candidate);
            let tool_calls = if calls.is_empty() {
                None
            } else {
                Some(
                    calls
                        .into_iter()
                        .map(|c| oai::ChatCompletionMessageToolCall {
                            id: c.id,
                            r#type: oai::ChatCompletionToolType::Function,
                            function: oai::FunctionCall {
                                name: c.function.name,
                                arguments: c.function.arguments,
                            },
                        })
                        .collect::<Vec<_>>(),
                )
            };
            let finish = match finish_reason(candidate.finish_reason.as_deref(), tool_calls.is_some()) {
                Some("length") => Some(oai::FinishReason::Length),
                Some("tool_calls") => Some(oai::FinishReason::ToolCalls),
                Some("content_filter") => Some(oai::FinishReason::ContentFilter),
                Some(_) => Some(oai::FinishReason::Stop),
                None => None,
            };
            oai::ChatChoice {
                index: candidate.index.unwrap_or(i as u32),
                message: oai::ChatCompletionResponseMessage {
                    role: oai::Role::Assistant,
                    content: Some(text),
                    refusal: None,
                    tool_calls,
                    function_call: None,
                    audio: None,
                },
                finish_reason: finish,
                logprobs: None,
            }
        })
        .collect();

    oai::CreateChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp() as u32,
        model: model.to_string(),
        choices,
        usage: Some(usage),
        service_tier: None,
        system_fingerprint: None,
    }
}

/// Usage when upstream omitted metadata: estimate from the visible output.
fn fallback_usage(info: &RelayInfo, completion_text: &str) -> Usage {
    new_usage(info.prompt_tokens, estimate_tokens([completion_text]) as u32)
}

pub async fn chat_handler(
    info: &mut RelayInfo,
    response: reqwest::Response,
    sink: &mut dyn ClientSink,
) -> Result<Usage, RelayError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| RelayError::bad_body(format!("read response body failed: {}", e)))?;
    let parsed: GeminiChatResponse = serde_json::from_slice(&bytes)?;
    if parsed.candidates.is_empty() {
        let reason = parsed
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.clone())
            .unwrap_or_else(|| "empty response".to_string());
        return Err(RelayError::bad_body(format!("no candidates returned: {}", reason)));
    }

    let usage = match &parsed.usage_metadata {
        Some(meta) if meta.total_token_count > 0 || meta.prompt_token_count > 0 => {
            usage_from_metadata(meta)
        }
        _ => {
            let text: String = parsed.candidates.iter().map(|c| candidate_texts(c).0).collect();
            fallback_usage(info, &text)
        }
    };

    let body = chat_response_to_openai(&parsed, &info.origin_model_name, usage.clone());
    write_json(sink, StatusCode::OK, &body).await?;
    Ok(usage)
}

fn stream_chunk(
    response: &GeminiChatResponse,
    id: &str,
    created: u64,
    model: &str,
    first: bool,
) -> StreamChatCompletionChunk {
    let mut chunk = StreamChatCompletionChunk::new(id, created, model);
    for (i, candidate) in response.candidates.iter().enumerate() {
        let (text, thoughts) = candidate_texts(candidate);
        let calls = candidate_tool_calls(candidate);
        let has_calls = !calls.is_empty();
        chunk.choices.push(StreamChoiceDelta {
            index: candidate.index.unwrap_or(i as u32),
            delta: StreamMessage {
                role: first.then(|| "assistant".to_string()),
                content: (!text.is_empty()).then_some(text),
                reasoning_content: (!thoughts.is_empty()).then_some(thoughts),
                tool_calls: has_calls.then_some(calls),
            },
            finish_reason: finish_reason(candidate.finish_reason.as_deref(), has_calls)
                .map(|s| s.to_string()),
            logprobs: None,
        });
    }
    chunk
}

pub async fn chat_stream_handler(
    info: &mut RelayInfo,
    response: reqwest::Response,
    sink: &mut dyn ClientSink,
) -> Result<Usage, RelayError> {
    let id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = Utc::now().timestamp() as u64;
    let model = info.origin_model_name.clone();

    let mut usage: Option<Usage> = None;
    let mut completion_text = String::new();
    let mut first = true;
    let mut events = response.bytes_stream().eventsource();

    start_event_stream(sink).await?;

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(ev) => ev,
            Err(e) => {
                tracing::warn!(channel_id = info.channel_id, "gemini stream interrupted: {}", e);
                break;
            }
        };
        let data = event.data.trim();
        if data.is_empty() {
            continue;
        }
        let parsed: GeminiChatResponse = match serde_json::from_str(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(channel_id = info.channel_id, "skip unparsable gemini chunk: {}", e);
                continue;
            }
        };
        if let Some(meta) = &parsed.usage_metadata
            && (meta.total_token_count > 0 || meta.prompt_token_count > 0)
        {
            usage = Some(usage_from_metadata(meta));
        }
        if parsed.candidates.is_empty() {
            continue;
        }
        for c in &parsed.candidates {
            completion_text.push_str(&candidate_texts(c).0);
        }
        let chunk = stream_chunk(&parsed, &id, created, &model, first);
        first = false;
        write_sse_data(sink, serde_json::to_string(&chunk)?).await?;
    }

    let usage = usage.unwrap_or_else(|| fallback_usage(info, &completion_text));

    if info.should_include_usage {
        let mut tail = StreamChatCompletionChunk::new(&id, created, &model);
        tail.usage = Some(usage.clone());
        write_sse_data(sink, serde_json::to_string(&tail)?).await?;
    }
    write_sse_done(sink).await?;
    Ok(usage)
}

pub async fn embedding_handler(
    info: &mut RelayInfo,
    response: reqwest::Response,
    sink: &mut dyn ClientSink,
) -> Result<Usage, RelayError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| RelayError::bad_body(format!("read response body failed: {}", e)))?;
    let parsed: GeminiEmbeddingResponse = serde_json::from_slice(&bytes)?;
    let usage = new_usage(info.prompt_tokens, 0);
    let body = EmbeddingResponse {
        object: "list".to_string(),
        data: vec![EmbeddingData {
            object: "embedding".to_string(),
            embedding: parsed.embedding.values,
            index: 0,
        }],
        model: info.origin_model_name.clone(),
        usage: usage.clone(),
    };
    write_json(sink, StatusCode::OK, &body).await?;
    Ok(usage)
}

/// Decodes Imagen predictions. Entries with a safety filter reason are dropped;
/// an empty or fully filtered result is a bad body.
pub fn image_response(bytes: &[u8]) -> Result<(ImageResponse, Usage), RelayError> {
    let parsed: GeminiImageResponse = serde_json::from_slice(bytes)?;
    if parsed.predictions.is_empty() {
        return Err(RelayError::bad_body("no images generated"));
    }
    let data: Vec<ImageData> = parsed
        .predictions
        .into_iter()
        .filter(|p| p.rai_filtered_reason.as_deref().is_none_or(str::is_empty))
        .map(|p| ImageData {
            b64_json: Some(p.bytes_base64_encoded),
            ..Default::default()
        })
        .collect();
    if data.is_empty() {
        return Err(RelayError::bad_body(
            "all generated images were removed by safety filtering",
        ));
    }
    let usage = new_usage(IMAGE_TOKENS_PER_IMAGE * data.len() as u32, 0);
    Ok((
        ImageResponse {
            created: Utc::now().timestamp(),
            data,
        },
        usage,
    ))
}

pub async fn image_handler(
    _info: &mut RelayInfo,
    response: reqwest::Response,
    sink: &mut dyn ClientSink,
) -> Result<Usage, RelayError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| RelayError::bad_body(format!("read response body failed: {}", e)))?;
    let (body, usage) = image_response(&bytes)?;
    write_json(sink, StatusCode::OK, &body).await?;
    Ok(usage)
}

pub async fn native_handler(
    info: &mut RelayInfo,
    response: reqwest::Response,
    sink: &mut dyn ClientSink,
) -> Result<Usage, RelayError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| RelayError::bad_body(format!("read response body failed: {}", e)))?;
    let parsed: GeminiChatResponse = serde_json::from_slice(&bytes)?;
    let usage = match &parsed.usage_metadata {
        Some(meta) => usage_from_metadata(meta),
        None => new_usage(info.prompt_tokens, 0),
    };
    write_raw_json(sink, StatusCode::OK, bytes).await?;
    Ok(usage)
}

pub async fn native_stream_handler(
    info: &mut RelayInfo,
    response: reqwest::Response,
    sink: &mut dyn ClientSink,
) -> Result<Usage, RelayError> {
    let mut usage: Option<Usage> = None;
    let mut events = response.bytes_stream().eventsource();

    start_event_stream(sink).await?;
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(ev) => ev,
            Err(e) => {
                tracing::warn!(channel_id = info.channel_id, "gemini stream interrupted: {}", e);
                break;
            }
        };
        if event.data.trim().is_empty() {
            continue;
        }
        if let Ok(parsed) = serde_json::from_str::<GeminiChatResponse>(&event.data)
            && let Some(meta) = &parsed.usage_metadata
        {
            usage = Some(usage_from_metadata(meta));
        }
        write_sse_data(sink, event.data).await?;
    }
    Ok(usage.unwrap_or_else(|| new_usage(info.prompt_tokens, 0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelStatus, ChannelType};
    use crate::error::ErrorKind;
    use crate::relay::{BufferSink, RelayMode};
    use std::time::Duration;

    fn info(mode: RelayMode) -> RelayInfo {
        let channel = Channel {
            id: 1,
            name: "g".into(),
            channel_type: ChannelType::Gemini,
            base_url: None,
            key: "k".into(),
            models: "gemini-2.5-flash".into(),
            test_model: None,
            model_mapping: None,
            group: "default".into(),
            status: ChannelStatus::Enabled,
            response_time_ms: 0,
            auto_ban: true,
            test_time: None,
        };
        RelayInfo::new(&channel, "k".into(), "gemini-2.5-flash", mode, Duration::from_secs(5))
            .unwrap()
    }

    fn response(body: &str, content_type: &str) -> reqwest::Response {
        let resp = axum::http::Response::builder()
            .status(200)
            .header("content-type", content_type)
            .body(body.to_string())
            .unwrap();
        reqwest::Response::from(resp)
    }

    #[test]
    fn partially_filtered_images_keep_the_rest() {
        let body = br#"{"predictions":[
            {"mimeType":"image/png","bytesBase64Encoded":"AAA"},
            {"raiFilteredReason":"unsafe"},
            {"mimeType":"image/png","bytesBase64Encoded":"BBB"}
        ]}"#;
        let (resp, usage) = image_response(body).unwrap();
        assert_eq!(resp.data.len(), 2);
        assert_eq!(resp.data[1].b64_json.as_deref(), Some("BBB"));
        assert_eq!(usage.prompt_tokens, 2 * IMAGE_TOKENS_PER_IMAGE);
        assert_eq!(usage.completion_tokens, 0);
    }

    #[test]
    fn empty_or_fully_filtered_images_are_bad_body() {
        let err = image_response(br#"{"predictions":[]}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadResponseBody);
        let err = image_response(br#"{"predictions":[{"raiFilteredReason":"x"}]}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadResponseBody);
        let err = image_response(b"not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadResponseBody);
    }

    #[tokio::test]
    async fn chat_handler_converts_candidates_and_usage() {
        let body = r#"{
            "candidates":[{"content":{"role":"model","parts":[
                {"text":"thinking...","thought":true},
                {"text":"Hello"}
            ]},"finishReason":"STOP","index":0}],
            "usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2,"thoughtsTokenCount":3,"totalTokenCount":9}
        }"#;
        let mut info = info(RelayMode::ChatCompletions);
        let mut sink = BufferSink::default();
        let usage = chat_handler(&mut info, response(body, "application/json"), &mut sink)
            .await
            .unwrap();
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 9);

        let out: serde_json::Value = serde_json::from_slice(&sink.body).unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "Hello");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["model"], "gemini-2.5-flash");
    }

    #[tokio::test]
    async fn chat_handler_maps_function_calls() {
        let body = r#"{"candidates":[{"content":{"parts":[
            {"functionCall":{"name":"add","args":{"a":2,"b":3}}}
        ]},"finishReason":"STOP"}]}"#;
        let mut info = info(RelayMode::ChatCompletions);
        info.prompt_tokens = 7;
        let mut sink = BufferSink::default();
        let usage = chat_handler(&mut info, response(body, "application/json"), &mut sink)
            .await
            .unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        let out: serde_json::Value = serde_json::from_slice(&sink.body).unwrap();
        let call = &out["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(call["function"]["name"], "add");
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
    }

    #[tokio::test]
    async fn chat_handler_rejects_empty_candidates() {
        let body = r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#;
        let mut info = info(RelayMode::ChatCompletions);
        let mut sink = BufferSink::default();
        let err = chat_handler(&mut info, response(body, "application/json"), &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadResponseBody);
        assert!(err.message.contains("SAFETY"));
        assert!(sink.status.is_none());
    }

    #[tokio::test]
    async fn stream_handler_forwards_chunks_and_usage() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2,\"totalTokenCount\":5}}\n\n",
        );
        let mut info = info(RelayMode::ChatCompletions);
        info.is_stream = true;
        info.should_include_usage = true;
        let mut sink = BufferSink::default();
        let usage = chat_stream_handler(&mut info, response(body, "text/event-stream"), &mut sink)
            .await
            .unwrap();
        assert_eq!(usage.total_tokens, 5);

        let text = sink.body_text();
        let events: Vec<&str> = text
            .split("\n\n")
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_start_matches("data: "))
            .collect();
        assert_eq!(events.len(), 4);
        let first: serde_json::Value = serde_json::from_str(events[0]).unwrap();
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
        let second: serde_json::Value = serde_json::from_str(events[1]).unwrap();
        assert_eq!(second["choices"][0]["finish_reason"], "stop");
        let tail: serde_json::Value = serde_json::from_str(events[2]).unwrap();
        assert_eq!(tail["usage"]["total_tokens"], 5);
        assert_eq!(events[3], "[DONE]");
        assert_eq!(sink.content_type.as_deref(), Some("text/event-stream"));
    }

    #[tokio::test]
    async fn embedding_handler_reports_prompt_tokens() {
        let mut info = info(RelayMode::Embeddings);
        info.prompt_tokens = 2;
        let mut sink = BufferSink::default();
        let usage = embedding_handler(
            &mut info,
            response(r#"{"embedding":{"values":[0.1,0.2]}}"#, "application/json"),
            &mut sink,
        )
        .await
        .unwrap();
        assert_eq!(usage.prompt_tokens, 2);
        let out: serde_json::Value = serde_json::from_slice(&sink.body).unwrap();
        assert_eq!(out["data"][0]["embedding"][1], 0.2);
    }
}
