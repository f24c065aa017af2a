use axum::body::Bytes;
use axum::http::StatusCode;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;

use super::types::{Usage, new_usage};
use crate::error::RelayError;
use crate::providers::streaming::parse_usage_from_value;
use crate::relay::writer::{start_event_stream, write_raw_json, write_sse_data, write_sse_done};
use crate::relay::{ClientSink, RelayInfo, estimate_tokens};

async fn read_body(response: reqwest::Response) -> Result<Bytes, RelayError> {
    response
        .bytes()
        .await
        .map_err(|e| RelayError::bad_body(format!("read response body failed: {}", e)))
}

/// Forwards a JSON body unchanged and reads usage from it.
pub async fn json_handler(
    info: &mut RelayInfo,
    response: reqwest::Response,
    sink: &mut dyn ClientSink,
) -> Result<Usage, RelayError> {
    let bytes = read_body(response).await?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
    if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("upstream returned an error object")
            .to_string();
        return Err(RelayError::bad_body(message));
    }
    let usage = parse_usage_from_value(&value).unwrap_or_else(|| {
        let completion = value
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|c| estimate_tokens([c]) as u32)
            .unwrap_or(0);
        new_usage(info.prompt_tokens, completion)
    });
    write_raw_json(sink, StatusCode::OK, bytes).await?;
    Ok(usage)
}

pub async fn binary_handler(
    info: &mut RelayInfo,
    response: reqwest::Response,
    sink: &mut dyn ClientSink,
) -> Result<Usage, RelayError> {
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let bytes = read_body(response).await?;
    sink.write_head(StatusCode::OK, &content_type).await?;
    sink.write_chunk(bytes).await?;
    Ok(new_usage(info.prompt_tokens, 0))
}

/// Re-emits upstream SSE events. The usage-only tail chunk is dropped when the
/// client did not ask for it.
pub async fn stream_handler(
    info: &mut RelayInfo,
    response: reqwest::Response,
    sink: &mut dyn ClientSink,
) -> Result<Usage, RelayError> {
    let mut usage: Option<Usage> = None;
    let mut completion_text = String::new();
    let mut events = response.bytes_stream().eventsource();

    start_event_stream(sink).await?;
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(ev) => ev,
            Err(e) => {
                tracing::warn!(channel_id = info.channel_id, "upstream stream interrupted: {}", e);
                break;
            }
        };
        let data = event.data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            break;
        }

        let mut forward = true;
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
            if let Some(u) = parse_usage_from_value(&value) {
                usage = Some(u);
                let no_choices = value
                    .get("choices")
                    .and_then(|c| c.as_array())
                    .is_none_or(|c| c.is_empty());
                if no_choices && !info.should_include_usage {
                    forward = false;
                }
            }
            if let Some(text) = value
                .pointer("/choices/0/delta/content")
                .and_then(|c| c.as_str())
            {
                completion_text.push_str(text);
            }
        }
        if forward {
            write_sse_data(sink, data.to_string()).await?;
        }
    }
    write_sse_done(sink).await?;

    Ok(usage.unwrap_or_else(|| {
        new_usage(
            info.prompt_tokens,
            estimate_tokens([completion_text.as_str()]) as u32,
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelStatus, ChannelType};
    use crate::relay::{BufferSink, RelayMode};
    use std::time::Duration;

    fn info() -> RelayInfo {
        let channel = Channel {
            id: 1,
            name: "oa".into(),
            channel_type: ChannelType::OpenAI,
            base_url: None,
            key: "k".into(),
            models: "gpt-4o".into(),
            test_model: None,
            model_mapping: None,
            group: "default".into(),
            status: ChannelStatus::Enabled,
            response_time_ms: 0,
            auto_ban: true,
            test_time: None,
        };
        RelayInfo::new(&channel, "k".into(), "gpt-4o", RelayMode::ChatCompletions, Duration::from_secs(5))
            .unwrap()
    }

    fn sse(body: &str) -> reqwest::Response {
        reqwest::Response::from(
            axum::http::Response::builder()
                .status(200)
                .header("content-type", "text/event-stream")
                .body(body.to_string())
                .unwrap(),
        )
    }

    const STREAM: &str = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1,\"total_tokens\":4}}\n\n",
        "data: [DONE]\n\n",
    );

    #[tokio::test]
    async fn usage_tail_hidden_unless_requested() {
        let mut info = info();
        let mut sink = BufferSink::default();
        let usage = stream_handler(&mut info, sse(STREAM), &mut sink).await.unwrap();
        assert_eq!(usage.total_tokens, 4);
        assert!(!sink.body_text().contains("usage"));
        assert!(sink.body_text().ends_with("data: [DONE]\n\n"));

        let mut info = self::info();
        info.should_include_usage = true;
        let mut sink = BufferSink::default();
        stream_handler(&mut info, sse(STREAM), &mut sink).await.unwrap();
        assert!(sink.body_text().contains("\"total_tokens\":4"));
    }

    #[tokio::test]
    async fn stream_without_usage_is_estimated() {
        let mut info = info();
        info.prompt_tokens = 2;
        let body = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"one two three\"}}]}\n\n";
        let mut sink = BufferSink::default();
        let usage = stream_handler(&mut info, sse(body), &mut sink).await.unwrap();
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[tokio::test]
    async fn json_error_object_is_bad_body() {
        let mut info = info();
        let resp = reqwest::Response::from(
            axum::http::Response::builder()
                .status(200)
                .body(r#"{"error":{"message":"overloaded"}}"#.to_string())
                .unwrap(),
        );
        let mut sink = BufferSink::default();
        let err = json_handler(&mut info, resp, &mut sink).await.unwrap_err();
        assert_eq!(err.message, "overloaded");
    }
}
