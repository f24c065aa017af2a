use serde::{Deserialize, Serialize};

use super::openai::types::{ToolCall, Usage};

/// 流式传输的 Delta 消息结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// 流式传输的 Choice Delta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoiceDelta {
    pub index: u32,
    pub delta: StreamMessage,
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<serde_json::Value>,
}

/// 流式传输的响应块
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<StreamChoiceDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChatCompletionChunk {
    pub fn new(id: &str, created: u64, model: &str) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: Vec::new(),
            usage: None,
        }
    }
}

/// Server-Sent Event 数据结构
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn new(data: String) -> Self {
        Self { event: None, data }
    }

    pub fn done() -> Self {
        Self::new("[DONE]".to_string())
    }

    /// 格式化为 Server-Sent Event 格式
    pub fn format_sse(&self) -> String {
        let mut sse_data = String::new();

        if let Some(event) = &self.event {
            sse_data.push_str(&format!("event: {}\n", event));
        }

        // 处理多行数据
        for line in self.data.lines() {
            sse_data.push_str(&format!("data: {}\n", line));
        }

        sse_data.push('\n');
        sse_data
    }
}

/// Reads an OpenAI-style `usage` object leniently; `None` when no counter is present.
pub fn parse_usage_from_value(v: &serde_json::Value) -> Option<Usage> {
    use async_openai::types::{CompletionTokensDetails, PromptTokensDetails};
    let u = v.get("usage")?;
    let field = |name: &str| u.get(name).and_then(|x| x.as_u64()).map(|x| x as u32);
    let prompt = field("prompt_tokens");
    let completion = field("completion_tokens");
    let total = field("total_tokens");
    let cached = u
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|x| x.as_u64())
        .map(|x| x as u32);
    let reasoning = u
        .get("completion_tokens_details")
        .and_then(|d| d.get("reasoning_tokens"))
        .and_then(|x| x.as_u64())
        .map(|x| x as u32);
    if prompt.is_none()
        && completion.is_none()
        && total.is_none()
        && cached.is_none()
        && reasoning.is_none()
    {
        return None;
    }
    Some(Usage {
        prompt_tokens: prompt.unwrap_or(0),
        completion_tokens: completion.unwrap_or(0),
        total_tokens: total.unwrap_or(prompt.unwrap_or(0) + completion.unwrap_or(0)),
        prompt_tokens_details: cached.map(|c| PromptTokensDetails {
            cached_tokens: Some(c),
            audio_tokens: None,
        }),
        completion_tokens_details: reasoning.map(|r| CompletionTokensDetails {
            reasoning_tokens: Some(r),
            audio_tokens: None,
            accepted_prediction_tokens: None,
            rejected_prediction_tokens: None,
        }),
    })
}
