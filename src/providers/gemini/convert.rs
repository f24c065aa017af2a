use std::collections::HashMap;

use serde_json::{Value, json};

use super::types::*;
use super::{ThinkingSuffix, parse_thinking_suffix};
use crate::config::GeminiConfig;
use crate::error::RelayError;
use crate::providers::openai::types::{
    ContentPart, EmbeddingRequest, GeneralOpenAIRequest, ImageRequest, Message,
};

const HARM_CATEGORIES: [&str; 5] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

pub fn chat_request(
    request: &GeneralOpenAIRequest,
    upstream_model: &str,
    config: &GeminiConfig,
) -> Result<GeminiChatRequest, RelayError> {
    if request.messages.is_empty() {
        return Err(RelayError::invalid_input("messages is required"));
    }

    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<GeminiChatContent> = Vec::new();
    // tool_call_id -> function name，用于还原 functionResponse
    let mut call_names: HashMap<String, String> = HashMap::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                let text = message.text_content();
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            "tool" | "function" => {
                let name = message
                    .tool_call_id
                    .as_ref()
                    .and_then(|id| call_names.get(id).cloned())
                    .or_else(|| message.name.clone())
                    .unwrap_or_default();
                let text = message.text_content();
                let response = serde_json::from_str::<Value>(&text)
                    .ok()
                    .filter(|v| v.is_object())
                    .unwrap_or_else(|| json!({ "content": text }));
                contents.push(GeminiChatContent {
                    role: Some("user".to_string()),
                    parts: vec![GeminiPart {
                        function_response: Some(GeminiFunctionResponse { name, response }),
                        ..Default::default()
                    }],
                });
            }
            role => {
                let gemini_role = if role == "assistant" { "model" } else { "user" };
                let mut parts = message_parts(message);
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        call_names.insert(call.id.clone(), call.function.name.clone());
                        let args = serde_json::from_str::<Value>(&call.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        parts.push(GeminiPart {
                            function_call: Some(GeminiFunctionCall {
                                name: call.function.name.clone(),
                                args,
                            }),
                            ..Default::default()
                        });
                    }
                }
                if parts.is_empty() {
                    continue;
                }
                contents.push(GeminiChatContent {
                    role: Some(gemini_role.to_string()),
                    parts,
                });
            }
        }
    }

    if contents.is_empty() {
        return Err(RelayError::invalid_input(
            "at least one non-system message is required",
        ));
    }

    let system_instruction = if system_texts.is_empty() {
        None
    } else {
        Some(GeminiChatContent {
            role: None,
            parts: vec![GeminiPart::text(system_texts.join("\n"))],
        })
    };

    let mut generation = GeminiGenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        max_output_tokens: request.effective_max_tokens().filter(|t| *t > 0),
        candidate_count: request.n.filter(|n| *n > 1),
        stop_sequences: stop_sequences(request.stop.as_ref()),
        ..Default::default()
    };

    if let Some(format) = &request.response_format {
        match format.kind.as_str() {
            "json_object" => generation.response_mime_type = Some("application/json".into()),
            "json_schema" => {
                generation.response_mime_type = Some("application/json".into());
                generation.response_schema = format
                    .json_schema
                    .as_ref()
                    .and_then(|s| s.get("schema").cloned());
            }
            _ => {}
        }
    }

    if config.thinking_adapter_enabled {
        generation.thinking_config = thinking_config(upstream_model);
    }

    let tools = request.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        vec![GeminiTool {
            function_declarations: tools
                .iter()
                .map(|t| GeminiFunctionDeclaration {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    parameters: t.function.parameters.as_ref().map(clean_schema),
                })
                .collect(),
        }]
    });
    let tool_config = if tools.is_some() {
        request.tool_choice.as_ref().and_then(tool_config)
    } else {
        None
    };

    let safety_settings = config
        .safety_threshold
        .as_ref()
        .map(|threshold| {
            HARM_CATEGORIES
                .iter()
                .map(|c| GeminiSafetySetting {
                    category: c.to_string(),
                    threshold: threshold.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(GeminiChatRequest {
        contents,
        system_instruction,
        safety_settings,
        generation_config: Some(generation),
        tools,
        tool_config,
        cached_content: None,
    })
}

fn message_parts(message: &Message) -> Vec<GeminiPart> {
    message
        .parts()
        .iter()
        .filter_map(content_part)
        .collect()
}

fn content_part(part: &ContentPart) -> Option<GeminiPart> {
    match part.kind.as_str() {
        "text" => part
            .text
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|t| GeminiPart::text(t.clone())),
        "image_url" => {
            let url = &part.image_url.as_ref()?.url;
            if let Some((mime_type, data)) = split_data_url(url) {
                Some(GeminiPart {
                    inline_data: Some(GeminiInlineData {
                        mime_type: mime_type.to_string(),
                        data: data.to_string(),
                    }),
                    ..Default::default()
                })
            } else {
                Some(GeminiPart {
                    file_data: Some(GeminiFileData {
                        mime_type: mime_from_url(url).to_string(),
                        file_uri: url.clone(),
                    }),
                    ..Default::default()
                })
            }
        }
        _ => None,
    }
}

/// `data:image/png;base64,AAAA` -> (`image/png`, `AAAA`)
fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    Some((mime, data))
}

fn mime_from_url(url: &str) -> &'static str {
    let path = url.split('?').next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else if path.ends_with(".pdf") {
        "application/pdf"
    } else {
        "image/jpeg"
    }
}

fn stop_sequences(stop: Option<&Value>) -> Option<Vec<String>> {
    match stop? {
        Value::String(s) if !s.is_empty() => Some(vec![s.clone()]),
        Value::Array(items) => {
            let v: Vec<String> = items
                .iter()
                .filter_map(|i| i.as_str().map(|s| s.to_string()))
                .collect();
            if v.is_empty() { None } else { Some(v) }
        }
        _ => None,
    }
}

/// Gemini rejects a handful of JSON-schema keywords that OpenAI clients commonly send.
fn clean_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !matches!(k.as_str(), "additionalProperties" | "$schema" | "strict"))
                .map(|(k, v)| (k.clone(), clean_schema(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(clean_schema).collect()),
        other => other.clone(),
    }
}

fn tool_config(choice: &Value) -> Option<GeminiToolConfig> {
    let (mode, allowed) = match choice {
        Value::String(s) => match s.as_str() {
            "required" => ("ANY", None),
            "none" => ("NONE", None),
            "auto" => ("AUTO", None),
            _ => return None,
        },
        Value::Object(_) => {
            let name = choice
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())?;
            ("ANY", Some(vec![name.to_string()]))
        }
        _ => return None,
    };
    Some(GeminiToolConfig {
        function_calling_config: GeminiFunctionCallingConfig {
            mode: mode.to_string(),
            allowed_function_names: allowed,
        },
    })
}

fn thinking_config(upstream_model: &str) -> Option<GeminiThinkingConfig> {
    let (base, suffix) = parse_thinking_suffix(upstream_model);
    match suffix {
        ThinkingSuffix::None => None,
        ThinkingSuffix::NoThinking => Some(GeminiThinkingConfig {
            thinking_budget: Some(0),
            include_thoughts: None,
        }),
        ThinkingSuffix::Thinking { budget } => Some(GeminiThinkingConfig {
            thinking_budget: budget.map(|b| clamp_thinking_budget(base, b)),
            include_thoughts: Some(true),
        }),
    }
}

fn clamp_thinking_budget(model: &str, budget: u32) -> u32 {
    if model.contains("2.5-pro") {
        budget.clamp(128, 32_768)
    } else if model.contains("flash-lite") {
        budget.clamp(512, 24_576)
    } else {
        budget.min(24_576)
    }
}

pub fn embedding_request(
    request: &EmbeddingRequest,
    model: &str,
) -> Result<GeminiEmbeddingRequest, RelayError> {
    if request.input.is_none() {
        return Err(RelayError::invalid_input("input is required"));
    }
    let inputs = request.parse_input();
    let Some(first) = inputs.into_iter().next().filter(|s| !s.is_empty()) else {
        return Err(RelayError::invalid_input("input is empty"));
    };
    // embedding-001 不支持 outputDimensionality
    let output_dimensionality = if model == "embedding-001" {
        None
    } else {
        request.dimensions.filter(|d| *d > 0)
    };
    Ok(GeminiEmbeddingRequest {
        model: format!("models/{}", model),
        content: GeminiChatContent {
            role: None,
            parts: vec![GeminiPart::text(first)],
        },
        task_type: None,
        output_dimensionality,
    })
}

pub fn image_request(request: &ImageRequest, model: &str) -> Result<GeminiImageRequest, RelayError> {
    if !model.starts_with("imagen") {
        return Err(RelayError::invalid_input(format!(
            "model {} does not support image generation",
            model
        )));
    }
    if request.prompt.trim().is_empty() {
        return Err(RelayError::invalid_input("prompt is required"));
    }
    let aspect_ratio = match request.size.as_deref().unwrap_or("1024x1024") {
        "1024x1792" => "9:16",
        "1792x1024" => "16:9",
        _ => "1:1",
    };
    Ok(GeminiImageRequest {
        instances: vec![GeminiImageInstance {
            prompt: request.prompt.clone(),
        }],
        parameters: GeminiImageParameters {
            sample_count: request.n.filter(|n| *n > 0).unwrap_or(1),
            aspect_ratio: aspect_ratio.to_string(),
            person_generation: "allow_adult".to_string(),
        },
    })
}
