pub mod pipeline;
pub mod quota;
pub mod writer;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::channel::{ApiType, Channel, ChannelType};
use crate::error::{ErrorKind, RelayError};
use crate::providers::openai::types::{GeneralOpenAIRequest, Message};

pub use pipeline::relay_once;
pub use writer::{BufferSink, ClientSink, StreamingSink};

const MAX_MAPPING_HOPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    ChatCompletions,
    Embeddings,
    ImagesGenerations,
    Rerank,
    AudioSpeech,
    /// Native Gemini body passed through unchanged.
    GeminiNative,
}

/// Per-request state shared by every adaptor step.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub api_type: ApiType,
    pub origin_model_name: String,
    pub upstream_model_name: String,
    pub is_stream: bool,
    pub relay_mode: RelayMode,
    pub base_url: String,
    pub api_key: String,
    pub group: String,
    pub prompt_tokens: u32,
    pub should_include_usage: bool,
    /// Tokens written into a freshly created upstream prompt cache.
    pub cache_write_tokens: u32,
    pub start_time: Instant,
    pub timeout: Duration,
}

impl RelayInfo {
    pub fn new(
        channel: &Channel,
        api_key: String,
        model: &str,
        relay_mode: RelayMode,
        timeout: Duration,
    ) -> Result<Self, RelayError> {
        let api_type = channel.channel_type.api_type().ok_or_else(|| {
            RelayError::new(
                ErrorKind::InvalidApiType,
                format!(
                    "no adaptor for channel type {}",
                    channel.channel_type.as_db_value()
                ),
            )
        })?;
        Ok(Self {
            channel_id: channel.id,
            channel_type: channel.channel_type,
            api_type,
            origin_model_name: model.to_string(),
            upstream_model_name: model.to_string(),
            is_stream: false,
            relay_mode,
            base_url: channel.base_url(),
            api_key,
            group: channel.group.clone(),
            prompt_tokens: 0,
            should_include_usage: false,
            cache_write_tokens: 0,
            start_time: Instant::now(),
            timeout,
        })
    }

    /// Rewrites the upstream model name through the channel's alias map.
    pub fn apply_model_mapping(&mut self, channel: &Channel) -> Result<(), RelayError> {
        let map = channel.model_mapping().map_err(|e| {
            RelayError::new(
                ErrorKind::ModelMappingFailed,
                format!("unmarshal model mapping failed: {}", e),
            )
        })?;
        self.upstream_model_name = resolve_redirect_chain(&map, &self.origin_model_name)?;
        Ok(())
    }

    pub fn with_chat_request(mut self, request: &GeneralOpenAIRequest) -> Self {
        self.is_stream = request.stream;
        self.should_include_usage = request.include_usage();
        self.prompt_tokens = count_message_tokens(&request.messages);
        self
    }
}

/// Follows alias hops until a name with no further mapping is reached.
pub fn resolve_redirect_chain(
    map: &HashMap<String, String>,
    source_model: &str,
) -> Result<String, RelayError> {
    let mut current = source_model.to_string();
    let mut seen = HashSet::new();
    seen.insert(current.clone());
    for _ in 0..MAX_MAPPING_HOPS {
        match map.get(&current) {
            Some(next) if !next.trim().is_empty() && *next != current => {
                if !seen.insert(next.clone()) {
                    return Err(RelayError::new(
                        ErrorKind::ModelMappingFailed,
                        format!("model mapping contains a cycle at {}", next),
                    ));
                }
                current = next.clone();
            }
            _ => return Ok(current),
        }
    }
    Err(RelayError::new(
        ErrorKind::ModelMappingFailed,
        format!("model mapping for {} exceeds {} hops", source_model, MAX_MAPPING_HOPS),
    ))
}

/// Approximate token count: whitespace-delimited words. Not a tokenizer.
pub fn estimate_tokens<'a>(texts: impl IntoIterator<Item = &'a str>) -> usize {
    texts.into_iter().map(|t| t.split_whitespace().count()).sum()
}

pub fn count_message_tokens(messages: &[Message]) -> u32 {
    let texts: Vec<String> = messages.iter().map(|m| m.text_content()).collect();
    estimate_tokens(texts.iter().map(|s| s.as_str())) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn redirect_chain_follows_hops() {
        let m = map(&[("a", "b"), ("b", "c")]);
        assert_eq!(resolve_redirect_chain(&m, "a").unwrap(), "c");
        assert_eq!(resolve_redirect_chain(&m, "z").unwrap(), "z");
    }

    #[test]
    fn redirect_chain_rejects_cycles() {
        let m = map(&[("a", "b"), ("b", "a")]);
        let err = resolve_redirect_chain(&m, "a").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModelMappingFailed);
    }

    #[test]
    fn estimate_counts_words() {
        assert_eq!(estimate_tokens(["hello  world", "\tthree\nwords here"]), 5);
        assert_eq!(estimate_tokens([""]), 0);
    }
}
