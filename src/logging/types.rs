use chrono::{DateTime, Utc};
use serde::Serialize;

/// One settled relay or channel test, with the quota it consumed.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeLog {
    pub id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub channel_id: i64,
    pub model_name: String,
    pub token_name: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub quota: i64,
    pub use_time_ms: i64,
    pub is_stream: bool,
    pub group: String,
    pub content: String,
    /// JSON with pricing details (ratios, cache tokens, upstream model).
    pub other: String,
}
