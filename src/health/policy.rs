use std::sync::Arc;

use crate::channel::{Channel, ChannelStatus, ChannelStore, ChannelType};
use crate::config::HealthConfig;
use crate::error::{ErrorKind, RelayError};
use crate::health::notify::Notifier;
use crate::health::tester::TestResult;

const BAN_CODES: &[&str] = &["invalid_api_key", "account_deactivated", "billing_not_active"];
const BAN_TYPES: &[&str] = &[
    "insufficient_quota",
    "authentication_error",
    "permission_error",
    "forbidden",
];

/// Outcome of judging one batch test.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub ban: bool,
    pub error: Option<RelayError>,
}

/// Decides when a tested channel should be disabled or re-enabled.
#[derive(Debug, Clone)]
pub struct ChannelPolicy {
    config: HealthConfig,
}

impl ChannelPolicy {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    pub fn should_disable(&self, channel_type: ChannelType, err: &RelayError) -> bool {
        if !self.config.automatic_disable_channel_enabled {
            return false;
        }
        if err.kind == ErrorKind::ChannelResponseTimeExceeded {
            return true;
        }
        if let Some(status) = err.status {
            if self.config.disable_status_codes.contains(&status) {
                return true;
            }
            // Gemini 对失效 key 返回 403
            if status == 403 && channel_type == ChannelType::Gemini {
                return true;
            }
        }
        if let Some(code) = err.upstream_code.as_deref()
            && BAN_CODES.contains(&code)
        {
            return true;
        }
        if let Some(kind) = err.upstream_type.as_deref()
            && BAN_TYPES.contains(&kind.to_ascii_lowercase().as_str())
        {
            return true;
        }
        let message = err.message.to_lowercase();
        self.config
            .disable_keywords
            .iter()
            .any(|k| !k.is_empty() && message.contains(&k.to_lowercase()))
    }

    pub fn should_enable(&self, err: Option<&RelayError>, status: ChannelStatus) -> bool {
        self.config.automatic_enable_channel_enabled
            && err.is_none()
            && status == ChannelStatus::AutoDisabled
    }

    /// Classifies a batch result. A slow test that is not already ban-worthy
    /// becomes a ban-worthy timeout failure.
    pub fn judge(&self, channel: &Channel, result: &TestResult) -> Verdict {
        let mut error = result.error.clone();
        let mut ban = error
            .as_ref()
            .is_some_and(|e| self.should_disable(channel.channel_type, e));
        if !ban
            && self.config.automatic_disable_channel_enabled
            && let Some(threshold) = self.config.disable_threshold()
            && result.elapsed > threshold
        {
            error = Some(RelayError::with_status(
                ErrorKind::ChannelResponseTimeExceeded,
                408,
                format!(
                    "response time {:.2}s exceeds threshold {:.2}s",
                    result.elapsed.as_secs_f64(),
                    threshold.as_secs_f64()
                ),
            ));
            ban = true;
        }
        Verdict { ban, error }
    }
}

/// Marks the channel auto-disabled and notifies. Store failures are logged only.
pub async fn disable_channel(
    store: Arc<dyn ChannelStore>,
    notifier: Arc<dyn Notifier>,
    channel_id: i64,
    channel_name: String,
    reason: String,
) {
    match store
        .update_channel_status(channel_id, ChannelStatus::AutoDisabled, Some(&reason))
        .await
    {
        Ok(true) => {
            tracing::warn!(channel_id, channel = %channel_name, reason = %reason, "channel auto-disabled");
            notifier
                .notify(
                    &format!("Channel {} (#{}) disabled", channel_name, channel_id),
                    &format!("Channel {} (#{}) was disabled: {}", channel_name, channel_id, reason),
                )
                .await;
        }
        Ok(false) => {
            tracing::debug!(channel_id, "channel status unchanged on disable");
        }
        Err(e) => {
            tracing::error!(channel_id, "Failed to disable channel: {}", e);
        }
    }
}

pub async fn enable_channel(
    store: Arc<dyn ChannelStore>,
    notifier: Arc<dyn Notifier>,
    channel_id: i64,
    channel_name: String,
) {
    match store
        .update_channel_status(channel_id, ChannelStatus::Enabled, None)
        .await
    {
        Ok(true) => {
            tracing::info!(channel_id, channel = %channel_name, "channel re-enabled");
            notifier
                .notify(
                    &format!("Channel {} (#{}) enabled", channel_name, channel_id),
                    &format!("Channel {} (#{}) passed its test and was re-enabled", channel_name, channel_id),
                )
                .await;
        }
        Ok(false) => {
            tracing::debug!(channel_id, "channel status unchanged on enable");
        }
        Err(e) => {
            tracing::error!(channel_id, "Failed to enable channel: {}", e);
        }
    }
}
