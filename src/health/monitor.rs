use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelStore};
use crate::error::GatewayError;
use crate::health::notify::Notifier;
use crate::health::policy::{ChannelPolicy, disable_channel, enable_channel};
use crate::health::tester::{ChannelProbe, TestKind, TestResult};

/// Releases the batch flag however the batch ends.
struct BatchGuard {
    running: Arc<Mutex<bool>>,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        *running = false;
    }
}

pub struct HealthMonitor {
    channels: Arc<dyn ChannelStore>,
    probe: Arc<dyn ChannelProbe>,
    policy: ChannelPolicy,
    notifier: Arc<dyn Notifier>,
    running: Arc<Mutex<bool>>,
    request_interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        channels: Arc<dyn ChannelStore>,
        probe: Arc<dyn ChannelProbe>,
        policy: ChannelPolicy,
        notifier: Arc<dyn Notifier>,
        request_interval: Duration,
    ) -> Self {
        Self {
            channels,
            probe,
            policy,
            notifier,
            running: Arc::new(Mutex::new(false)),
            request_interval,
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_begin_batch(&self) -> Result<BatchGuard, GatewayError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if *running {
            return Err(GatewayError::BatchRunning);
        }
        *running = true;
        Ok(BatchGuard {
            running: Arc::clone(&self.running),
        })
    }

    /// Tests one channel on demand. A manual test never changes the channel's status.
    pub async fn test_channel(
        &self,
        id: i64,
        model: Option<&str>,
        kind: TestKind,
    ) -> Result<TestResult, GatewayError> {
        let channel = self
            .channels
            .get_channel(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("channel {} not found", id)))?;

        let result = self.probe.test(&channel, model, kind).await;
        if result.is_success() {
            let store = Arc::clone(&self.channels);
            let elapsed_ms = result.elapsed.as_millis() as i64;
            tokio::spawn(async move {
                if let Err(e) = store.update_response_time(id, elapsed_ms).await {
                    tracing::warn!(channel_id = id, "Failed to update response time: {}", e);
                }
            });
        }
        Ok(result)
    }

    /// Starts a background pass over every channel. Fails at once if a pass is running.
    pub async fn test_all_channels(
        self: &Arc<Self>,
        notify: bool,
    ) -> Result<JoinHandle<()>, GatewayError> {
        let guard = self.try_begin_batch()?;
        let channels = self.channels.list_channels().await?;
        tracing::info!(count = channels.len(), "starting channel batch test");

        let monitor = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let outcome = AssertUnwindSafe(monitor.run_batch(channels))
                .catch_unwind()
                .await;
            drop(guard);
            match outcome {
                Ok(()) => {
                    tracing::info!("channel batch test finished");
                    if notify {
                        monitor
                            .notifier
                            .notify("Channel test finished", "All channels have been tested")
                            .await;
                    }
                }
                Err(_) => tracing::error!("channel batch test panicked"),
            }
        }))
    }

    async fn run_batch(&self, channels: Vec<Channel>) {
        for channel in channels {
            let result = self.probe.test(&channel, None, TestKind::Text).await;
            let verdict = self.policy.judge(&channel, &result);

            if channel.is_enabled() && verdict.ban && channel.auto_ban {
                let reason = verdict
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                tokio::spawn(disable_channel(
                    Arc::clone(&self.channels),
                    Arc::clone(&self.notifier),
                    channel.id,
                    channel.name.clone(),
                    reason,
                ));
            }
            if !channel.is_enabled()
                && self
                    .policy
                    .should_enable(verdict.error.as_ref(), channel.status)
            {
                tokio::spawn(enable_channel(
                    Arc::clone(&self.channels),
                    Arc::clone(&self.notifier),
                    channel.id,
                    channel.name.clone(),
                ));
            }

            let elapsed_ms = result.elapsed.as_millis() as i64;
            if let Err(e) = self.channels.update_response_time(channel.id, elapsed_ms).await {
                tracing::warn!(channel_id = channel.id, "Failed to update response time: {}", e);
            }

            if !self.request_interval.is_zero() {
                tokio::time::sleep(self.request_interval).await;
            }
        }
    }

    /// Runs a silent batch every `frequency_minutes`. Zero leaves automatic testing off.
    pub fn spawn_periodic(self: &Arc<Self>, frequency_minutes: u64) -> Option<JoinHandle<()>> {
        if frequency_minutes == 0 {
            tracing::info!("automatic channel testing is disabled");
            return None;
        }
        let monitor = Arc::clone(self);
        let period = Duration::from_secs(frequency_minutes * 60);
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                tracing::info!("automatically testing all channels");
                match monitor.test_all_channels(false).await {
                    Ok(handle) => {
                        if let Err(e) = handle.await {
                            tracing::error!("automatic channel test task failed: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("automatic channel test skipped: {}", e),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelStatus, ChannelType};
    use crate::config::HealthConfig;
    use crate::error::{ErrorKind, RelayError};
    use crate::health::notify::LogNotifier;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MemoryChannels {
        channels: Mutex<HashMap<i64, Channel>>,
        fail_list: bool,
    }

    impl MemoryChannels {
        fn with(channels: Vec<Channel>) -> Self {
            Self {
                channels: Mutex::new(channels.into_iter().map(|c| (c.id, c)).collect()),
                fail_list: false,
            }
        }

        fn get(&self, id: i64) -> Channel {
            self.channels.lock().unwrap()[&id].clone()
        }
    }

    #[async_trait]
    impl ChannelStore for MemoryChannels {
        async fn get_channel(&self, id: i64) -> Result<Option<Channel>, GatewayError> {
            Ok(self.channels.lock().unwrap().get(&id).cloned())
        }

        async fn list_channels(&self) -> Result<Vec<Channel>, GatewayError> {
            if self.fail_list {
                return Err(GatewayError::Config("store offline".into()));
            }
            let mut all: Vec<Channel> = self.channels.lock().unwrap().values().cloned().collect();
            all.sort_by_key(|c| c.id);
            Ok(all)
        }

        async fn upsert_channel(&self, channel: &Channel) -> Result<(), GatewayError> {
            self.channels
                .lock()
                .unwrap()
                .insert(channel.id, channel.clone());
            Ok(())
        }

        async fn update_channel_status(
            &self,
            id: i64,
            status: ChannelStatus,
            _reason: Option<&str>,
        ) -> Result<bool, GatewayError> {
            let mut map = self.channels.lock().unwrap();
            match map.get_mut(&id) {
                Some(c) if c.status != status => {
                    c.status = status;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn update_response_time(
            &self,
            id: i64,
            response_time_ms: i64,
        ) -> Result<(), GatewayError> {
            if let Some(c) = self.channels.lock().unwrap().get_mut(&id) {
                c.response_time_ms = response_time_ms;
            }
            Ok(())
        }
    }

    /// Scripted probe: per-channel outcome, optional gate and panic.
    #[derive(Default)]
    struct ScriptedProbe {
        outcomes: HashMap<i64, (u64, Option<RelayError>)>,
        gate: Option<Arc<Notify>>,
        panic: bool,
    }

    #[async_trait]
    impl ChannelProbe for ScriptedProbe {
        async fn test(&self, channel: &Channel, model: Option<&str>, _kind: TestKind) -> TestResult {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.panic {
                panic!("probe exploded");
            }
            let (ms, error) = self.outcomes.get(&channel.id).cloned().unwrap_or((100, None));
            TestResult {
                model: model.unwrap_or("gpt-4o-mini").to_string(),
                elapsed: Duration::from_millis(ms),
                error,
                usage: None,
                quota: 0,
            }
        }
    }

    fn channel(id: i64, status: ChannelStatus) -> Channel {
        Channel {
            id,
            name: format!("ch{}", id),
            channel_type: ChannelType::OpenAI,
            base_url: None,
            key: "sk-test".into(),
            models: "gpt-4o-mini".into(),
            test_model: None,
            model_mapping: None,
            group: "default".into(),
            status,
            response_time_ms: 0,
            auto_ban: true,
            test_time: None,
        }
    }

    fn monitor(store: Arc<MemoryChannels>, probe: ScriptedProbe) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(
            store,
            Arc::new(probe),
            ChannelPolicy::new(HealthConfig::default()),
            Arc::new(LogNotifier),
            Duration::ZERO,
        ))
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn second_batch_conflicts_while_first_runs() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(MemoryChannels::with(vec![channel(1, ChannelStatus::Enabled)]));
        let m = monitor(
            store,
            ScriptedProbe {
                gate: Some(gate.clone()),
                ..Default::default()
            },
        );

        let first = m.test_all_channels(false).await.unwrap();
        assert!(m.is_running());
        assert!(matches!(
            m.test_all_channels(false).await,
            Err(GatewayError::BatchRunning)
        ));

        gate.notify_one();
        first.await.unwrap();
        assert!(!m.is_running());

        gate.notify_one();
        let again = m.test_all_channels(true).await.unwrap();
        again.await.unwrap();
    }

    #[tokio::test]
    async fn flag_released_after_panic() {
        let store = Arc::new(MemoryChannels::with(vec![channel(1, ChannelStatus::Enabled)]));
        let m = monitor(
            store,
            ScriptedProbe {
                panic: true,
                ..Default::default()
            },
        );
        let handle = m.test_all_channels(false).await.unwrap();
        handle.await.unwrap();
        assert!(!m.is_running());
    }

    #[tokio::test]
    async fn flag_released_when_listing_fails() {
        let store = Arc::new(MemoryChannels {
            fail_list: true,
            ..Default::default()
        });
        let m = monitor(store, ScriptedProbe::default());
        assert!(m.test_all_channels(false).await.is_err());
        assert!(!m.is_running());
    }

    #[tokio::test]
    async fn slow_channel_is_disabled_and_timed() {
        let store = Arc::new(MemoryChannels::with(vec![
            channel(1, ChannelStatus::Enabled),
            channel(2, ChannelStatus::Enabled),
        ]));
        let mut outcomes = HashMap::new();
        outcomes.insert(1, (6_000, None));
        outcomes.insert(2, (300, None));
        let m = monitor(
            store.clone(),
            ScriptedProbe {
                outcomes,
                ..Default::default()
            },
        );

        m.test_all_channels(false).await.unwrap().await.unwrap();

        assert!(eventually(|| store.get(1).status == ChannelStatus::AutoDisabled).await);
        assert_eq!(store.get(1).response_time_ms, 6_000);
        assert_eq!(store.get(2).status, ChannelStatus::Enabled);
        assert_eq!(store.get(2).response_time_ms, 300);
    }

    #[tokio::test]
    async fn auto_ban_off_keeps_channel_enabled() {
        let mut ch = channel(1, ChannelStatus::Enabled);
        ch.auto_ban = false;
        let store = Arc::new(MemoryChannels::with(vec![ch]));
        let mut outcomes = HashMap::new();
        outcomes.insert(
            1,
            (
                100,
                Some(RelayError::with_status(ErrorKind::BadResponseStatus, 401, "bad key")),
            ),
        );
        let m = monitor(
            store.clone(),
            ScriptedProbe {
                outcomes,
                ..Default::default()
            },
        );
        m.test_all_channels(false).await.unwrap().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get(1).status, ChannelStatus::Enabled);
    }

    #[tokio::test]
    async fn auto_disabled_channel_recovers() {
        let store = Arc::new(MemoryChannels::with(vec![
            channel(1, ChannelStatus::AutoDisabled),
            channel(2, ChannelStatus::ManuallyDisabled),
        ]));
        let m = monitor(store.clone(), ScriptedProbe::default());
        m.test_all_channels(false).await.unwrap().await.unwrap();

        assert!(eventually(|| store.get(1).status == ChannelStatus::Enabled).await);
        assert_eq!(store.get(2).status, ChannelStatus::ManuallyDisabled);
    }

    #[tokio::test]
    async fn manual_test_never_disables() {
        let store = Arc::new(MemoryChannels::with(vec![channel(1, ChannelStatus::Enabled)]));
        let mut outcomes = HashMap::new();
        outcomes.insert(
            1,
            (
                100,
                Some(RelayError::with_status(ErrorKind::BadResponseStatus, 401, "bad key")),
            ),
        );
        let m = monitor(
            store.clone(),
            ScriptedProbe {
                outcomes,
                ..Default::default()
            },
        );
        let result = m.test_channel(1, None, TestKind::Text).await.unwrap();
        assert_eq!(result.error.unwrap().status, Some(401));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get(1).status, ChannelStatus::Enabled);
        assert_eq!(store.get(1).response_time_ms, 0);
    }

    #[tokio::test]
    async fn manual_success_records_response_time() {
        let store = Arc::new(MemoryChannels::with(vec![channel(3, ChannelStatus::Enabled)]));
        let mut outcomes = HashMap::new();
        outcomes.insert(3, (1_234, None));
        let m = monitor(
            store.clone(),
            ScriptedProbe {
                outcomes,
                ..Default::default()
            },
        );
        let result = m.test_channel(3, Some("gpt-4o"), TestKind::Json).await.unwrap();
        assert_eq!(result.model, "gpt-4o");
        assert!(eventually(|| store.get(3).response_time_ms == 1_234).await);
    }

    #[tokio::test]
    async fn unknown_channel_is_not_found() {
        let m = monitor(Arc::new(MemoryChannels::default()), ScriptedProbe::default());
        assert!(matches!(
            m.test_channel(99, None, TestKind::Text).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn zero_frequency_spawns_nothing() {
        let m = monitor(Arc::new(MemoryChannels::default()), ScriptedProbe::default());
        assert!(m.spawn_periodic(0).is_none());
    }
}
