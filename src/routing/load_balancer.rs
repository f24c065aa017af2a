use crate::channel::Channel;
use crate::config::BalanceStrategy;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Counters shared across requests so round-robin survives per-request balancers.
#[derive(Debug, Default)]
pub struct LoadBalancerState {
    channel_counter: Mutex<HashMap<String, usize>>,
    per_channel_key_counter: Mutex<HashMap<i64, usize>>,
}

impl LoadBalancerState {
    fn next_channel_index(&self, model: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let mut map = self
            .channel_counter
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let counter = map.entry(model.to_string()).or_insert(0);
        let idx = *counter % len;
        *counter = counter.wrapping_add(1);
        idx
    }

    fn next_key_index(&self, channel_id: i64, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let mut map = self
            .per_channel_key_counter
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let counter = map.entry(channel_id).or_insert(0);
        let idx = *counter % len;
        *counter = counter.wrapping_add(1);
        idx
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BalanceError {
    #[error("No enabled channel serves model {0}")]
    NoChannelsAvailable(String),
    #[error("Channel {0} has no API keys")]
    NoApiKeysAvailable(i64),
}

pub struct SelectedChannel {
    pub channel: Channel,
    pub api_key: String,
}

pub struct LoadBalancer {
    channels: Vec<Channel>,
    strategy: BalanceStrategy,
    state: Arc<LoadBalancerState>,
}

impl LoadBalancer {
    pub fn with_state(
        channels: Vec<Channel>,
        strategy: BalanceStrategy,
        state: Arc<LoadBalancerState>,
    ) -> Self {
        Self {
            channels,
            strategy,
            state,
        }
    }

    /// Picks an enabled channel listing `model`, then one of its keys.
    pub fn select_channel(&self, model: &str) -> Result<SelectedChannel, BalanceError> {
        let candidates: Vec<&Channel> = self
            .channels
            .iter()
            .filter(|c| c.is_enabled() && c.supports_model(model))
            .collect();
        if candidates.is_empty() {
            return Err(BalanceError::NoChannelsAvailable(model.to_string()));
        }

        let channel = match self.strategy {
            BalanceStrategy::FirstAvailable => candidates[0],
            BalanceStrategy::RoundRobin => {
                candidates[self.state.next_channel_index(model, candidates.len())]
            }
            BalanceStrategy::Random => {
                let mut rng = rand::rng();
                candidates[rng.random_range(0..candidates.len())]
            }
        };

        let api_key = self.select_api_key(channel)?;

        Ok(SelectedChannel {
            channel: channel.clone(),
            api_key,
        })
    }

    fn select_api_key(&self, channel: &Channel) -> Result<String, BalanceError> {
        let keys = channel.keys();
        if keys.is_empty() {
            return Err(BalanceError::NoApiKeysAvailable(channel.id));
        }

        let index = match self.strategy {
            BalanceStrategy::FirstAvailable => 0,
            BalanceStrategy::RoundRobin => self.state.next_key_index(channel.id, keys.len()),
            BalanceStrategy::Random => rand::rng().random_range(0..keys.len()),
        };
        Ok(keys[index].clone())
    }
}
