pub mod settings;

pub use settings::{
    BalanceStrategy, ChannelSeed, GeminiConfig, HealthConfig, PricingConfig, PromptCacheConfig,
    RelayConfig, Settings,
};
