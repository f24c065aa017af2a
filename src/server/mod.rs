pub mod handlers;
pub(crate) mod middleware;
pub(crate) mod storage_traits;
pub(crate) mod util;

use std::sync::Arc;

use axum::Router;

use crate::cache::{MemoryStore, PromptCacheManager, RedisStore, SharedStore};
use crate::channel::{Channel, ChannelStore};
use crate::config::Settings;
use crate::error::Result as AppResult;
use crate::health::{ChannelPolicy, ChannelTester, HealthMonitor, notifier_from_config};
use crate::logging::DatabaseLogger;
use crate::providers::AdaptorRegistry;
use crate::relay::quota::{ConfigPricing, PricingProvider};
use crate::routing::LoadBalancerState;
use crate::server::storage_traits::ConsumeLogStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Settings,
    pub channels: Arc<dyn ChannelStore>,
    pub ledger: Arc<dyn ConsumeLogStore>,
    pub adaptors: Arc<AdaptorRegistry>,
    pub pricing: Arc<dyn PricingProvider>,
    pub monitor: Arc<HealthMonitor>,
    pub load_balancer_state: Arc<LoadBalancerState>,
}

/// Seeds configured channels and wires every collaborator around one SQLite logger.
pub async fn build_state(config: Settings, logger: Arc<DatabaseLogger>) -> AppResult<AppState> {
    for seed in &config.channels {
        logger.upsert_channel(&Channel::from_seed(seed)).await?;
    }
    if !config.channels.is_empty() {
        tracing::info!(count = config.channels.len(), "Seeded channels from config");
    }

    let cache = if config.prompt_cache.enabled {
        let store: Arc<dyn SharedStore> = match config.prompt_cache.redis_url.as_deref() {
            Some(url) if !url.trim().is_empty() => match RedisStore::connect(url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    // Redis 不可用时退回进程内存储
                    tracing::warn!("Redis unavailable, using in-memory prompt cache store: {}", e);
                    Arc::new(MemoryStore::new())
                }
            },
            _ => Arc::new(MemoryStore::new()),
        };
        Some(Arc::new(PromptCacheManager::new(
            store,
            config.prompt_cache.clone(),
        )))
    } else {
        None
    };

    let adaptors = Arc::new(AdaptorRegistry::new(&config, cache));
    let pricing: Arc<dyn PricingProvider> = Arc::new(ConfigPricing::new(config.pricing.clone()));
    let channels: Arc<dyn ChannelStore> = logger.clone();
    let ledger: Arc<dyn ConsumeLogStore> = logger;

    let tester = Arc::new(ChannelTester::new(
        adaptors.clone(),
        pricing.clone(),
        ledger.clone(),
        config.relay.request_timeout(),
    ));
    let monitor = Arc::new(HealthMonitor::new(
        channels.clone(),
        tester,
        ChannelPolicy::new(config.health.clone()),
        notifier_from_config(&config.health),
        config.health.request_interval(),
    ));

    Ok(AppState {
        config,
        channels,
        ledger,
        adaptors,
        pricing,
        monitor,
        load_balancer_state: Arc::new(LoadBalancerState::default()),
    })
}

pub fn create_app(state: Arc<AppState>) -> Router {
    use axum::http::{Method, header};
    use tower_http::cors::{AllowOrigin, CorsLayer};
    use tower_http::trace::TraceLayer;

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-goog-api-key"),
        ])
        .allow_origin(AllowOrigin::mirror_request());

    handlers::routes()
        .with_state(state)
        .layer(axum::middleware::from_fn(middleware::validate_json))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
