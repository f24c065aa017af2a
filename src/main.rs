mod cache;
mod channel;
mod config;
mod error;
mod health;
mod http_client;
mod logging;
mod providers;
mod relay;
mod routing;
mod server;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = config::Settings::load()?;
    http_client::init_proxy_bypass(&config.relay.proxy_bypass_hosts);

    let logger = Arc::new(logging::DatabaseLogger::new(&config.logging.database_path).await?);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let test_frequency = config.health.test_frequency_minutes;

    let state = Arc::new(server::build_state(config, logger).await?);
    state.monitor.spawn_periodic(test_frequency);
    let app = server::create_app(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Relay gateway running on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
