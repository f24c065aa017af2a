use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::server::AppState;

mod relay;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/channel/test", get(channel_test::test_all_channels))
        .route("/api/channel/test/{id}", get(channel_test::test_channel))
        .route("/v1/chat/completions", post(relay::chat_completions))
        .route("/v1/embeddings", post(relay::embeddings))
        .route("/v1/images/generations", post(relay::image_generations))
        .route("/v1beta/models/{model_action}", post(relay::gemini_native))
}
