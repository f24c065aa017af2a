use axum::Json;
use axum::body::{Body, to_bytes};
use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Rejects POST/PUT/PATCH requests whose non-empty body is not valid JSON.
pub async fn validate_json(request: Request, next: Next) -> Response {
    if !matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH) {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("Failed to read request body: {}", e);
            return invalid_json();
        }
    };

    let is_blank = bytes.iter().all(|b| b.is_ascii_whitespace());
    if !is_blank && serde_json::from_slice::<serde::de::IgnoredAny>(&bytes).is_err() {
        tracing::debug!(path = %parts.uri.path(), "rejected request with invalid JSON body");
        return invalid_json();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

fn invalid_json() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": "Invalid JSON" })),
    )
        .into_response()
}
