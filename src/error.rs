use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::routing::load_balancer::BalanceError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Balance error: {0}")]
    Balance(#[from] BalanceError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Time parse error: {0}")]
    TimeParse(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("channel test is already running, please wait for it to finish")]
    BatchRunning,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BatchRunning => StatusCode::CONFLICT,
            GatewayError::Balance(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Relay(e) => e.http_status(),
            GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let GatewayError::Relay(e) = &self {
            // relay 路径按 OpenAI 错误格式返回
            return (status, Json(e.to_openai_body())).into_response();
        }
        let body = serde_json::json!({
            "success": false,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Classification of failures on the adaptor path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotImplemented,
    UpstreamUnreachable,
    BadResponseStatus,
    BadResponseBody,
    ModelMappingFailed,
    ModelPriceError,
    InvalidApiType,
    ChannelUnsupported,
    ChannelResponseTimeExceeded,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::UpstreamUnreachable => "upstream_unreachable",
            ErrorKind::BadResponseStatus => "bad_response_status",
            ErrorKind::BadResponseBody => "bad_response_body",
            ErrorKind::ModelMappingFailed => "model_mapping_failed",
            ErrorKind::ModelPriceError => "model_price_error",
            ErrorKind::InvalidApiType => "invalid_api_type",
            ErrorKind::ChannelUnsupported => "channel_unsupported",
            ErrorKind::ChannelResponseTimeExceeded => "channel_response_time_exceeded",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RelayError {
    pub kind: ErrorKind,
    pub message: String,
    /// Upstream HTTP status, when the failure came from a response.
    pub status: Option<u16>,
    /// Upstream error `type` / `code` fields, used by the disable policy.
    pub upstream_type: Option<String>,
    pub upstream_code: Option<String>,
}

impl RelayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            upstream_type: None,
            upstream_code: None,
        }
    }

    pub fn with_status(kind: ErrorKind, status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(kind, message)
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotImplemented, message)
    }

    pub fn bad_body(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadResponseBody, message)
    }

    pub fn unreachable(err: &reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("upstream request timed out: {}", err)
        } else {
            format!("do request failed: {}", err)
        };
        Self::new(ErrorKind::UpstreamUnreachable, message)
    }

    pub fn http_status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::InvalidInput | ErrorKind::ModelMappingFailed => StatusCode::BAD_REQUEST,
            ErrorKind::NotImplemented | ErrorKind::ChannelUnsupported => {
                StatusCode::NOT_IMPLEMENTED
            }
            ErrorKind::BadResponseStatus => self
                .status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            ErrorKind::ChannelResponseTimeExceeded => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::UpstreamUnreachable | ErrorKind::BadResponseBody => StatusCode::BAD_GATEWAY,
            ErrorKind::ModelPriceError | ErrorKind::InvalidApiType => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn to_openai_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.message,
                "type": self.upstream_type.as_deref().unwrap_or(self.kind.as_str()),
                "code": self.upstream_code.as_deref().unwrap_or(self.kind.as_str()),
            }
        })
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::bad_body(format!("unmarshal response body failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_status_keeps_upstream_code() {
        let e = RelayError::with_status(ErrorKind::BadResponseStatus, 429, "slow down");
        assert_eq!(e.http_status(), StatusCode::TOO_MANY_REQUESTS);
        let ge = GatewayError::from(e);
        assert_eq!(ge.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn openai_body_prefers_upstream_type() {
        let mut e = RelayError::with_status(ErrorKind::BadResponseStatus, 401, "bad key");
        e.upstream_type = Some("authentication_error".into());
        let body = e.to_openai_body();
        assert_eq!(body["error"]["type"], "authentication_error");
        assert_eq!(body["error"]["code"], "bad_response_status");
        assert_eq!(body["error"]["message"], "bad key");
    }
}
