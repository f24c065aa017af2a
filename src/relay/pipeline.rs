use crate::error::{ErrorKind, RelayError};
use crate::providers::{Adaptor, CanonicalRequest, Usage};
use crate::relay::{ClientSink, RelayInfo};

/// One adaptor round trip: convert, prepare, send, check status, translate back.
pub async fn relay_once(
    adaptor: &dyn Adaptor,
    info: &mut RelayInfo,
    request: &CanonicalRequest,
    sink: &mut dyn ClientSink,
) -> Result<Usage, RelayError> {
    let body = adaptor.convert_request(info, request)?;
    let body = adaptor.prepare_request(info, body).await;
    let response = adaptor.do_request(info, &body).await?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(error_from_response(response).await);
    }

    adaptor.do_response(info, response, sink).await
}

/// Builds a `BadResponseStatus` error from a non-200 upstream response,
/// keeping the provider's message, type and code when the body carries them.
pub async fn error_from_response(response: reqwest::Response) -> RelayError {
    let status = response.status().as_u16();
    let bytes = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            return RelayError::with_status(
                ErrorKind::BadResponseStatus,
                status,
                format!("read response body failed: {}", e),
            );
        }
    };
    error_from_body(status, &bytes)
}

pub fn error_from_body(status: u16, bytes: &[u8]) -> RelayError {
    let parsed: Option<serde_json::Value> = serde_json::from_slice(bytes).ok();
    let err_obj = parsed.as_ref().and_then(|v| match v {
        serde_json::Value::Array(items) => items.first().and_then(|i| i.get("error")).cloned(),
        _ => v.get("error").cloned(),
    });

    let as_text = |v: Option<&serde_json::Value>| {
        v.and_then(|x| match x {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };

    let mut err = match &err_obj {
        Some(serde_json::Value::String(s)) => {
            RelayError::with_status(ErrorKind::BadResponseStatus, status, s.clone())
        }
        Some(obj) => {
            let message = as_text(obj.get("message"))
                .unwrap_or_else(|| format!("bad response status code {}", status));
            let mut e = RelayError::with_status(ErrorKind::BadResponseStatus, status, message);
            // Gemini 把语义写在 status 字段里
            e.upstream_type = as_text(obj.get("type")).or_else(|| as_text(obj.get("status")));
            e.upstream_code = as_text(obj.get("code"));
            e
        }
        None => {
            let snippet = String::from_utf8_lossy(bytes);
            let snippet = snippet.trim();
            let message = if snippet.is_empty() {
                format!("bad response status code {}", status)
            } else {
                format!(
                    "bad response status code {}, body: {}",
                    status,
                    snippet.chars().take(512).collect::<String>()
                )
            };
            RelayError::with_status(ErrorKind::BadResponseStatus, status, message)
        }
    };
    err.status = Some(status);
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_error_body() {
        let e = error_from_body(
            401,
            br#"{"error":{"message":"Incorrect API key","type":"invalid_request_error","code":"invalid_api_key"}}"#,
        );
        assert_eq!(e.kind, ErrorKind::BadResponseStatus);
        assert_eq!(e.status, Some(401));
        assert_eq!(e.message, "Incorrect API key");
        assert_eq!(e.upstream_code.as_deref(), Some("invalid_api_key"));
    }

    #[test]
    fn gemini_error_body() {
        let e = error_from_body(
            400,
            br#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT"}}"#,
        );
        assert_eq!(e.upstream_type.as_deref(), Some("INVALID_ARGUMENT"));
        assert_eq!(e.upstream_code.as_deref(), Some("400"));
        assert!(e.message.starts_with("API key not valid"));
    }

    #[test]
    fn plain_text_body() {
        let e = error_from_body(502, b"upstream exploded");
        assert!(e.message.contains("upstream exploded"));
        let e = error_from_body(503, b"");
        assert_eq!(e.message, "bad response status code 503");
    }
}
