use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::StatusCode;
use tokio::sync::{mpsc, oneshot};

use crate::error::RelayError;
use crate::providers::streaming::SseEvent;

/// Where an adaptor writes the canonical response. Streaming handlers call
/// `write_chunk` once per upstream event so nothing is buffered in full.
#[async_trait]
pub trait ClientSink: Send {
    async fn write_head(&mut self, status: StatusCode, content_type: &str)
    -> Result<(), RelayError>;
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), RelayError>;
}

pub async fn write_json<T: serde::Serialize + Sync>(
    sink: &mut dyn ClientSink,
    status: StatusCode,
    value: &T,
) -> Result<(), RelayError> {
    let body = serde_json::to_vec(value)
        .map_err(|e| RelayError::bad_body(format!("marshal response failed: {}", e)))?;
    sink.write_head(status, "application/json").await?;
    sink.write_chunk(Bytes::from(body)).await
}

pub async fn write_raw_json(
    sink: &mut dyn ClientSink,
    status: StatusCode,
    body: Bytes,
) -> Result<(), RelayError> {
    sink.write_head(status, "application/json").await?;
    sink.write_chunk(body).await
}

pub async fn start_event_stream(sink: &mut dyn ClientSink) -> Result<(), RelayError> {
    sink.write_head(StatusCode::OK, "text/event-stream").await
}

pub async fn write_sse_data(sink: &mut dyn ClientSink, data: String) -> Result<(), RelayError> {
    sink.write_chunk(Bytes::from(SseEvent::new(data).format_sse()))
        .await
}

pub async fn write_sse_done(sink: &mut dyn ClientSink) -> Result<(), RelayError> {
    sink.write_chunk(Bytes::from(SseEvent::done().format_sse()))
        .await
}

/// Collects the response in memory. Used by channel tests.
#[derive(Debug, Default)]
pub struct BufferSink {
    pub status: Option<StatusCode>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl BufferSink {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait]
impl ClientSink for BufferSink {
    async fn write_head(
        &mut self,
        status: StatusCode,
        content_type: &str,
    ) -> Result<(), RelayError> {
        if self.status.is_none() {
            self.status = Some(status);
            self.content_type = Some(content_type.to_string());
        }
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), RelayError> {
        self.body.extend_from_slice(&chunk);
        Ok(())
    }
}

pub type BodyChunk = Result<Bytes, std::io::Error>;

/// Hands the head to the HTTP handler once, then forwards chunks over a channel
/// that backs the client response body.
pub struct StreamingSink {
    head_tx: Option<oneshot::Sender<(StatusCode, String)>>,
    body_tx: mpsc::Sender<BodyChunk>,
    client_gone: bool,
}

impl StreamingSink {
    pub fn new() -> (
        Self,
        oneshot::Receiver<(StatusCode, String)>,
        mpsc::Receiver<BodyChunk>,
    ) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(64);
        (
            Self {
                head_tx: Some(head_tx),
                body_tx,
                client_gone: false,
            },
            head_rx,
            body_rx,
        )
    }
}

#[async_trait]
impl ClientSink for StreamingSink {
    async fn write_head(
        &mut self,
        status: StatusCode,
        content_type: &str,
    ) -> Result<(), RelayError> {
        if let Some(tx) = self.head_tx.take() {
            let _ = tx.send((status, content_type.to_string()));
        }
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), RelayError> {
        if self.head_tx.is_some() {
            self.write_head(StatusCode::OK, "application/json").await?;
        }
        if self.client_gone {
            return Ok(());
        }
        // 客户端断开后继续消费上游，保证用量统计完整
        if self.body_tx.send(Ok(chunk)).await.is_err() {
            tracing::debug!("client disconnected; draining upstream for usage");
            self.client_gone = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffer_sink_keeps_first_head() {
        let mut sink = BufferSink::default();
        write_json(&mut sink, StatusCode::OK, &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        sink.write_head(StatusCode::BAD_GATEWAY, "text/plain")
            .await
            .unwrap();
        assert_eq!(sink.status, Some(StatusCode::OK));
        assert_eq!(sink.body_text(), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn streaming_sink_delivers_head_then_chunks() {
        let (mut sink, head_rx, mut body_rx) = StreamingSink::new();
        start_event_stream(&mut sink).await.unwrap();
        write_sse_data(&mut sink, "{}".into()).await.unwrap();
        write_sse_done(&mut sink).await.unwrap();
        drop(sink);

        let (status, ct) = head_rx.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ct, "text/event-stream");
        let first = body_rx.recv().await.unwrap().unwrap();
        assert_eq!(&first[..], b"data: {}\n\n");
        let second = body_rx.recv().await.unwrap().unwrap();
        assert_eq!(&second[..], b"data: [DONE]\n\n");
        assert!(body_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn streaming_sink_survives_client_drop() {
        let (mut sink, _head_rx, body_rx) = StreamingSink::new();
        drop(body_rx);
        assert!(sink.write_chunk(Bytes::from_static(b"x")).await.is_ok());
        assert!(sink.write_chunk(Bytes::from_static(b"y")).await.is_ok());
    }
}
