//! Per-request response handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use super::peer::Peer;
use crate::error::{RequestError, ResponseError, SerializationError, WriteError};
use crate::observability::metrics;
use crate::protocol::message::{JsonRpcError, JsonRpcResponse, RequestId};

/// Single-use handle bound to one incoming request.
///
/// Exactly one of [`send_result`](Self::send_result),
/// [`send_error`](Self::send_error) or
/// [`send_rpc_error`](Self::send_rpc_error) succeeds; every later call
/// fails with [`ResponseError::AlreadyResponded`] and writes nothing.
///
/// The context is moved into the handler. If the handler returns without
/// responding, the dispatcher answers on its behalf.
#[derive(Debug)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    id: RequestId,
    method: String,
    metric_label: String,
    responded: AtomicBool,
    peer: Peer,
    received_at: Instant,
}

impl RequestContext {
    pub(crate) fn new(id: RequestId, method: String, metric_label: String, peer: Peer) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id,
                method,
                metric_label,
                responded: AtomicBool::new(false),
                peer,
                received_at: Instant::now(),
            }),
        }
    }

    /// Second handle to the same request, kept by the dispatcher so it can
    /// answer when the handler fails or never responds.
    pub(crate) fn share(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns `true` when no other handle to this request is alive.
    pub(crate) fn is_sole_handle(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Id of the request being answered.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.inner.id
    }

    /// Method of the request being answered.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// Returns `true` once a terminal response has been sent.
    #[must_use]
    pub fn has_responded(&self) -> bool {
        self.inner.responded.load(Ordering::Acquire)
    }

    /// Outbound handle for events and client requests made while handling
    /// this request.
    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.inner.peer
    }

    /// Sends a success response.
    ///
    /// # Errors
    ///
    /// Fails with [`ResponseError::AlreadyResponded`] if this request was
    /// already answered, or if `result` cannot be serialized (in which
    /// case the context is still open).
    pub async fn send_result<T: Serialize + Sync>(&self, result: &T) -> Result<(), ResponseError> {
        let value = serde_json::to_value(result).map_err(SerializationError::from)?;
        self.respond(JsonRpcResponse::success(self.inner.id.clone(), value))
            .await
    }

    /// Sends an error response with the given code and message.
    ///
    /// # Errors
    ///
    /// Fails with [`ResponseError::AlreadyResponded`] if this request was
    /// already answered.
    pub async fn send_error(&self, code: i64, message: impl Into<String>) -> Result<(), ResponseError> {
        self.send_rpc_error(JsonRpcError::new(code, message)).await
    }

    /// Sends a prepared error object.
    ///
    /// # Errors
    ///
    /// Fails with [`ResponseError::AlreadyResponded`] if this request was
    /// already answered.
    pub async fn send_rpc_error(&self, error: JsonRpcError) -> Result<(), ResponseError> {
        self.respond(JsonRpcResponse::error(self.inner.id.clone(), error))
            .await
    }

    /// Sends an event to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized or written.
    pub async fn send_event<P: Serialize + Sync>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<(), WriteError> {
        self.inner.peer.send_event(method, params).await
    }

    /// Sends a request to the client and waits for its response.
    ///
    /// # Errors
    ///
    /// See [`Peer::send_request`].
    pub async fn send_request<P: Serialize + Sync>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<Value, RequestError> {
        self.inner.peer.send_request(method, params).await
    }

    async fn respond(&self, response: JsonRpcResponse) -> Result<(), ResponseError> {
        let inner = &self.inner;
        if inner.responded.swap(true, Ordering::AcqRel) {
            tracing::error!(
                id = %inner.id,
                method = %inner.method,
                "second response attempted for request, ignoring"
            );
            return Err(ResponseError::AlreadyResponded {
                id: inner.id.clone(),
                method: inner.method.clone(),
            });
        }

        let success = !response.is_error();
        if let Some(error) = response.error_object() {
            tracing::debug!(id = %inner.id, method = %inner.method, code = error.code, "request failed");
        }
        metrics::record_response(&inner.metric_label, success);
        metrics::record_request_duration(&inner.metric_label, inner.received_at.elapsed());

        inner.peer.writer().write(&response.into()).await?;
        Ok(())
    }
}

/// Handle passed to notification handlers.
#[derive(Debug, Clone)]
pub struct NotificationContext {
    method: String,
    peer: Peer,
}

impl NotificationContext {
    pub(crate) const fn new(method: String, peer: Peer) -> Self {
        Self { method, peer }
    }

    /// Method of the notification being handled.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Outbound handle for replies in the form of events or requests.
    #[must_use]
    pub const fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Sends an event to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized or written.
    pub async fn send_event<P: Serialize + Sync>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<(), WriteError> {
        self.peer.send_event(method, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{JsonRpcMessage, error_codes};
    use crate::protocol::serializer::{JsonRpcSerializer, MessageSerializer};
    use crate::protocol::writer::MessageWriter;
    use crate::transport::stream::memory_transport;
    use crate::transport::{ContentLengthCodec, Transport};
    use futures_util::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::codec::FramedRead;

    async fn context(
        id: i64,
    ) -> (
        RequestContext,
        FramedRead<tokio::io::DuplexStream, ContentLengthCodec>,
    ) {
        let (transport, client) = memory_transport();
        transport.start().await.unwrap();
        let writer = MessageWriter::new(Arc::new(transport), Arc::new(JsonRpcSerializer::default()));
        let ctx = RequestContext::new(
            RequestId::Number(id),
            "scripting/script".to_string(),
            "scripting/script".to_string(),
            Peer::new(writer, None),
        );
        (ctx, FramedRead::new(client, ContentLengthCodec::default()))
    }

    async fn next_response(
        frames: &mut FramedRead<tokio::io::DuplexStream, ContentLengthCodec>,
    ) -> JsonRpcResponse {
        let frame = frames.next().await.unwrap().unwrap();
        match JsonRpcSerializer::default().decode(&frame).unwrap() {
            JsonRpcMessage::Response(r) => r,
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_result() {
        let (ctx, mut frames) = context(7).await;
        ctx.send_result(&json!({"script": "SELECT 1"})).await.unwrap();
        assert!(ctx.has_responded());

        let resp = next_response(&mut frames).await;
        assert_eq!(resp.id, RequestId::Number(7));
        assert_eq!(resp.result(), Some(&json!({"script": "SELECT 1"})));
    }

    #[tokio::test]
    async fn test_second_response_is_rejected_and_not_written() {
        let (ctx, mut frames) = context(3).await;
        ctx.send_result(&"first").await.unwrap();

        let err = ctx
            .send_error(error_codes::INTERNAL_ERROR, "second")
            .await
            .unwrap_err();
        assert!(matches!(err, ResponseError::AlreadyResponded { .. }));
        let err = ctx.send_result(&"third").await.unwrap_err();
        assert!(matches!(err, ResponseError::AlreadyResponded { .. }));

        let resp = next_response(&mut frames).await;
        assert_eq!(resp.result(), Some(&json!("first")));
        let extra = tokio::time::timeout(Duration::from_millis(50), frames.next()).await;
        assert!(extra.is_err(), "no second frame may be written");
    }

    #[tokio::test]
    async fn test_send_error() {
        let (ctx, mut frames) = context(4).await;
        ctx.send_error(4001, "connection refused").await.unwrap();
        let resp = next_response(&mut frames).await;
        let err = resp.error_object().unwrap();
        assert_eq!(err.code, 4001);
        assert_eq!(err.message, "connection refused");
    }

    #[tokio::test]
    async fn test_unserializable_result_leaves_context_open() {
        struct Broken;
        impl Serialize for Broken {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("nope"))
            }
        }

        let (ctx, mut frames) = context(5).await;
        let err = ctx.send_result(&Broken).await.unwrap_err();
        assert!(matches!(err, ResponseError::Serialization(_)));
        assert!(!ctx.has_responded());

        ctx.send_error(error_codes::INTERNAL_ERROR, "fallback").await.unwrap();
        assert!(next_response(&mut frames).await.is_error());
    }

    #[tokio::test]
    async fn test_share_tracks_handles() {
        let (ctx, _frames) = context(1).await;
        assert!(ctx.is_sole_handle());
        let shared = ctx.share();
        assert!(!ctx.is_sole_handle());
        drop(shared);
        assert!(ctx.is_sole_handle());
        assert_eq!(ctx.method(), "scripting/script");
        assert_eq!(ctx.id(), &RequestId::Number(1));
    }
}
