//! Outbound side of the session: events and host-initiated requests.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::pending::PendingRequests;
use crate::error::{RequestError, SerializationError, WriteError};
use crate::protocol::message::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, error_codes,
};
use crate::protocol::writer::MessageWriter;

/// Handle for sending messages to the client.
///
/// Cheap to clone; every clone shares the writer and the pending table.
#[derive(Debug, Clone)]
pub struct Peer {
    writer: MessageWriter,
    pending: Arc<PendingRequests>,
    request_timeout: Option<Duration>,
}

impl Peer {
    /// Creates a peer over a writer.
    #[must_use]
    pub fn new(writer: MessageWriter, request_timeout: Option<Duration>) -> Self {
        Self {
            writer,
            pending: Arc::new(PendingRequests::new()),
            request_timeout,
        }
    }

    /// Returns the underlying writer.
    #[must_use]
    pub const fn writer(&self) -> &MessageWriter {
        &self.writer
    }

    /// Returns the table of requests awaiting a client response.
    #[must_use]
    pub const fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Sends a notification (event) to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if `params` cannot be serialized or the frame
    /// cannot be written.
    pub async fn send_event<P: Serialize + Sync>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<(), WriteError> {
        let params = serde_json::to_value(params).map_err(SerializationError::from)?;
        let notification = JsonRpcNotification::new(method, Some(params));
        self.writer.write(&notification.into()).await
    }

    /// Sends a request to the client and waits for the correlated response.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Rejected`] if the client answered with an error
    /// - [`RequestError::TimedOut`] if the configured timeout elapsed
    /// - [`RequestError::ConnectionClosed`] if the session ended first
    pub async fn send_request<P: Serialize + Sync>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<Value, RequestError> {
        let params = serde_json::to_value(params).map_err(SerializationError::from)?;
        let (id, rx) = self.pending.register()?;
        // Removes the waiter however this future ends, including when the
        // caller drops it.
        let _waiter = Waiter {
            pending: &self.pending,
            id: &id,
        };
        let request = JsonRpcRequest::new(id.clone(), method, Some(params));

        self.writer.write(&request.into()).await?;
        tracing::debug!(%id, method, "request sent to client");

        let outcome = match self.request_timeout {
            Some(timeout) => {
                if let Ok(outcome) = tokio::time::timeout(timeout, rx).await {
                    outcome
                } else {
                    tracing::warn!(%id, method, ?timeout, "client did not answer in time");
                    return Err(RequestError::TimedOut {
                        method: method.to_string(),
                        timeout,
                    });
                }
            }
            None => rx.await,
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(RequestError::Rejected(error)),
            Err(_) => Err(RequestError::ConnectionClosed),
        }
    }

    /// Typed variant of [`send_request`](Self::send_request).
    ///
    /// # Errors
    ///
    /// As for [`send_request`](Self::send_request); a result that does not
    /// deserialize into `R` is reported as [`RequestError::Rejected`] with
    /// an invalid-params code.
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R, RequestError>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let value = self.send_request(method, params).await?;
        serde_json::from_value(value).map_err(|e| {
            RequestError::Rejected(JsonRpcError::new(
                error_codes::INVALID_PARAMS,
                format!("unexpected result shape for '{method}': {e}"),
            ))
        })
    }

    /// Routes a response from the client to its waiting caller.
    pub(crate) fn complete(&self, response: JsonRpcResponse) {
        let id = response.id.clone();
        if !self.pending.complete(response) {
            tracing::warn!(%id, "response for unknown request id, dropping");
        }
    }
}

/// Entry in the pending table owned by one `send_request` call.
struct Waiter<'a> {
    pending: &'a PendingRequests,
    id: &'a RequestId,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.id);
    }
}
