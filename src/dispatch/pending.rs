//! Correlation table for host-initiated requests.
//!
//! Ids come from a monotonic counter, so an id is never reused while a
//! request with that id is still waiting. Once the session ends the table
//! is closed and refuses new waiters.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::RequestError;
use crate::protocol::message::{JsonRpcError, JsonRpcResponse, RequestId};

/// Outcome delivered to a waiting caller.
pub type PendingResult = Result<Value, JsonRpcError>;

/// Requests sent to the client that are waiting for a response.
#[derive(Debug)]
pub struct PendingRequests {
    next_id: AtomicI64,
    waiting: DashMap<RequestId, oneshot::Sender<PendingResult>>,
    closed: AtomicBool,
}

impl PendingRequests {
    /// Creates an empty table. The first id handed out is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            waiting: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Allocates a fresh id and registers a waiter for it.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::ConnectionClosed`] once [`fail_all`](Self::fail_all)
    /// has run; nothing could ever answer the request.
    pub fn register(&self) -> Result<(RequestId, oneshot::Receiver<PendingResult>), RequestError> {
        if self.is_closed() {
            return Err(RequestError::ConnectionClosed);
        }
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id.clone(), tx);
        // Lost a race with `fail_all`: its sweep may have missed this entry.
        if self.is_closed() {
            self.waiting.remove(&id);
            return Err(RequestError::ConnectionClosed);
        }
        Ok((id, rx))
    }

    /// Delivers a response to its waiter.
    ///
    /// Returns `false` when no request with this id is waiting (already
    /// completed, timed out, or never sent).
    pub fn complete(&self, response: JsonRpcResponse) -> bool {
        let Some((_, tx)) = self.waiting.remove(&response.id) else {
            return false;
        };
        // The waiter may have given up in the meantime; that is not an error.
        let _ = tx.send(response.into_result());
        true
    }

    /// Forgets a waiter without completing it.
    pub fn cancel(&self, id: &RequestId) {
        self.waiting.remove(id);
    }

    /// Closes the table and drops every waiter. Their receivers observe a
    /// closed channel and later [`register`](Self::register) calls fail.
    pub fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let count = self.waiting.len();
        self.waiting.clear();
        if count > 0 {
            tracing::debug!(count, "abandoned pending outbound requests");
        }
    }

    /// Returns `true` once the session has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Returns `true` when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
