//! Dispatcher: routes decoded messages to registered handlers.
//!
//! Requests and notifications have separate tables. Every request runs as
//! its own task tracked by a [`TaskTracker`], so the listener loop never
//! waits on a handler and responses can leave in any order. Panics and
//! errors stop at this boundary: a failing request handler still produces
//! exactly one error response, a failing notification handler is logged.

pub mod context;
pub mod handler;
pub mod peer;
pub mod pending;

pub use context::{NotificationContext, RequestContext};
pub use handler::{
    HandlerResult, NotificationHandler, RequestHandler, TypedEvent, TypedMethod, parse_params,
};
pub use peer::Peer;
pub use pending::PendingRequests;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::error::{HandlerError, RegistrationError};
use crate::observability::metrics::{self, UNKNOWN_METHOD_LABEL};
use crate::protocol::message::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, MessageKind, error_codes,
};

/// Method-name keyed handler tables plus the task set running them.
pub struct Dispatcher {
    requests: DashMap<String, Arc<dyn RequestHandler>>,
    notifications: DashMap<String, Arc<dyn NotificationHandler>>,
    peer: Peer,
    tracker: TaskTracker,
}

impl Dispatcher {
    /// Creates a dispatcher with empty tables.
    #[must_use]
    pub fn new(peer: Peer) -> Self {
        Self {
            requests: DashMap::new(),
            notifications: DashMap::new(),
            peer,
            tracker: TaskTracker::new(),
        }
    }

    /// Outbound handle shared by every context this dispatcher creates.
    #[must_use]
    pub const fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Tracker holding every spawned handler task.
    #[must_use]
    pub const fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Registers a request handler.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicateHandler`] if `method` already
    /// has a request handler and `allow_override` is `false`.
    pub fn register_request_handler(
        &self,
        method: &str,
        handler: impl RequestHandler,
        allow_override: bool,
    ) -> Result<(), RegistrationError> {
        let handler: Arc<dyn RequestHandler> = Arc::new(handler);
        insert(
            &self.requests,
            method,
            handler,
            allow_override,
            MessageKind::Request,
        )
    }

    /// Registers a notification handler.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicateHandler`] if `method` already
    /// has a notification handler and `allow_override` is `false`.
    pub fn register_notification_handler(
        &self,
        method: &str,
        handler: impl NotificationHandler,
        allow_override: bool,
    ) -> Result<(), RegistrationError> {
        let handler: Arc<dyn NotificationHandler> = Arc::new(handler);
        insert(
            &self.notifications,
            method,
            handler,
            allow_override,
            MessageKind::Notification,
        )
    }

    /// Returns `true` if `method` has a request handler.
    #[must_use]
    pub fn has_request_handler(&self, method: &str) -> bool {
        self.requests.contains_key(method)
    }

    /// Returns `true` if `method` has a notification handler.
    #[must_use]
    pub fn has_notification_handler(&self, method: &str) -> bool {
        self.notifications.contains_key(method)
    }

    /// Routes one decoded message.
    ///
    /// Requests and notifications are handed to a spawned task whose
    /// handle is returned; responses complete a pending host-initiated
    /// request inline.
    pub fn dispatch(&self, message: JsonRpcMessage) -> Option<JoinHandle<()>> {
        match message {
            JsonRpcMessage::Request(request) => Some(self.dispatch_request(request)),
            JsonRpcMessage::Notification(notification) => {
                self.dispatch_notification(notification)
            }
            JsonRpcMessage::Response(response) => {
                self.peer.complete(response);
                None
            }
        }
    }

    /// Answers a request with an error without invoking any handler.
    pub fn reject(&self, request: &JsonRpcRequest, error: JsonRpcError) -> JoinHandle<()> {
        let label = self.metric_label(&request.method);
        metrics::record_request(&label);
        let ctx = RequestContext::new(
            request.id.clone(),
            request.method.clone(),
            label,
            self.peer.clone(),
        );
        self.tracker.spawn(async move {
            if let Err(e) = ctx.send_rpc_error(error).await {
                tracing::warn!(id = %ctx.id(), error = %e, "failed to send rejection");
            }
        })
    }

    /// Runs `request` through a specific handler instead of the table,
    /// with the same failure isolation as table handlers.
    pub fn dispatch_to(
        &self,
        request: JsonRpcRequest,
        handler: Arc<dyn RequestHandler>,
    ) -> JoinHandle<()> {
        let JsonRpcRequest { id, method, params } = request;
        let label = method.clone();
        metrics::record_request(&label);
        tracing::debug!(%id, method = %method, "dispatching request");
        let ctx = RequestContext::new(id, method, label, self.peer.clone());
        self.tracker.spawn(run_request(handler, params, ctx))
    }

    fn dispatch_request(&self, request: JsonRpcRequest) -> JoinHandle<()> {
        let handler = self
            .requests
            .get(&request.method)
            .map(|h| Arc::clone(h.value()));

        let Some(handler) = handler else {
            tracing::warn!(id = %request.id, method = %request.method, "no handler for request method");
            let error = JsonRpcError::new(
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {}", request.method),
            );
            return self.reject(&request, error);
        };
        self.dispatch_to(request, handler)
    }

    fn dispatch_notification(&self, notification: JsonRpcNotification) -> Option<JoinHandle<()>> {
        let JsonRpcNotification { method, params } = notification;
        let Some(handler) = self
            .notifications
            .get(&method)
            .map(|h| Arc::clone(h.value()))
        else {
            metrics::record_notification(UNKNOWN_METHOD_LABEL);
            tracing::debug!(method = %method, "no handler for notification, dropping");
            return None;
        };

        metrics::record_notification(&method);
        let ctx = NotificationContext::new(method.clone(), self.peer.clone());
        Some(self.tracker.spawn(async move {
            let outcome = AssertUnwindSafe(handler.handle(params, ctx))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    metrics::record_handler_failure("error");
                    tracing::warn!(method = %method, error = %e, "notification handler failed");
                }
                Err(panic) => {
                    metrics::record_handler_failure("panic");
                    tracing::error!(
                        method = %method,
                        panic = %panic_message(panic.as_ref()),
                        "notification handler panicked"
                    );
                }
            }
        }))
    }

    fn metric_label(&self, method: &str) -> String {
        if self.has_request_handler(method) {
            method.to_string()
        } else {
            UNKNOWN_METHOD_LABEL.to_string()
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("requests", &self.requests.len())
            .field("notifications", &self.notifications.len())
            .field("in_flight", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

fn insert<H: ?Sized>(
    table: &DashMap<String, Arc<H>>,
    method: &str,
    handler: Arc<H>,
    allow_override: bool,
    kind: MessageKind,
) -> Result<(), RegistrationError> {
    match table.entry(method.to_string()) {
        Entry::Occupied(mut entry) if allow_override => {
            entry.insert(handler);
            tracing::debug!(method, %kind, "handler overridden");
            Ok(())
        }
        Entry::Occupied(_) => Err(RegistrationError::DuplicateHandler {
            method: method.to_string(),
            kind,
        }),
        Entry::Vacant(entry) => {
            entry.insert(handler);
            tracing::trace!(method, %kind, "handler registered");
            Ok(())
        }
    }
}

/// Runs one request handler and makes sure the request gets an answer.
async fn run_request(handler: Arc<dyn RequestHandler>, params: Option<Value>, ctx: RequestContext) {
    let guard = ctx.share();
    metrics::request_started();

    let outcome = AssertUnwindSafe(handler.handle(params, ctx))
        .catch_unwind()
        .await;
    metrics::request_finished();

    let fallback = match outcome {
        // A handler that moved its context into another task answers later.
        Ok(Ok(())) if guard.has_responded() || !guard.is_sole_handle() => None,
        Ok(Ok(())) => {
            tracing::warn!(
                id = %guard.id(),
                method = %guard.method(),
                "handler finished without responding"
            );
            Some(JsonRpcError::new(
                error_codes::INTERNAL_ERROR,
                format!("handler for '{}' completed without a response", guard.method()),
            ))
        }
        Ok(Err(e)) => {
            metrics::record_handler_failure("error");
            tracing::warn!(id = %guard.id(), method = %guard.method(), error = %e, "request handler failed");
            (!guard.has_responded()).then(|| e.to_rpc_error())
        }
        Err(panic) => {
            metrics::record_handler_failure("panic");
            let message = panic_message(panic.as_ref());
            tracing::error!(id = %guard.id(), method = %guard.method(), panic = %message, "request handler panicked");
            (!guard.has_responded()).then(|| {
                HandlerError::Internal(format!("handler panicked: {message}")).to_rpc_error()
            })
        }
    };

    if let Some(error) = fallback
        && let Err(e) = guard.send_rpc_error(error).await
    {
        tracing::warn!(id = %guard.id(), error = %e, "failed to send fallback error response");
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
