//! Protocol host: one client session over one transport.
//!
//! The host owns the transport, the dispatcher, the lifecycle state and
//! the service registry. A single listener task reads frames and routes
//! them; control methods are handled by the host itself, everything else
//! goes through the dispatcher tables.
//!
//! ```no_run
//! use std::sync::Arc;
//! use toolhost::config::{HostConfig, TransportConfig};
//! use toolhost::host::ProtocolHost;
//! use toolhost::transport::StreamTransport;
//!
//! # async fn run() -> toolhost::error::Result<()> {
//! let transport = Arc::new(StreamTransport::stdio(TransportConfig::from_env()));
//! let host = ProtocolHost::new(transport, HostConfig::default());
//! host.register_method("echo", |text: String| async move { Ok(text) })?;
//! let reason = host.run().await?;
//! std::process::exit(reason.exit_code());
//! # }
//! ```

pub mod control;
pub mod lifecycle;
pub mod registry;
pub mod service;

pub use control::{ControlMethod, InitializeParams, InitializeResult, ServerInfo, VersionInfo};
pub use lifecycle::{HostState, Lifecycle};
pub use registry::ServiceRegistry;
pub use service::HostedService;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::dispatch::{
    Dispatcher, HandlerResult, NotificationHandler, Peer, RequestContext, RequestHandler,
    TypedEvent, TypedMethod, panic_message, parse_params,
};
use crate::error::{
    ExitCode, HandlerError, HostError, LifecycleError, RegistrationError, RequestError,
    WriteError,
};
use crate::observability::logging::sanitize_bytes_for_log;
use crate::observability::metrics;
use crate::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcSerializer, MessageSerializer, MessageWriter,
    error_codes,
};
use crate::transport::Transport;

type InitializeCallback =
    Arc<dyn Fn(Arc<InitializeParams>) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;
type ShutdownCallback = Arc<dyn Fn() -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Clone)]
struct Named<C> {
    name: String,
    callback: C,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The client sent `exit`. `clean` is `true` when `shutdown` came first.
    Exit {
        /// Whether `shutdown` preceded `exit`
        clean: bool,
    },
    /// The client closed the stream without sending `exit`.
    TransportClosed {
        /// Whether `shutdown` had been received
        after_shutdown: bool,
    },
    /// Reading from the transport failed.
    TransportError(String),
    /// [`ProtocolHost::stop`] was called.
    Stopped,
}

impl ExitReason {
    /// Process exit code for this reason.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Exit { clean: true }
            | Self::TransportClosed {
                after_shutdown: true,
            }
            | Self::Stopped => ExitCode::SUCCESS,
            Self::Exit { clean: false }
            | Self::TransportClosed {
                after_shutdown: false,
            } => ExitCode::ERROR,
            Self::TransportError(_) => ExitCode::TRANSPORT_ERROR,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exit { clean: true } => write!(f, "exit after shutdown"),
            Self::Exit { clean: false } => write!(f, "exit without shutdown"),
            Self::TransportClosed { .. } => write!(f, "transport closed"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Protocol host session.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct ProtocolHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    config: HostConfig,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn MessageSerializer>,
    dispatcher: Dispatcher,
    control: ControlHandlers,
    lifecycle: Lifecycle,
    services: ServiceRegistry,
    on_initialize: Mutex<Vec<Named<InitializeCallback>>>,
    on_shutdown: Mutex<Vec<Named<ShutdownCallback>>>,
    shutdown_requested: AtomicBool,
    shutdown_callbacks_claimed: AtomicBool,
    stop_requested: CancellationToken,
    exited: CancellationToken,
    exit_reason: OnceLock<ExitReason>,
}

struct ControlHandlers {
    initialize: Arc<dyn RequestHandler>,
    shutdown: Arc<dyn RequestHandler>,
    version: Arc<dyn RequestHandler>,
}

/// What the listener loop does after routing one message.
enum Flow {
    Continue,
    Exit,
}

impl ProtocolHost {
    /// Creates a host over `transport` using the JSON-RPC serializer.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: HostConfig) -> Self {
        let serializer = Arc::new(JsonRpcSerializer::new(config.version_policy));
        Self::with_serializer(transport, config, serializer)
    }

    /// Creates a host with a custom serializer.
    #[must_use]
    pub fn with_serializer(
        transport: Arc<dyn Transport>,
        config: HostConfig,
        serializer: Arc<dyn MessageSerializer>,
    ) -> Self {
        let writer = MessageWriter::new(Arc::clone(&transport), Arc::clone(&serializer));
        let peer = Peer::new(writer, config.request_timeout);

        let inner = Arc::new_cyclic(|weak: &Weak<HostInner>| HostInner {
            control: ControlHandlers {
                initialize: Arc::new(InitializeHandler { host: weak.clone() }),
                shutdown: Arc::new(ShutdownHandler { host: weak.clone() }),
                version: Arc::new(VersionHandler { host: weak.clone() }),
            },
            config,
            transport,
            serializer,
            dispatcher: Dispatcher::new(peer),
            lifecycle: Lifecycle::new(),
            services: ServiceRegistry::new(),
            on_initialize: Mutex::new(Vec::new()),
            on_shutdown: Mutex::new(Vec::new()),
            shutdown_requested: AtomicBool::new(false),
            shutdown_callbacks_claimed: AtomicBool::new(false),
            stop_requested: CancellationToken::new(),
            exited: CancellationToken::new(),
            exit_reason: OnceLock::new(),
        });
        Self { inner }
    }

    // ========================================================================
    // Registration (only while Created)
    // ========================================================================

    /// Registers a request handler.
    ///
    /// # Errors
    ///
    /// Fails if the host has started, if `method` is a control method, or
    /// if a handler exists and `allow_override` is `false`.
    pub fn register_request_handler(
        &self,
        method: &str,
        handler: impl RequestHandler,
        allow_override: bool,
    ) -> Result<(), RegistrationError> {
        self.ensure_registration_open(method)?;
        self.inner
            .dispatcher
            .register_request_handler(method, handler, allow_override)
    }

    /// Registers a notification handler.
    ///
    /// # Errors
    ///
    /// Fails if the host has started, if `method` is a control method, or
    /// if a handler exists and `allow_override` is `false`.
    pub fn register_notification_handler(
        &self,
        method: &str,
        handler: impl NotificationHandler,
        allow_override: bool,
    ) -> Result<(), RegistrationError> {
        self.ensure_registration_open(method)?;
        self.inner
            .dispatcher
            .register_notification_handler(method, handler, allow_override)
    }

    /// Registers a request handler over typed params and result.
    ///
    /// # Errors
    ///
    /// As for [`register_request_handler`](Self::register_request_handler)
    /// without override.
    pub fn register_method<P, R, F, Fut>(&self, method: &str, f: F) -> Result<(), RegistrationError>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + Sync + 'static,
    {
        self.register_request_handler(method, TypedMethod::new(f), false)
    }

    /// Registers a notification handler over typed params.
    ///
    /// # Errors
    ///
    /// As for
    /// [`register_notification_handler`](Self::register_notification_handler)
    /// without override.
    pub fn register_event<P, F, Fut>(&self, method: &str, f: F) -> Result<(), RegistrationError>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
    {
        self.register_notification_handler(method, TypedEvent::new(f), false)
    }

    /// Adds a callback run during `initialize`.
    ///
    /// Callbacks run concurrently. An object returned by a callback is
    /// merged into the advertised capabilities; `null` contributes nothing.
    ///
    /// # Errors
    ///
    /// Fails if the host has started.
    pub fn register_on_initialize<F, Fut>(&self, name: &str, f: F) -> Result<(), RegistrationError>
    where
        F: Fn(Arc<InitializeParams>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.ensure_created()?;
        let callback: InitializeCallback = Arc::new(move |params| f(params).boxed());
        lock(&self.inner.on_initialize).push(Named {
            name: name.to_string(),
            callback,
        });
        Ok(())
    }

    /// Adds a callback run once when the session shuts down.
    ///
    /// Callbacks run concurrently on `shutdown`, or when the session ends
    /// without one.
    ///
    /// # Errors
    ///
    /// Fails if the host has started.
    pub fn register_on_shutdown<F, Fut>(&self, name: &str, f: F) -> Result<(), RegistrationError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.ensure_created()?;
        let callback: ShutdownCallback = Arc::new(move || f().boxed());
        lock(&self.inner.on_shutdown).push(Named {
            name: name.to_string(),
            callback,
        });
        Ok(())
    }

    /// Places `service` in the registry and lets it register its handlers.
    ///
    /// # Errors
    ///
    /// Fails if the host has started, if a service of type `S` is already
    /// present, or if the service's own registrations fail.
    pub fn add_service<S: HostedService>(&self, service: Arc<S>) -> Result<(), HostError> {
        self.ensure_created()?;
        self.inner.services.register_single(Arc::clone(&service))?;
        tracing::debug!(service = service.name(), "hosted service added");
        service.register(self)?;
        Ok(())
    }

    /// Registry of hosted service instances.
    #[must_use]
    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    fn ensure_created(&self) -> Result<(), RegistrationError> {
        let state = self.inner.lifecycle.state();
        if state == HostState::Created {
            Ok(())
        } else {
            Err(RegistrationError::Closed {
                state: state.to_string(),
            })
        }
    }

    fn ensure_registration_open(&self, method: &str) -> Result<(), RegistrationError> {
        self.ensure_created()?;
        if ControlMethod::from_method(method).is_some() {
            return Err(RegistrationError::Reserved {
                method: method.to_string(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Starts the transport and the listener loop.
    ///
    /// # Errors
    ///
    /// Fails if the host was already started or the transport cannot start.
    pub async fn start(&self) -> Result<(), HostError> {
        self.inner.lifecycle.transition(HostState::Started)?;
        if let Err(e) = self.inner.transport.start().await {
            self.inner.lifecycle.force_stop();
            self.inner.exited.cancel();
            return Err(e.into());
        }

        tracing::info!(
            transport = %self.inner.transport.transport_type(),
            format = self.inner.serializer.format_name(),
            server = %self.inner.config.server_name,
            "protocol host started"
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let reason = inner.listen().await;
            inner.finish(reason).await;
        });
        Ok(())
    }

    /// Starts the host and waits for the session to end.
    ///
    /// # Errors
    ///
    /// Fails if the host cannot start.
    pub async fn run(&self) -> Result<ExitReason, HostError> {
        self.start().await?;
        Ok(self.wait_for_exit().await)
    }

    /// Waits until the session has ended and the transport is closed.
    pub async fn wait_for_exit(&self) -> ExitReason {
        self.inner.exited.cancelled().await;
        self.exit_reason().unwrap_or(ExitReason::Stopped)
    }

    /// Why the session ended, once it has.
    #[must_use]
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.inner.exit_reason.get().cloned()
    }

    /// Ends the session from the host side.
    ///
    /// Shutdown callbacks that have not run yet are run, in-flight
    /// handlers get the drain timeout to finish, then the transport closes.
    pub fn stop(&self) {
        if self.inner.lifecycle.state() == HostState::Created {
            self.inner.record_exit(ExitReason::Stopped);
            self.inner.lifecycle.force_stop();
            self.inner.exited.cancel();
            return;
        }
        self.inner.record_exit(ExitReason::Stopped);
        self.inner.stop_requested.cancel();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HostState {
        self.inner.lifecycle.state()
    }

    /// Receiver that observes lifecycle transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<HostState> {
        self.inner.lifecycle.subscribe()
    }

    /// Host configuration.
    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    /// Outbound handle for events and client requests.
    #[must_use]
    pub fn peer(&self) -> &Peer {
        self.inner.dispatcher.peer()
    }

    /// Sends an event (notification) to the client.
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
        self.peer().send_event(method, params).await
    }

    /// Sends a request to the client and waits for the response.
    ///
    /// # Errors
    ///
    /// See [`Peer::send_request`].
    pub async fn send_request<P: Serialize + Sync>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<Value, RequestError> {
        self.peer().send_request(method, params).await
    }
}

impl std::fmt::Debug for ProtocolHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHost")
            .field("state", &self.inner.lifecycle.state())
            .field("dispatcher", &self.inner.dispatcher)
            .field("services", &self.inner.services)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Listener loop
// ============================================================================

impl HostInner {
    async fn listen(&self) -> ExitReason {
        loop {
            let frame = tokio::select! {
                biased;
                () = self.stop_requested.cancelled() => return ExitReason::Stopped,
                frame = self.transport.read_frame() => frame,
            };

            let bytes = match frame {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return self.transport_closed(),
                Err(e) if e.is_disconnect() => return self.transport_closed(),
                Err(e) => {
                    tracing::error!(error = %e, "transport read failed");
                    return ExitReason::TransportError(e.to_string());
                }
            };

            match self.serializer.decode(&bytes) {
                Ok(message) => {
                    if let Flow::Exit = self.route(message) {
                        return ExitReason::Exit {
                            clean: self.shutdown_requested.load(Ordering::Acquire),
                        };
                    }
                }
                Err(e) => {
                    metrics::record_frame_dropped("undecodable");
                    tracing::warn!(
                        error = %e,
                        payload = %sanitize_bytes_for_log(&bytes, 200),
                        "undecodable message, skipping"
                    );
                }
            }
        }
    }

    fn transport_closed(&self) -> ExitReason {
        let after_shutdown = self.shutdown_requested.load(Ordering::Acquire);
        tracing::info!(after_shutdown, "client closed the stream");
        ExitReason::TransportClosed { after_shutdown }
    }

    fn route(&self, message: JsonRpcMessage) -> Flow {
        match message {
            JsonRpcMessage::Request(request) => {
                if let Err(e) = self.lifecycle.admit_request(&request.method) {
                    tracing::warn!(
                        id = %request.id,
                        method = %request.method,
                        state = %self.lifecycle.state(),
                        error = %e,
                        "request rejected by lifecycle"
                    );
                    self.dispatcher
                        .reject(&request, JsonRpcError::new(e.code(), e.to_string()));
                    return Flow::Continue;
                }
                let handler = match ControlMethod::from_method(&request.method) {
                    Some(control) if control.is_notification() => {
                        self.dispatcher.reject(
                            &request,
                            JsonRpcError::new(
                                error_codes::INVALID_REQUEST,
                                format!("'{}' must be sent as a notification", control.method()),
                            ),
                        );
                        return Flow::Continue;
                    }
                    Some(ControlMethod::Shutdown) => {
                        // Settled before the next frame is read so a
                        // pipelined `exit` sees the shutdown.
                        if let Err(e) = self.begin_shutdown() {
                            self.dispatcher
                                .reject(&request, JsonRpcError::new(e.code(), e.to_string()));
                            return Flow::Continue;
                        }
                        Some(&self.control.shutdown)
                    }
                    Some(ControlMethod::Initialize) => Some(&self.control.initialize),
                    Some(ControlMethod::Version) => Some(&self.control.version),
                    Some(ControlMethod::Exit) | None => None,
                };
                match handler {
                    Some(handler) => {
                        self.dispatcher.dispatch_to(request, Arc::clone(handler));
                    }
                    None => {
                        self.dispatcher.dispatch(request.into());
                    }
                }
                Flow::Continue
            }
            JsonRpcMessage::Notification(notification) => {
                if ControlMethod::from_method(&notification.method)
                    .is_some_and(ControlMethod::is_notification)
                {
                    self.handle_exit();
                    return Flow::Exit;
                }
                if !self.lifecycle.admit_notification(&notification.method) {
                    tracing::warn!(
                        method = %notification.method,
                        state = %self.lifecycle.state(),
                        "notification not accepted in current state, dropping"
                    );
                    return Flow::Continue;
                }
                self.dispatcher.dispatch(notification.into());
                Flow::Continue
            }
            JsonRpcMessage::Response(response) => {
                self.dispatcher.dispatch(response.into());
                Flow::Continue
            }
        }
    }

    fn begin_shutdown(&self) -> Result<(), LifecycleError> {
        self.lifecycle.transition(HostState::ShuttingDown)?;
        self.shutdown_requested.store(true, Ordering::Release);
        Ok(())
    }

    fn handle_exit(&self) {
        let clean = self.shutdown_requested.load(Ordering::Acquire);
        if clean {
            tracing::info!("exit received");
        } else {
            tracing::warn!("exit received without a preceding shutdown");
        }
        self.record_exit(ExitReason::Exit { clean });
        self.lifecycle.force_stop();
    }

    fn record_exit(&self, reason: ExitReason) {
        if self.exit_reason.set(reason.clone()).is_ok() {
            tracing::debug!(%reason, "session ending");
        }
    }

    /// Tears the session down after the listener loop has returned.
    async fn finish(&self, reason: ExitReason) {
        self.record_exit(reason);
        let exiting = matches!(self.exit_reason.get(), Some(ExitReason::Exit { .. }));
        if exiting {
            self.stop_transport().await;
        }

        self.dispatcher.peer().pending().fail_all();
        if tokio::time::timeout(self.config.drain_timeout, self.run_shutdown_callbacks())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout = ?self.config.drain_timeout,
                "shutdown callbacks did not finish in time, abandoning them"
            );
        }

        let tracker = self.dispatcher.tracker();
        tracker.close();
        if tokio::time::timeout(self.config.drain_timeout, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = tracker.len(),
                timeout = ?self.config.drain_timeout,
                "drain timeout elapsed, abandoning in-flight handlers"
            );
        }

        self.stop_transport().await;
        self.lifecycle.force_stop();
        tracing::info!(
            reason = %self.exit_reason.get().cloned().unwrap_or(ExitReason::Stopped),
            "protocol host stopped"
        );
        self.exited.cancel();
    }

    async fn stop_transport(&self) {
        if let Err(e) = self.transport.stop().await {
            tracing::warn!(error = %e, "failed to close transport cleanly");
        }
    }

    // ========================================================================
    // Lifecycle callbacks
    // ========================================================================

    async fn run_initialize_callbacks(
        &self,
        params: Arc<InitializeParams>,
    ) -> (Map<String, Value>, Vec<Value>) {
        let callbacks = lock(&self.on_initialize).clone();
        let outcomes = join_all(callbacks.into_iter().map(|named| {
            let params = Arc::clone(&params);
            async move {
                let outcome = guarded(move || (named.callback)(params)).await;
                (named.name, outcome)
            }
        }))
        .await;

        let mut capabilities = Map::new();
        let mut failures = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(Value::Object(contribution)) => capabilities.extend(contribution),
                Ok(Value::Null) => {}
                Ok(other) => {
                    tracing::warn!(callback = %name, value = %other, "initialize callback returned a non-object, ignoring");
                }
                Err(error) => {
                    metrics::record_handler_failure("callback");
                    tracing::error!(callback = %name, %error, "initialize callback failed");
                    failures.push(json!({ "callback": name, "error": error }));
                }
            }
        }
        (capabilities, failures)
    }

    /// Runs shutdown callbacks unless they already ran.
    async fn run_shutdown_callbacks(&self) {
        if self.shutdown_callbacks_claimed.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = lock(&self.on_shutdown).clone();
        if callbacks.is_empty() {
            return;
        }
        let outcomes = join_all(callbacks.into_iter().map(|named| async move {
            let outcome = guarded(move || (named.callback)()).await;
            (named.name, outcome)
        }))
        .await;

        let mut failed = 0_usize;
        for (name, outcome) in outcomes {
            if let Err(error) = outcome {
                failed += 1;
                metrics::record_handler_failure("callback");
                tracing::error!(callback = %name, %error, "shutdown callback failed");
            }
        }
        tracing::debug!(failed, "shutdown callbacks finished");
    }
}

/// Runs a callback future, turning errors and panics into a message.
async fn guarded<T, F>(make: F) -> Result<T, String>
where
    F: FnOnce() -> BoxFuture<'static, Result<T, HandlerError>>,
{
    match AssertUnwindSafe(async move { make().await })
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Control handlers
// ============================================================================

fn upgrade(host: &Weak<HostInner>) -> Result<Arc<HostInner>, HandlerError> {
    host.upgrade()
        .ok_or_else(|| HandlerError::Internal("host is gone".to_string()))
}

struct InitializeHandler {
    host: Weak<HostInner>,
}

#[async_trait::async_trait]
impl RequestHandler for InitializeHandler {
    async fn handle(&self, params: Option<Value>, ctx: RequestContext) -> HandlerResult {
        let host = upgrade(&self.host)?;
        host.lifecycle.claim_initialize()?;
        let params: InitializeParams = match parse_params(params) {
            Ok(params) => params,
            Err(e) => {
                host.lifecycle.release_initialize();
                return Err(e);
            }
        };
        if let Some(client) = &params.client_info {
            tracing::info!(client = %client.name, version = ?client.version, "initialize received");
        }

        let (capabilities, failures) = host.run_initialize_callbacks(Arc::new(params)).await;
        host.lifecycle.transition(HostState::Initialized)?;

        let result = InitializeResult {
            capabilities,
            server_info: ServerInfo {
                name: host.config.server_name.clone(),
                version: host.config.server_version.clone(),
            },
        };
        if failures.is_empty() {
            ctx.send_result(&result).await?;
        } else {
            let error = JsonRpcError::new(
                error_codes::INTERNAL_ERROR,
                format!("{} initialize callback(s) failed", failures.len()),
            )
            .with_data(json!({ "failures": failures, "result": result }));
            ctx.send_rpc_error(error).await?;
        }
        Ok(())
    }
}

struct ShutdownHandler {
    host: Weak<HostInner>,
}

#[async_trait::async_trait]
impl RequestHandler for ShutdownHandler {
    async fn handle(&self, _params: Option<Value>, ctx: RequestContext) -> HandlerResult {
        // The listener has already moved the host to ShuttingDown.
        let host = upgrade(&self.host)?;
        host.run_shutdown_callbacks().await;
        ctx.send_result(&Value::Null).await?;
        Ok(())
    }
}

struct VersionHandler {
    host: Weak<HostInner>,
}

#[async_trait::async_trait]
impl RequestHandler for VersionHandler {
    async fn handle(&self, _params: Option<Value>, ctx: RequestContext) -> HandlerResult {
        let host = upgrade(&self.host)?;
        let info = VersionInfo {
            version: host.config.server_version.clone(),
            name: host.config.server_name.clone(),
        };
        ctx.send_result(&info).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
    use crate::transport::ContentLengthCodec;
    use crate::transport::stream::memory_transport;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::codec::FramedRead;

    struct Client {
        frames: FramedRead<ReadHalf<DuplexStream>, ContentLengthCodec>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, message: JsonRpcMessage) {
            let payload = JsonRpcSerializer::default().encode(&message).unwrap();
            let mut frame = bytes::BytesMut::new();
            crate::transport::encode_frame(&payload, &mut frame);
            self.writer.write_all(&frame).await.unwrap();
        }

        async fn request(&mut self, id: i64, method: &str, params: Value) -> JsonRpcResponse {
            self.send(JsonRpcRequest::new(id, method, Some(params)).into())
                .await;
            self.response().await
        }

        async fn response(&mut self) -> JsonRpcResponse {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.frames.next())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .unwrap();
            match JsonRpcSerializer::default().decode(&frame).unwrap() {
                JsonRpcMessage::Response(r) => r,
                other => panic!("expected response, got {other:?}"),
            }
        }
    }

    fn host() -> (ProtocolHost, Client) {
        let (transport, client) = memory_transport();
        let (read, write) = tokio::io::split(client);
        let config = HostConfig {
            drain_timeout: Duration::from_millis(200),
            ..HostConfig::default()
        };
        (
            ProtocolHost::new(Arc::new(transport), config),
            Client {
                frames: FramedRead::new(read, ContentLengthCodec::default()),
                writer: write,
            },
        )
    }

    #[tokio::test]
    async fn test_control_methods_are_reserved() {
        let (host, _client) = host();
        let err = host
            .register_method("shutdown", |(): ()| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Reserved { .. }));
    }

    #[tokio::test]
    async fn test_registration_closed_after_start() {
        let (host, _client) = host();
        host.start().await.unwrap();
        let err = host
            .register_method("late", |(): ()| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Closed { .. }));
        let err = host
            .register_on_shutdown("late", || async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Closed { .. }));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (host, _client) = host();
        host.start().await.unwrap();
        assert!(matches!(
            host.start().await.unwrap_err(),
            HostError::Lifecycle(_)
        ));
    }

    #[tokio::test]
    async fn test_initialize_merges_capabilities() {
        let (host, mut client) = host();
        host.register_on_initialize("connection", |_p| async {
            Ok(json!({"connectionProvider": true}))
        })
        .unwrap();
        host.register_on_initialize("scripting", |_p| async { Ok(json!({"scripting": {"batch": true}})) })
            .unwrap();
        host.start().await.unwrap();

        let resp = client.request(1, "initialize", json!({})).await;
        let result = resp.result().unwrap();
        assert_eq!(result["capabilities"]["connectionProvider"], true);
        assert_eq!(result["capabilities"]["scripting"]["batch"], true);
        assert_eq!(result["serverInfo"]["name"], "toolhost");
        assert_eq!(host.state(), HostState::Initialized);
    }

    #[tokio::test]
    async fn test_initialize_with_bad_params_can_be_retried() {
        let (host, mut client) = host();
        host.start().await.unwrap();

        let resp = client.request(1, "initialize", json!({"processId": "nope"})).await;
        assert_eq!(resp.error_object().unwrap().code, error_codes::INVALID_PARAMS);
        assert_eq!(host.state(), HostState::Started);

        let resp = client.request(2, "initialize", json!({})).await;
        assert!(!resp.is_error());
    }

    #[tokio::test]
    async fn test_version_request() {
        let (host, mut client) = host();
        host.start().await.unwrap();
        client.request(1, "initialize", json!({})).await;

        let resp = client.request(2, "version", json!(null)).await;
        let result = resp.result().unwrap();
        assert_eq!(result["name"], "toolhost");
        assert_eq!(result["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_exit_as_request_is_rejected() {
        let (host, mut client) = host();
        host.start().await.unwrap();
        client.request(1, "initialize", json!({})).await;
        let resp = client.request(2, "exit", json!(null)).await;
        assert_eq!(resp.error_object().unwrap().code, error_codes::INVALID_REQUEST);
        assert_eq!(host.state(), HostState::Initialized);
    }

    #[tokio::test]
    async fn test_stop_runs_shutdown_callbacks() {
        let (host, _client) = host();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        host.register_on_shutdown("flag", move || {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
        host.start().await.unwrap();

        host.stop();
        assert_eq!(host.wait_for_exit().await, ExitReason::Stopped);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(host.state(), HostState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (host, _client) = host();
        host.stop();
        assert_eq!(host.wait_for_exit().await, ExitReason::Stopped);
    }

    #[tokio::test]
    async fn test_notifications_dropped_before_initialize() {
        let (host, mut client) = host();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        host.register_event("connection/changed", move |_: Value| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
        host.start().await.unwrap();

        client
            .send(JsonRpcNotification::new("connection/changed", Some(json!({}))).into())
            .await;
        client.request(1, "initialize", json!({})).await;
        client
            .send(JsonRpcNotification::new("connection/changed", Some(json!({}))).into())
            .await;
        // A request round-trip orders the notification before the check.
        client.request(2, "version", json!(null)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exit_reason_codes() {
        assert_eq!(ExitReason::Exit { clean: true }.exit_code(), 0);
        assert_eq!(ExitReason::Exit { clean: false }.exit_code(), 1);
        assert_eq!(
            ExitReason::TransportClosed {
                after_shutdown: false
            }
            .exit_code(),
            1
        );
        assert_eq!(
            ExitReason::TransportClosed {
                after_shutdown: true
            }
            .exit_code(),
            0
        );
        assert_eq!(ExitReason::TransportError("x".into()).exit_code(), 4);
        assert_eq!(ExitReason::Stopped.exit_code(), 0);
    }

    #[test]
    fn test_exit_reason_display() {
        assert_eq!(
            ExitReason::Exit { clean: false }.to_string(),
            "exit without shutdown"
        );
        assert_eq!(
            ExitReason::TransportError("reset".into()).to_string(),
            "transport error: reset"
        );
    }

    #[tokio::test]
    async fn test_request_ids_from_client_are_echoed() {
        let (host, mut client) = host();
        host.start().await.unwrap();
        client
            .send(JsonRpcRequest::new("init-1", "initialize", Some(json!({}))).into())
            .await;
        assert_eq!(client.response().await.id, RequestId::from("init-1"));
    }
}
