//! Error types for `toolhost`
//!
//! One error enum per layer (transport, serialization, dispatch, lifecycle,
//! configuration), aggregated by [`HostError`] which also maps to process
//! exit codes.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::message::{JsonRpcError, MessageKind, RequestId, error_codes};

// ============================================================================
// Exit Codes
// ============================================================================

/// Exit codes for the `toolhost` binary.
///
/// These codes follow Unix conventions.
pub struct ExitCode;

impl ExitCode {
    /// Successful execution (`exit` received after `shutdown`)
    pub const SUCCESS: i32 = 0;

    /// General error, or `exit` received without a preceding `shutdown`
    pub const ERROR: i32 = 1;

    /// Configuration error (host settings that cannot be applied)
    pub const CONFIG_ERROR: i32 = 2;

    /// I/O error
    pub const IO_ERROR: i32 = 3;

    /// Transport error (stream failure outside of orderly EOF)
    pub const TRANSPORT_ERROR: i32 = 4;

    /// Usage error (invalid arguments or environment values)
    pub const USAGE_ERROR: i32 = 64;

    /// Interrupted by SIGINT (Ctrl+C)
    pub const INTERRUPTED: i32 = 130;

    /// Terminated by SIGTERM
    pub const TERMINATED: i32 = 143;
}

// ============================================================================
// Top-Level Error
// ============================================================================

/// Top-level error type for host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Transport layer error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Handler, callback or service registration error
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Lifecycle state machine violation
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Response discipline violation on a request context
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// Host-initiated request failed
    #[error(transparent)]
    Request(#[from] RequestError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HostError {
    /// Returns the appropriate exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => ExitCode::CONFIG_ERROR,
            Self::Transport(_) => ExitCode::TRANSPORT_ERROR,
            Self::Io(_) => ExitCode::IO_ERROR,
            Self::Registration(_)
            | Self::Lifecycle(_)
            | Self::Response(_)
            | Self::Request(_)
            | Self::Json(_) => ExitCode::ERROR,
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration errors raised while building host or transport settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Metrics recorder or exporter could not be installed
    #[error("metrics setup failed: {0}")]
    Metrics(String),
}

// ============================================================================
// Transport Errors
// ============================================================================

/// Transport channel errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error on the underlying stream
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Read or write attempted before `start()`
    #[error("transport not started")]
    NotStarted,

    /// Read or write attempted after `stop()`, or the peer went away
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Returns `true` when the error means the peer is gone rather than a
    /// local failure (EOF, broken pipe, reset).
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::NotStarted => false,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
        }
    }
}

/// Reasons a frame is discarded by the Content-Length decoder.
///
/// These never terminate the read loop; they are logged and counted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Header block has no `Content-Length` line
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// `Content-Length` value is not a non-negative integer
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),

    /// Header line without a `name: value` separator
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),

    /// Header bytes are not valid UTF-8
    #[error("header is not valid UTF-8")]
    HeaderNotUtf8,

    /// Header block grew past the configured limit without terminating
    #[error("header block exceeds {limit} bytes")]
    HeaderTooLarge {
        /// Configured header size limit in bytes
        limit: usize,
    },

    /// Declared body length exceeds the configured limit
    #[error("message too large: {size} bytes (limit: {limit})")]
    MessageTooLarge {
        /// Declared body size in bytes
        size: usize,
        /// Configured size limit in bytes
        limit: usize,
    },

    /// Stream ended part-way through a frame
    #[error("stream ended mid-frame ({pending} bytes discarded)")]
    Truncated {
        /// Bytes buffered when the stream ended
        pending: usize,
    },
}

impl FrameError {
    /// Short, fixed label for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::MissingContentLength => "missing_content_length",
            Self::InvalidContentLength(_) => "invalid_content_length",
            Self::MalformedHeader(_) => "malformed_header",
            Self::HeaderNotUtf8 => "header_not_utf8",
            Self::HeaderTooLarge { .. } => "header_too_large",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::Truncated { .. } => "truncated",
        }
    }
}

// ============================================================================
// Serialization Errors
// ============================================================================

/// A frame payload could not be turned into an envelope.
///
/// The listener loop logs and skips these; they never end the session.
#[derive(Debug, Error)]
pub enum DeserializationError {
    /// Payload is not valid JSON
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Payload is JSON but not an object
    #[error("message must be a JSON object")]
    NotAnObject,

    /// Object matches none of request, response or notification
    #[error("message must have 'method' (request/notification) or 'result'/'error' (response)")]
    UnknownShape,

    /// `jsonrpc` member missing or not the supported version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// `id` is neither an integer nor a string
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// A known member has the wrong type
    #[error("invalid '{field}': {reason}")]
    InvalidField {
        /// Member name
        field: &'static str,
        /// What was wrong with it
        reason: String,
    },
}

/// An envelope could not be encoded.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// JSON encoding failed
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// An outgoing message could not be written.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Envelope could not be encoded
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// Frame could not be written to the transport
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============================================================================
// Registration Errors
// ============================================================================

/// Errors raised while wiring handlers, callbacks and services.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// A handler already exists for this `(method, kind)` and override was
    /// not requested
    #[error("{kind} handler already registered for '{method}'")]
    DuplicateHandler {
        /// Method name
        method: String,
        /// Request or notification table
        kind: MessageKind,
    },

    /// A service of this type is already in the registry
    #[error("service already registered: {type_name}")]
    DuplicateService {
        /// Rust type name of the service
        type_name: &'static str,
    },

    /// Control methods (`initialize`, `shutdown`, `exit`, `version`) are
    /// served by the host itself
    #[error("'{method}' is a reserved control method")]
    Reserved {
        /// Method name
        method: String,
    },

    /// Registrations are only accepted before the host starts
    #[error("registration closed: host is {state}")]
    Closed {
        /// Lifecycle state at the time of the attempt
        state: String,
    },
}

// ============================================================================
// Lifecycle Errors
// ============================================================================

/// Lifecycle state machine violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// Requested transition is not allowed from the current state
    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// `initialize` received more than once
    #[error("server already initialized")]
    AlreadyInitialized,

    /// Request received before `initialize` completed
    #[error("server not initialized")]
    NotInitialized,

    /// Request received after `shutdown`
    #[error("server is shutting down")]
    ShuttingDown,
}

impl LifecycleError {
    /// Wire error code used when this violation is reported to the client.
    #[must_use]
    pub const fn code(&self) -> i64 {
        match self {
            Self::NotInitialized => error_codes::SERVER_NOT_INITIALIZED,
            Self::InvalidTransition { .. } | Self::AlreadyInitialized | Self::ShuttingDown => {
                error_codes::INVALID_REQUEST
            }
        }
    }
}

// ============================================================================
// Request Context Errors
// ============================================================================

/// Failures of a [`RequestContext`](crate::dispatch::RequestContext) send.
#[derive(Debug, Error)]
pub enum ResponseError {
    /// A terminal response was already sent for this request
    #[error("response already sent for request {id} ({method})")]
    AlreadyResponded {
        /// Request id
        id: RequestId,
        /// Method name
        method: String,
    },

    /// Result value could not be serialized
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// Response frame could not be written
    #[error(transparent)]
    Write(#[from] WriteError),
}

// ============================================================================
// Handler Errors
// ============================================================================

/// Error returned by request and notification handlers.
///
/// The dispatcher converts this into a wire error response when the handler
/// has not already responded.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Params were missing or did not match the expected shape
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Application-level failure with an explicit wire code
    #[error("{message}")]
    Failed {
        /// Wire error code
        code: i64,
        /// Human-readable message
        message: String,
        /// Optional structured detail
        data: Option<serde_json::Value>,
    },

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Creates a [`HandlerError::Failed`] without data.
    #[must_use]
    pub fn failed(code: i64, message: impl Into<String>) -> Self {
        Self::Failed {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Converts into the wire error object.
    #[must_use]
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::InvalidParams(msg) => {
                JsonRpcError::new(error_codes::INVALID_PARAMS, format!("invalid params: {msg}"))
            }
            Self::Failed {
                code,
                message,
                data,
            } => JsonRpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            Self::Internal(msg) => JsonRpcError::new(error_codes::INTERNAL_ERROR, msg.clone()),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidParams(err.to_string())
    }
}

impl From<ResponseError> for HandlerError {
    fn from(err: ResponseError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<LifecycleError> for HandlerError {
    fn from(err: LifecycleError) -> Self {
        Self::failed(err.code(), err.to_string())
    }
}

impl From<RequestError> for HandlerError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Rejected(e) => Self::Failed {
                code: e.code,
                message: e.message,
                data: e.data,
            },
            other => Self::Internal(other.to_string()),
        }
    }
}

// ============================================================================
// Host-Initiated Request Errors
// ============================================================================

/// Failures of a request the host sent to the client.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Client answered with an error object
    #[error("client rejected request: {0}")]
    Rejected(JsonRpcError),

    /// No response arrived within the configured timeout
    #[error("request '{method}' timed out after {timeout:?}")]
    TimedOut {
        /// Method name
        method: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Connection went away before a response arrived
    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    /// Params could not be serialized
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// Request frame could not be written
    #[error(transparent)]
    Write(#[from] WriteError),
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Result type alias for host operations.
pub type Result<T> = std::result::Result<T, HostError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitCode::SUCCESS, 0);
        assert_eq!(ExitCode::ERROR, 1);
        assert_eq!(ExitCode::CONFIG_ERROR, 2);
        assert_eq!(ExitCode::IO_ERROR, 3);
        assert_eq!(ExitCode::TRANSPORT_ERROR, 4);
        assert_eq!(ExitCode::USAGE_ERROR, 64);
        assert_eq!(ExitCode::INTERRUPTED, 130);
        assert_eq!(ExitCode::TERMINATED, 143);
    }

    #[test]
    fn test_transport_error_exit_code() {
        let err: HostError = TransportError::NotStarted.into();
        assert_eq!(err.exit_code(), ExitCode::TRANSPORT_ERROR);
    }

    #[test]
    fn test_config_error_exit_code() {
        let err: HostError = ConfigError::Metrics("port in use".to_string()).into();
        assert_eq!(err.exit_code(), ExitCode::CONFIG_ERROR);
    }

    #[test]
    fn test_registration_error_display() {
        let err = RegistrationError::DuplicateHandler {
            method: "foo".to_string(),
            kind: MessageKind::Request,
        };
        assert_eq!(err.to_string(), "request handler already registered for 'foo'");
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(TransportError::Closed.is_disconnect());
        assert!(!TransportError::NotStarted.is_disconnect());
        let pipe = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(TransportError::Io(pipe).is_disconnect());
        let other = std::io::Error::other("disk on fire");
        assert!(!TransportError::Io(other).is_disconnect());
    }

    #[test]
    fn test_handler_error_codes() {
        let err = HandlerError::InvalidParams("missing field `uri`".to_string());
        assert_eq!(err.to_rpc_error().code, error_codes::INVALID_PARAMS);

        let err = HandlerError::Internal("boom".to_string());
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, error_codes::INTERNAL_ERROR);
        assert_eq!(rpc.message, "boom");

        let err = HandlerError::Failed {
            code: 4001,
            message: "connection refused".to_string(),
            data: Some(json!({"server": "db01"})),
        };
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, 4001);
        assert_eq!(rpc.data, Some(json!({"server": "db01"})));
    }

    #[test]
    fn test_handler_error_from_json() {
        let json_err = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err: HandlerError = json_err.into();
        assert!(matches!(err, HandlerError::InvalidParams(_)));
    }

    #[test]
    fn test_rejected_request_keeps_client_code() {
        let err: HandlerError = RequestError::Rejected(JsonRpcError::new(-1, "nope")).into();
        assert_eq!(err.to_rpc_error().code, -1);
    }

    #[test]
    fn test_lifecycle_error_into_handler_error() {
        let err: HandlerError = LifecycleError::ShuttingDown.into();
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, error_codes::INVALID_REQUEST);
        assert_eq!(rpc.message, "server is shutting down");
    }

    #[test]
    fn test_lifecycle_error_codes() {
        assert_eq!(
            LifecycleError::NotInitialized.code(),
            error_codes::SERVER_NOT_INITIALIZED
        );
        assert_eq!(
            LifecycleError::AlreadyInitialized.code(),
            error_codes::INVALID_REQUEST
        );
    }

    #[test]
    fn test_frame_error_labels() {
        assert_eq!(FrameError::MissingContentLength.label(), "missing_content_length");
        assert_eq!(
            FrameError::MessageTooLarge { size: 2, limit: 1 }.to_string(),
            "message too large: 2 bytes (limit: 1)"
        );
    }

    #[test]
    fn test_timed_out_display() {
        let err = RequestError::TimedOut {
            method: "workspace/configuration".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "request 'workspace/configuration' timed out after 30s"
        );
    }
}
