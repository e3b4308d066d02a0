//! Transport channel.
//!
//! A [`Transport`] owns one duplex byte stream and moves whole frames over
//! it. Framing is `Content-Length: N\r\n\r\n` followed by `N` payload bytes
//! (see [`framing`]). The channel knows nothing about JSON; envelopes are
//! the serializer's business.

pub mod framing;
pub mod stream;

pub use framing::{ContentLengthCodec, encode_frame};
pub use stream::StreamTransport;

use std::fmt;

use bytes::Bytes;

use crate::error::TransportError;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Default maximum message body size in bytes (10 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default maximum header block size in bytes (8 KiB).
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;

/// Default read/write buffer size for stdio (64 KiB).
pub const DEFAULT_STDIO_BUFFER_SIZE: usize = 64 * 1024;

/// Async frame channel.
///
/// Implementations use `&self` with interior mutability so the listener
/// loop (sole reader) and any number of writers can share one instance
/// behind an `Arc`. Reads and writes lock independently.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Allows reads and writes. Fails if the transport was already stopped.
    async fn start(&self) -> Result<()>;

    /// Waits for the next complete frame payload.
    ///
    /// Returns `Ok(None)` at end of stream or after [`stop`](Self::stop).
    /// Malformed frames are dropped inside the transport and never surface
    /// here.
    async fn read_frame(&self) -> Result<Option<Bytes>>;

    /// Writes one frame atomically: concurrent callers never interleave
    /// bytes of different frames.
    async fn write_frame(&self, payload: &[u8]) -> Result<()>;

    /// Closes the transport. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Returns `true` once [`stop`](Self::stop) has been called.
    fn is_closed(&self) -> bool;

    /// Returns the type of this transport for logging.
    fn transport_type(&self) -> TransportType;
}

/// Transport type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// Process stdin/stdout.
    Stdio,
    /// Any other pre-established duplex stream (pipes, sockets, in-memory).
    Stream,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Stream => write!(f, "stream"),
        }
    }
}
