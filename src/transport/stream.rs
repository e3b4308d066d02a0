//! Transport over any pre-established duplex byte stream.
//!
//! [`StreamTransport::stdio`] is what the binary uses; tests build the
//! same transport over `tokio::io::duplex` halves.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, Stdin, Stdout};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::{ContentLengthCodec, Result, Transport, TransportType, encode_frame};
use crate::config::TransportConfig;
use crate::error::TransportError;

/// Frame transport over a reader/writer pair.
///
/// Reader and writer sit behind separate `tokio::sync::Mutex` locks: the
/// listener loop holds the read side while handlers write concurrently,
/// and the write lock is held for a whole frame so frames never
/// interleave. The async mutex is required because both locks are held
/// across `.await` points.
pub struct StreamTransport<R, W> {
    reader: Mutex<FramedRead<R, ContentLengthCodec>>,
    writer: Mutex<BufWriter<W>>,
    config: TransportConfig,
    kind: TransportType,
    started: AtomicBool,
    stopped: AtomicBool,
    closed: CancellationToken,
}

impl StreamTransport<Stdin, Stdout> {
    /// Creates a transport over process stdin/stdout.
    #[must_use]
    pub fn stdio(config: TransportConfig) -> Self {
        Self::with_kind(
            tokio::io::stdin(),
            tokio::io::stdout(),
            config,
            TransportType::Stdio,
        )
    }
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// Creates a transport over an arbitrary reader/writer pair.
    #[must_use]
    pub fn new(reader: R, writer: W, config: TransportConfig) -> Self {
        Self::with_kind(reader, writer, config, TransportType::Stream)
    }

    fn with_kind(reader: R, writer: W, config: TransportConfig, kind: TransportType) -> Self {
        let codec = ContentLengthCodec::new(config.max_message_size, config.max_header_size);
        Self {
            reader: Mutex::new(FramedRead::with_capacity(
                reader,
                codec,
                config.buffer_size,
            )),
            writer: Mutex::new(BufWriter::with_capacity(config.buffer_size, writer)),
            config,
            kind,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    /// Returns the transport configuration.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(TransportError::NotStarted);
        }
        Ok(())
    }
}

impl<R, W> std::fmt::Debug for StreamTransport<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("kind", &self.kind)
            .field("config", &self.config)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if !self.started.swap(true, Ordering::AcqRel) {
            tracing::debug!(transport = %self.kind, "transport started");
        }
        Ok(())
    }

    #[allow(clippy::significant_drop_tightening)] // reader must be held until a frame arrives
    async fn read_frame(&self) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let mut reader = self.reader.lock().await;
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Ok(None),
            next = reader.next() => match next {
                Some(Ok(frame)) => {
                    tracing::trace!(bytes = frame.len(), "frame received");
                    Ok(Some(frame))
                }
                Some(Err(e)) => Err(TransportError::Io(e)),
                None => {
                    tracing::debug!(transport = %self.kind, "end of stream");
                    Ok(None)
                }
            },
        }
    }

    async fn write_frame(&self, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let mut frame = BytesMut::with_capacity(payload.len() + 32);
        encode_frame(payload, &mut frame);

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        drop(writer);

        tracing::trace!(bytes = payload.len(), "frame written");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        let result = writer.shutdown().await;
        drop(writer);
        tracing::debug!(transport = %self.kind, "transport stopped");

        match result.map_err(TransportError::Io) {
            Err(e) if !e.is_disconnect() => Err(e),
            _ => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn transport_type(&self) -> TransportType {
        self.kind
    }
}

#[cfg(test)]
pub(crate) type MemoryTransport = StreamTransport<
    tokio::io::ReadHalf<tokio::io::DuplexStream>,
    tokio::io::WriteHalf<tokio::io::DuplexStream>,
>;

/// In-memory transport wired to a client-side duplex stream.
#[cfg(test)]
pub(crate) fn memory_transport() -> (MemoryTransport, tokio::io::DuplexStream) {
    let (host_side, client_side) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(host_side);
    (
        StreamTransport::new(read, write, TransportConfig::default()),
        client_side,
    )
}
