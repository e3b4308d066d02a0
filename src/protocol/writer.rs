//! Message writer.
//!
//! Every outgoing message (responses, host-initiated requests, events)
//! goes through one [`MessageWriter`]. Encoding happens outside the
//! transport's write lock; the frame itself is written under it.

use std::fmt;
use std::sync::Arc;

use super::message::JsonRpcMessage;
use super::serializer::MessageSerializer;
use crate::error::WriteError;
use crate::transport::Transport;

/// Serializes envelopes and writes them as frames.
#[derive(Clone)]
pub struct MessageWriter {
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn MessageSerializer>,
}

impl MessageWriter {
    /// Creates a writer over a shared transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, serializer: Arc<dyn MessageSerializer>) -> Self {
        Self {
            transport,
            serializer,
        }
    }

    /// Encodes and writes one message as a single frame.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Serialization`] if the envelope cannot be
    /// encoded (nothing is written) or [`WriteError::Transport`] if the
    /// frame cannot be written.
    pub async fn write(&self, message: &JsonRpcMessage) -> Result<(), WriteError> {
        let payload = self.serializer.encode(message)?;
        self.transport.write_frame(&payload).await?;
        tracing::trace!(
            kind = %message.kind(),
            method = message.method().unwrap_or_default(),
            id = ?message.id(),
            bytes = payload.len(),
            "message sent"
        );
        Ok(())
    }

    /// Returns the serializer used for outgoing messages.
    #[must_use]
    pub fn serializer(&self) -> &Arc<dyn MessageSerializer> {
        &self.serializer
    }
}

impl fmt::Debug for MessageWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageWriter")
            .field("transport", &self.transport.transport_type())
            .field("serializer", &self.serializer.format_name())
            .finish()
    }
}
