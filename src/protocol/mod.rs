//! Message envelope, serializer and writer.

pub mod message;
pub mod serializer;
pub mod writer;

pub use message::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, MessageKind, RequestId, ResponsePayload, error_codes,
};
pub use serializer::{JsonRpcSerializer, MessageSerializer, VersionPolicy};
pub use writer::MessageWriter;
