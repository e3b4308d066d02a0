//! `toolhost` - protocol host for editor-facing tooling services
//!
//! This library provides the JSON-RPC plumbing a tooling service needs to
//! talk to its client over a duplex stream: Content-Length framing,
//! message dispatch, the `initialize`/`shutdown`/`exit` lifecycle and a
//! registry for the services the host carries.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod observability;
pub mod protocol;
pub mod transport;

pub use host::{ExitReason, HostedService, ProtocolHost};
