//! `serve` command handler
//!
//! Runs one protocol host session over stdin/stdout.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cli::args::ServeArgs;
use crate::config::{DEFAULT_SERVER_NAME, HostConfig, TransportConfig};
use crate::error::HostError;
use crate::host::ProtocolHost;
use crate::protocol::VersionPolicy;
use crate::transport::StreamTransport;

/// Builds the host configuration from `serve` arguments.
#[must_use]
pub fn host_config(args: &ServeArgs) -> HostConfig {
    HostConfig {
        server_name: args
            .server_name
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string()),
        request_timeout: args.request_timeout,
        drain_timeout: args.drain_timeout,
        version_policy: if args.strict_version {
            VersionPolicy::Strict
        } else {
            VersionPolicy::Lenient
        },
        ..HostConfig::default()
    }
}

/// Serve the protocol over stdio until the client exits or `cancel` fires.
///
/// Returns the exit code for the way the session ended.
///
/// # Errors
///
/// Returns an error if metrics cannot be installed or the host cannot
/// start.
pub async fn run(args: &ServeArgs, cancel: CancellationToken) -> Result<i32, HostError> {
    if let Some(port) = args.metrics_port {
        crate::observability::init_metrics(Some(port))?;
        tracing::info!(port, "Prometheus metrics endpoint started");
    }

    let transport_config = TransportConfig::from_env();
    tracing::debug!(?transport_config, "transport configuration");

    let transport = Arc::new(StreamTransport::stdio(transport_config));
    let host = ProtocolHost::new(transport, host_config(args));
    host.start().await?;

    let reason = tokio::select! {
        reason = host.wait_for_exit() => reason,
        () = cancel.cancelled() => {
            tracing::info!("stop requested, shutting down host");
            host.stop();
            host.wait_for_exit().await
        }
    };

    tracing::info!(%reason, "session ended");
    Ok(reason.exit_code())
}
