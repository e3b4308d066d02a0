//! Hosted services.

use std::sync::Arc;

use super::ProtocolHost;
use crate::error::HostError;

/// A feature module that plugs into a [`ProtocolHost`].
///
/// [`ProtocolHost::add_service`] first stores the instance in the service
/// registry, then calls [`register`](Self::register) so the service can
/// add handlers and lifecycle callbacks. Handlers typically capture a
/// clone of the `Arc<Self>` they receive.
pub trait HostedService: Send + Sync + 'static {
    /// Name used in logs and callback failure reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Registers handlers and callbacks with the host.
    ///
    /// # Errors
    ///
    /// Propagates registration failures (duplicate or reserved methods).
    fn register(self: Arc<Self>, host: &ProtocolHost) -> Result<(), HostError>;
}
