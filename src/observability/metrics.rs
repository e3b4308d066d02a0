//! Prometheus-compatible metrics.
//!
//! Method labels are cardinality-protected by the dispatcher: only
//! registered method names reach these functions, everything else arrives
//! as [`UNKNOWN_METHOD_LABEL`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::ConfigError;

/// Guard to prevent double-initialization of the metrics recorder.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Label used for methods that have no registered handler.
pub const UNKNOWN_METHOD_LABEL: &str = "__unknown__";

/// Initializes the global metrics recorder.
///
/// When `port` is `Some`, a Prometheus HTTP listener is started on
/// `127.0.0.1:<port>`. When `None`, the recorder is installed without an
/// HTTP endpoint.
///
/// # Errors
///
/// Returns [`ConfigError::Metrics`] if the recorder or HTTP listener
/// cannot be installed (e.g. port already in use).
pub fn init_metrics(port: Option<u16>) -> Result<(), ConfigError> {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        tracing::debug!("metrics already initialized, skipping");
        return Ok(());
    }
    port.map_or_else(
        || PrometheusBuilder::new().install_recorder().map(|_| ()),
        |p| {
            PrometheusBuilder::new()
                .with_http_listener(([127, 0, 0, 1], p))
                .install()
        },
    )
    .map_err(|e| ConfigError::Metrics(e.to_string()))?;

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "toolhost_requests_total",
        "Total number of requests received from the client"
    );
    describe_counter!(
        "toolhost_responses_total",
        "Total number of responses sent to the client"
    );
    describe_counter!(
        "toolhost_notifications_total",
        "Total number of notifications received from the client"
    );
    describe_counter!(
        "toolhost_frames_dropped_total",
        "Frames or payloads discarded before dispatch"
    );
    describe_counter!(
        "toolhost_handler_failures_total",
        "Handler and lifecycle callback failures"
    );
    describe_histogram!(
        "toolhost_request_duration_ms",
        "Request handling duration in milliseconds"
    );
    describe_gauge!(
        "toolhost_requests_in_flight",
        "Requests currently being handled"
    );
    describe_gauge!(
        "toolhost_lifecycle_state",
        "Host lifecycle state (0 created .. 4 stopped)"
    );
}

/// Records an incoming request.
pub fn record_request(method_label: &str) {
    counter!("toolhost_requests_total", "method" => method_label.to_owned()).increment(1);
}

/// Records an incoming notification.
pub fn record_notification(method_label: &str) {
    counter!("toolhost_notifications_total", "method" => method_label.to_owned()).increment(1);
}

/// Records an outgoing response.
pub fn record_response(method_label: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        "toolhost_responses_total",
        "method" => method_label.to_owned(),
        "status" => status,
    )
    .increment(1);
}

/// Records request handling duration.
pub fn record_request_duration(method_label: &str, duration: Duration) {
    histogram!("toolhost_request_duration_ms", "method" => method_label.to_owned())
        .record(duration.as_secs_f64() * 1000.0);
}

/// Records a frame or payload discarded before dispatch.
pub fn record_frame_dropped(reason: &'static str) {
    counter!("toolhost_frames_dropped_total", "reason" => reason).increment(1);
}

/// Records a handler or callback failure (`error`, `panic`, `callback`...).
pub fn record_handler_failure(kind: &'static str) {
    counter!("toolhost_handler_failures_total", "kind" => kind).increment(1);
}

/// Marks a request handler as started.
pub fn request_started() {
    gauge!("toolhost_requests_in_flight").increment(1.0);
}

/// Marks a request handler as finished.
pub fn request_finished() {
    gauge!("toolhost_requests_in_flight").decrement(1.0);
}

/// Publishes the current lifecycle state.
pub fn set_lifecycle_state(value: f64) {
    gauge!("toolhost_lifecycle_state").set(value);
}
