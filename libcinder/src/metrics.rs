//! Request metrics for backend calls.
//!
//! Every snapshot operation opens a [`MetricContext`] labelled with the
//! resource and the request kind, and passes the call result through
//! [`MetricContext::observe_request`], which records latency and outcome
//! without altering the result.

use std::fmt;
use std::time::{Duration, Instant};

use log::debug;

pub const REQUEST_DURATION_SECONDS: &str = "openstack_api_request_duration_seconds";
pub const REQUEST_ERRORS_TOTAL: &str = "openstack_api_request_errors_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestLabel {
    pub resource: &'static str,
    pub request: &'static str,
}

impl RequestLabel {
    pub const fn new(resource: &'static str, request: &'static str) -> Self {
        Self { resource, request }
    }

    /// Value of the `request` label, e.g. `snapshot_create`.
    pub fn metric_value(&self) -> String {
        format!("{}_{}", self.resource, self.request)
    }
}

impl fmt::Display for RequestLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.request)
    }
}

pub trait MetricsRecorder: Send + Sync {
    fn observe(&self, label: RequestLabel, elapsed: Duration, failed: bool);
}

pub struct MetricContext<'a> {
    recorder: &'a dyn MetricsRecorder,
    label: RequestLabel,
    start: Instant,
}

impl<'a> MetricContext<'a> {
    pub fn new(
        recorder: &'a dyn MetricsRecorder,
        resource: &'static str,
        request: &'static str,
    ) -> Self {
        Self {
            recorder,
            label: RequestLabel::new(resource, request),
            start: Instant::now(),
        }
    }

    pub fn observe_request<T, E>(self, result: Result<T, E>) -> Result<T, E> {
        self.recorder
            .observe(self.label, self.start.elapsed(), result.is_err());
        result
    }
}

/// Emits the request duration histogram and the error counter through the
/// `metrics` facade. Without an installed exporter the calls are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApiMetrics;

impl MetricsRecorder for ApiMetrics {
    fn observe(&self, label: RequestLabel, elapsed: Duration, failed: bool) {
        let request = label.metric_value();
        debug!(
            "request {label} finished in {:.3}s (failed: {failed})",
            elapsed.as_secs_f64()
        );
        ::metrics::histogram!(REQUEST_DURATION_SECONDS, "request" => request.clone())
            .record(elapsed.as_secs_f64());
        if failed {
            ::metrics::counter!(REQUEST_ERRORS_TOTAL, "request" => request).increment(1);
        }
    }
}
