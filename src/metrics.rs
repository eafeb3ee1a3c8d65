use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::time::Duration;

/// Telemetry side channel. Filter results never carry metric fields; the
/// chain reports each invocation here instead.
pub struct Metrics {
    registry: Registry,

    // Request metrics, partitioned by status code, method and path.
    pub request_count: IntCounterVec,
    pub request_latency: HistogramVec,
    pub requests_in_flight: IntGaugeVec,

    // Filter metrics, partitioned by name, invoke point and status code.
    pub filter_count: IntCounterVec,
    pub filter_latency: HistogramVec,

    // Stream session metrics.
    pub sessions_active: IntGaugeVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_count = IntCounterVec::new(
            Opts::new(
                "bridle_http_requests_total",
                "How many HTTP requests processed, partitioned by status code, method and path",
            ),
            &["code", "method", "path"],
        )
        .expect("metric creation failed");

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "bridle_http_request_duration_seconds",
                "How long it took to process the request, partitioned by status code, method and path",
            ),
            &["code", "method", "path"],
        )
        .expect("metric creation failed");

        let requests_in_flight = IntGaugeVec::new(
            Opts::new(
                "bridle_http_requests_in_flight",
                "How many requests are being processed, partitioned by method and path",
            ),
            &["method", "path"],
        )
        .expect("metric creation failed");

        let filter_count = IntCounterVec::new(
            Opts::new(
                "bridle_filter_process_total",
                "How many filter invocations ran, partitioned by name, invoke point and status code",
            ),
            &["name", "invoke_point", "code"],
        )
        .expect("metric creation failed");

        let filter_latency = HistogramVec::new(
            HistogramOpts::new(
                "bridle_filter_process_duration_seconds",
                "How long each filter invocation took, partitioned by name, invoke point and status code",
            ),
            &["name", "invoke_point", "code"],
        )
        .expect("metric creation failed");

        let sessions_active = IntGaugeVec::new(
            Opts::new(
                "bridle_stream_sessions_active",
                "Hijacked stream sessions currently pumping, partitioned by kind",
            ),
            &["kind"],
        )
        .expect("metric creation failed");

        registry
            .register(Box::new(request_count.clone()))
            .unwrap();
        registry
            .register(Box::new(request_latency.clone()))
            .unwrap();
        registry
            .register(Box::new(requests_in_flight.clone()))
            .unwrap();
        registry.register(Box::new(filter_count.clone())).unwrap();
        registry
            .register(Box::new(filter_latency.clone()))
            .unwrap();
        registry
            .register(Box::new(sessions_active.clone()))
            .unwrap();

        Self {
            registry,
            request_count,
            request_latency,
            requests_in_flight,
            filter_count,
            filter_latency,
            sessions_active,
        }
    }

    pub fn record_filter(
        &self,
        name: &str,
        invoke_point: &str,
        code: u16,
        duration: Duration,
    ) {
        let code = code.to_string();
        self.filter_count
            .with_label_values(&[name, invoke_point, &code])
            .inc();
        self.filter_latency
            .with_label_values(&[name, invoke_point, &code])
            .observe(duration.as_secs_f64());
    }

    pub fn record_request(&self, code: u16, method: &str, path: &str, duration: Duration) {
        let code = code.to_string();
        self.request_count
            .with_label_values(&[&code, method, path])
            .inc();
        self.request_latency
            .with_label_values(&[&code, method, path])
            .observe(duration.as_secs_f64());
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}
