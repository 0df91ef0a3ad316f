use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use sdlc_gitlab::CallObserver;

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static BACKEND_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static BACKEND_CALL_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static INVALID_ENTITIES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("sdlc_http_requests_total", "SDLC HTTP request count."),
                &["route", "method", "status"],
            )
            .expect("create sdlc_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "sdlc_http_request_duration_seconds",
                    "SDLC HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create sdlc_http_request_duration_seconds"),
        )
    })
}

fn backend_calls_total() -> &'static IntCounterVec {
    BACKEND_CALLS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("sdlc_backend_calls_total", "GitLab call attempts."),
                &["operation", "outcome"],
            )
            .expect("create sdlc_backend_calls_total"),
        )
    })
}

fn backend_call_duration_seconds() -> &'static HistogramVec {
    BACKEND_CALL_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "sdlc_backend_call_duration_seconds",
                    "GitLab call attempt duration in seconds.",
                )
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
                &["operation"],
            )
            .expect("create sdlc_backend_call_duration_seconds"),
        )
    })
}

fn invalid_entities_total() -> &'static IntCounter {
    INVALID_ENTITIES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "sdlc_invalid_entities_total",
                "Entity files that failed to decode.",
            )
            .expect("create sdlc_invalid_entities_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_backend_call(operation: &str, outcome: &str, duration: Duration) {
    backend_calls_total()
        .with_label_values(&[operation, outcome])
        .inc();
    backend_call_duration_seconds()
        .with_label_values(&[operation])
        .observe(duration.as_secs_f64());
}

pub fn inc_invalid_entities(count: usize) {
    invalid_entities_total().inc_by(count as u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BackendCallMetrics;

impl CallObserver for BackendCallMetrics {
    fn observe(&self, operation: &'static str, outcome: &'static str, latency: Duration) {
        observe_backend_call(operation, outcome, latency);
    }
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = invalid_entities_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
