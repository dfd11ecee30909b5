use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static IDENTITY_CACHE_LOOKUPS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static STORE_GET_OR_CREATE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

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
                Opts::new(
                    "compliance_api_http_requests_total",
                    "Compliance API HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create compliance_api_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "compliance_api_http_request_duration_seconds",
                    "Compliance API HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create compliance_api_http_request_duration_seconds"),
        )
    })
}

fn identity_cache_lookups_total() -> &'static IntCounterVec {
    IDENTITY_CACHE_LOOKUPS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "compliance_api_identity_cache_lookups_total",
                    "Identity cache lookups by entity kind and outcome.",
                ),
                &["kind", "outcome"],
            )
            .expect("create compliance_api_identity_cache_lookups_total"),
        )
    })
}

fn store_get_or_create_total() -> &'static IntCounterVec {
    STORE_GET_OR_CREATE_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "compliance_api_store_get_or_create_total",
                    "Store get-or-create calls by entity kind and outcome.",
                ),
                &["kind", "outcome"],
            )
            .expect("create compliance_api_store_get_or_create_total"),
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

pub fn observe_cache_lookup(kind: &str, hit: bool) {
    identity_cache_lookups_total()
        .with_label_values(&[kind, if hit { "hit" } else { "miss" }])
        .inc();
}

pub fn observe_get_or_create(kind: &str, ok: bool) {
    store_get_or_create_total()
        .with_label_values(&[kind, if ok { "ok" } else { "error" }])
        .inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = http_requests_total();
    let _ = identity_cache_lookups_total();
    let _ = store_get_or_create_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
