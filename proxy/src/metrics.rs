use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref REQUESTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "proxy_requests_total",
        "Total ingestion requests received"
    ))
    .unwrap();
    pub static ref VALIDATION_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "proxy_validation_failures_total",
        "Total ingestion requests rejected by validation"
    ))
    .unwrap();
    pub static ref FORWARD_SUCCESS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "proxy_forward_success_total",
        "Total batches forwarded upstream successfully"
    ))
    .unwrap();
    pub static ref FORWARD_FAILURE_TOTAL: Counter = Counter::with_opts(Opts::new(
        "proxy_forward_failure_total",
        "Total batches that failed to forward after retries"
    ))
    .unwrap();
    pub static ref FORWARD_SKIPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "proxy_forward_skipped_total",
        "Total batches not forwarded because forwarding is disabled"
    ))
    .unwrap();
    pub static ref CIRCUIT_OPEN_TOTAL: Counter = Counter::with_opts(Opts::new(
        "proxy_circuit_open_total",
        "Total forward attempts rejected by the open circuit breaker"
    ))
    .unwrap();
    pub static ref STORE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "proxy_store_failures_total",
        "Total local storage write failures"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "proxy_ingest_latency_seconds",
            "End-to-end time to process one ingestion request"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(VALIDATION_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(FORWARD_SUCCESS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(FORWARD_FAILURE_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(FORWARD_SKIPPED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CIRCUIT_OPEN_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(STORE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
