// Prometheus metrics for admission engine monitoring
//
// Registered once at startup via init(); gather_metrics() renders the
// Prometheus text format for whatever endpoint the host process exposes:
// - Admission checks and denials by limiting tier (counters)
// - Wait queue depth and active in-flight requests (gauges)
// - Queue wait times (histogram)
// - Quota threshold alerts by metric (counter)

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Admission metrics
    pub static ref ADMISSION_CHECKS_TOTAL: IntCounter = IntCounter::new(
        "modelgate_admission_checks_total",
        "Total number of admission checks"
    ).expect("Failed to create admission checks metric");

    pub static ref ADMISSION_DENIED_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("modelgate_admission_denied_total", "Admission denials by limiting tier"),
        &["limit"]
    ).expect("Failed to create admission denied metric");

    // Queue metrics
    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::new(
        "modelgate_queue_depth",
        "Number of requests waiting in the admission queue"
    ).expect("Failed to create queue depth metric");

    pub static ref QUEUE_WAIT_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("modelgate_queue_wait_seconds", "Time spent waiting in the admission queue"),
    ).expect("Failed to create queue wait metric");

    pub static ref ACTIVE_REQUESTS: IntGauge = IntGauge::new(
        "modelgate_active_requests",
        "Number of admitted requests currently in flight"
    ).expect("Failed to create active requests metric");

    // Quota metrics
    pub static ref QUOTA_ALERTS_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("modelgate_quota_alerts_total", "Quota threshold alerts by metric"),
        &["metric"]
    ).expect("Failed to create quota alerts metric");
}

/// Initialize metrics registry - must be called once at process startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(ADMISSION_CHECKS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ADMISSION_DENIED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(QUEUE_WAIT_SECONDS.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_REQUESTS.clone()))?;
    REGISTRY.register(Box::new(QUOTA_ALERTS_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
