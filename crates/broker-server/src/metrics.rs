use broker_core::TickReport;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).unwrap_or_else(|e| panic!("bad metric {name}: {e}"))
}

pub static JOBS_PUSHED: Lazy<IntCounter> =
    Lazy::new(|| counter("jobs_pushed_total", "Total jobs pushed"));

pub static JOBS_FETCHED: Lazy<IntCounter> =
    Lazy::new(|| counter("jobs_fetched_total", "Total jobs leased to a worker"));

pub static JOBS_ACKED: Lazy<IntCounter> =
    Lazy::new(|| counter("jobs_acked_total", "Total jobs acked"));

pub static JOBS_FAILED: Lazy<IntCounter> =
    Lazy::new(|| counter("jobs_failed_total", "Total failures reported by workers"));

pub static JOBS_PROMOTED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "jobs_promoted_total",
        "Scheduled and retry entries moved into their queue",
    )
});

pub static LEASES_REAPED: Lazy<IntCounter> =
    Lazy::new(|| counter("leases_reaped_total", "Expired leases reclaimed by the reaper"));

pub static JOBS_DEAD: Lazy<IntCounter> =
    Lazy::new(|| counter("jobs_dead_total", "Jobs moved to the dead set"));

pub static WORKING_SET_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("working_set_size", "Jobs currently leased")
        .unwrap_or_else(|e| panic!("bad metric working_set_size: {e}"))
});

pub fn init_metrics() {
    // Ignore errors if called multiple times (common in tests)
    let _ = REGISTRY.register(Box::new(JOBS_PUSHED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FETCHED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_ACKED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FAILED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_PROMOTED.clone()));
    let _ = REGISTRY.register(Box::new(LEASES_REAPED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_DEAD.clone()));
    let _ = REGISTRY.register(Box::new(WORKING_SET_SIZE.clone()));
}

/// Fold one reaper pass into the counters.
pub fn record_tick(report: &TickReport) {
    JOBS_PROMOTED.inc_by((report.scheduled + report.retries) as u64);
    LEASES_REAPED.inc_by((report.reclaimed + report.dead) as u64);
    JOBS_DEAD.inc_by(report.dead as u64);
}

pub fn gather() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buf) {
        tracing::error!(error = %e, "metrics encoding failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}
