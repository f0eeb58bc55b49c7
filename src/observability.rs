use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: finished booking requests. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "seatlock_bookings_total";

/// Counter: booking attempts, including retries.
pub const BOOKING_ATTEMPTS_TOTAL: &str = "seatlock_booking_attempts_total";

/// Counter: attempts retried after a transient failure. Labels: reason.
pub const BOOKING_RETRIES_TOTAL: &str = "seatlock_booking_retries_total";

/// Histogram: end-to-end booking latency in seconds, retries included.
pub const BOOKING_DURATION_SECONDS: &str = "seatlock_booking_duration_seconds";

/// Counter: quota checks that came back denied. Labels: resource, reason.
pub const QUOTA_DENIALS_TOTAL: &str = "seatlock_quota_denials_total";

/// Counter: reservation lifecycle transitions. Labels: to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "seatlock_status_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: tenants held by the store.
pub const TENANTS_ACTIVE: &str = "seatlock_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatlock_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatlock_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call more than once;
/// later calls leave the first subscriber in place.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
