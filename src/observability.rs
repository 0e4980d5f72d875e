use std::net::SocketAddr;

// ── Ledger activity ─────────────────────────────────────────────

/// Counter: membership rows changed. Labels: op.
pub const MEMBERSHIP_MUTATIONS_TOTAL: &str = "xronos_membership_mutations_total";

/// Counter: commitment status changes. Labels: to.
pub const COMMITMENT_TRANSITIONS_TOTAL: &str = "xronos_commitment_transitions_total";

/// Counter: cycle job status changes. Labels: to.
pub const CYCLE_TRANSITIONS_TOTAL: &str = "xronos_cycle_transitions_total";

/// Counter: saves retried after an optimistic lock conflict.
pub const OPTIMISTIC_RETRIES_TOTAL: &str = "xronos_optimistic_retries_total";

/// Histogram: group resolution latency in seconds. Labels: query.
pub const RESOLUTION_DURATION_SECONDS: &str = "xronos_resolution_duration_seconds";

// ── Persistence ─────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "xronos_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "xronos_wal_flush_batch_size";

/// Counter: WAL compactions run.
pub const WAL_COMPACTIONS_TOTAL: &str = "xronos_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
