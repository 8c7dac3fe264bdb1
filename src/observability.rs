use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: method, route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "bookd_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: method, route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "bookd_http_request_duration_seconds";

/// Counter: engine operations. Labels: op, outcome (`ok` or an error code).
pub const ENGINE_OPS_TOTAL: &str = "bookd_engine_ops_total";

/// Histogram: engine operation latency in seconds. Labels: op.
pub const ENGINE_OP_DURATION_SECONDS: &str = "bookd_engine_op_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookd_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "bookd_wal_compactions_total";

// ── Notifications ───────────────────────────────────────────────

/// Counter: notifications accepted by the mail transport.
pub const NOTIFICATIONS_DELIVERED_TOTAL: &str = "bookd_notifications_delivered_total";

/// Counter: individual failed delivery attempts.
pub const NOTIFICATION_DELIVERY_FAILURES_TOTAL: &str = "bookd_notification_delivery_failures_total";

/// Counter: notifications given up on.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "bookd_notifications_dropped_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    }
}

pub fn record_engine_op<T>(op: &'static str, started: Instant, result: &Result<T, EngineError>) {
    metrics::counter!(ENGINE_OPS_TOTAL, "op" => op, "outcome" => outcome_label(result))
        .increment(1);
    metrics::histogram!(ENGINE_OP_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
