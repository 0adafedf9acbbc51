use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total wire requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotbook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotbook_request_duration_seconds";

// ── Booking core ────────────────────────────────────────────────

/// Counter: reserve attempts. Labels: outcome (`reserved`, `conflict`, `not_found`).
pub const SLOT_RESERVATIONS_TOTAL: &str = "slotbook_slot_reservations_total";

/// Counter: compensating actions taken after a partial failure. Labels: op, step.
pub const COMPENSATIONS_TOTAL: &str = "slotbook_compensations_total";

/// Counter: best-effort releases that failed on cancel.
pub const RELEASE_FAILURES_TOTAL: &str = "slotbook_release_failures_total";

/// Counter: reservation index repairs made by reconciliation. Labels: kind (`reclaimed`, `restored`, `conflict`).
pub const RECONCILE_REPAIRS_TOTAL: &str = "slotbook_reconcile_repairs_total";

/// Gauge: days currently materialized in the availability store.
pub const GENERATED_DAYS: &str = "slotbook_generated_days";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::ListSlots { .. } => "list_slots",
        Request::Schedule(_) => "schedule",
        Request::Cancel { .. } => "cancel",
        Request::Reschedule(_) => "reschedule",
        Request::GetMeeting { .. } => "get_meeting",
        Request::MeetingsForCar { .. } => "meetings_for_car",
        Request::MeetingsForOwner { .. } => "meetings_for_owner",
    }
}
