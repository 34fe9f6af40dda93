use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "roomgate_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "roomgate_request_duration_seconds";

// ── Engine outcomes ─────────────────────────────────────────────

/// Counter: reservations created. Labels: status (initial state).
pub const RESERVATIONS_CREATED_TOTAL: &str = "roomgate_reservations_created_total";

/// Counter: committed transitions. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "roomgate_transitions_total";

/// Counter: operations refused by the conflict detector.
pub const CONFLICTS_TOTAL: &str = "roomgate_conflicts_total";

/// Counter: operations refused by the approval router.
pub const AUTHORIZATION_FAILURES_TOTAL: &str = "roomgate_authorization_failures_total";

/// Counter: batch days. Labels: outcome (created/failed).
pub const BATCH_DAYS_TOTAL: &str = "roomgate_batch_days_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "roomgate_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomgate_connections_total";

/// Counter: connections refused at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomgate_connections_rejected_total";

/// Counter: failed hello handshakes.
pub const AUTH_FAILURES_TOTAL: &str = "roomgate_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomgate_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomgate_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `None`.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short request label for metrics.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::Hello { .. } => "hello",
        Request::RegisterActor { .. } => "register_actor",
        Request::DeactivateActor { .. } => "deactivate_actor",
        Request::RegisterResource { .. } => "register_resource",
        Request::UpdateResource { .. } => "update_resource",
        Request::SetResourceStatus { .. } => "set_resource_status",
        Request::ListResources => "list_resources",
        Request::CreateReservation { .. } => "create_reservation",
        Request::Transition { .. } => "transition",
        Request::BatchCreate { .. } => "batch_create",
        Request::GetReservation { .. } => "get_reservation",
        Request::ListBlocking { .. } => "list_blocking",
        Request::ListDay { .. } => "list_day",
        Request::ListMine { .. } => "list_mine",
        Request::ApprovalQueue { .. } => "approval_queue",
        Request::Subscribe { .. } => "subscribe",
    }
}
