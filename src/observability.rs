use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "spabook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "spabook_query_duration_seconds";

/// Counter: appointment creation attempts. Labels: outcome (created, conflict, rejected).
pub const BOOKINGS_TOTAL: &str = "spabook_bookings_total";

/// Counter: proposals the conflict guard turned away.
pub const SLOT_CONFLICTS_TOTAL: &str = "spabook_slot_conflicts_total";

/// Counter: commands refused for the connection's role.
pub const PERMISSION_DENIED_TOTAL: &str = "spabook_permission_denied_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "spabook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "spabook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "spabook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "spabook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "spabook_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "spabook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertService(_) => "insert_service",
        Command::UpdateService { .. } => "update_service",
        Command::MoveService { .. } => "move_service",
        Command::DeleteService { .. } => "delete_service",
        Command::SelectServices { .. } => "select_services",
        Command::InsertWeekly { .. } => "insert_weekly",
        Command::UpdateWeekly { .. } => "update_weekly",
        Command::DeleteWeekly { .. } => "delete_weekly",
        Command::SelectWeekly { .. } => "select_weekly",
        Command::InsertBlockedDate { .. } => "insert_blocked_date",
        Command::DeleteBlockedDate { .. } => "delete_blocked_date",
        Command::SelectBlockedDates => "select_blocked_dates",
        Command::InsertClient { .. } => "insert_client",
        Command::UpdateClient { .. } => "update_client",
        Command::DeleteClient { .. } => "delete_client",
        Command::SelectClients => "select_clients",
        Command::InsertAppointment(_) => "insert_appointment",
        Command::UpdateAppointment { .. } => "update_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::SelectAppointments(_) => "select_appointments",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectStats => "select_stats",
    }
}
