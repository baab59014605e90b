use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "convoy_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "convoy_query_duration_seconds";

// ── Reservations ────────────────────────────────────────────────

/// Counter: committed reservation writes. Labels: op.
pub const RESERVATIONS_COMMITTED_TOTAL: &str = "convoy_reservations_committed_total";

/// Counter: writes rejected because the vehicle was taken.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "convoy_reservation_conflicts_total";

/// Counter: confirmed trips moved to completed by the sweep.
pub const TRIPS_COMPLETED_TOTAL: &str = "convoy_trips_completed_total";

// ── Mailer ──────────────────────────────────────────────────────

/// Counter: scheduled mailing jobs that ran their dispatch. Labels: outcome.
pub const MAILINGS_FIRED_TOTAL: &str = "convoy_mailings_fired_total";

/// Counter: batches handed to the transport (first attempts only).
pub const BATCHES_SENT_TOTAL: &str = "convoy_batches_sent_total";

/// Counter: per-address delivery results. Labels: result.
pub const DELIVERIES_TOTAL: &str = "convoy_deliveries_total";

/// Counter: batch re-sends after a transient failure.
pub const DELIVERY_RETRIES_TOTAL: &str = "convoy_delivery_retries_total";

/// Counter: recipient lookups. Labels: source (cache, store).
pub const RECIPIENT_LOOKUPS_TOTAL: &str = "convoy_recipient_lookups_total";

/// Counter: reminder emails delivered.
pub const REMINDERS_SENT_TOTAL: &str = "convoy_reminders_sent_total";

/// Counter: reminder deliveries that failed and were released for the next scan.
pub const REMINDER_FAILURES_TOTAL: &str = "convoy_reminder_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "convoy_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "convoy_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "convoy_connections_rejected_total";

/// Gauge: mailing jobs currently armed.
pub const JOBS_ARMED: &str = "convoy_jobs_armed";

/// Gauge: audiences held in the recipient cache.
pub const RECIPIENT_CACHE_ENTRIES: &str = "convoy_recipient_cache_entries";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "convoy_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "convoy_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectAvailableResources { .. } => "select_available_resources",
        Command::InsertMailing { .. } => "insert_mailing",
        Command::UpdateMailing { .. } => "update_mailing",
        Command::DeleteMailing { .. } => "delete_mailing",
        Command::SelectMailings { .. } => "select_mailings",
        Command::InsertSubscription { .. } => "insert_subscription",
    }
}
