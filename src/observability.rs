use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "gridlock_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "gridlock_query_duration_seconds";

// ── Timetable pipelines ─────────────────────────────────────────

/// Counter: commit pipeline runs. Labels: status (ok, rejected, failed).
pub const TIMETABLE_COMMITS_TOTAL: &str = "gridlock_timetable_commits_total";

/// Histogram: commit pipeline duration in seconds, validation through apply.
pub const TIMETABLE_COMMIT_DURATION_SECONDS: &str = "gridlock_timetable_commit_duration_seconds";

/// Counter: revert pipeline runs that removed entries.
pub const TIMETABLE_REVERTS_TOTAL: &str = "gridlock_timetable_reverts_total";

/// Counter: schedule entries created by commits.
pub const ENTRIES_COMMITTED_TOTAL: &str = "gridlock_entries_committed_total";

/// Counter: availability bitmaps rewritten. Labels: kind (faculty, room).
pub const BITMAP_WRITES_TOTAL: &str = "gridlock_bitmap_writes_total";

// ── Resource utilization ────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "gridlock_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "gridlock_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "gridlock_connections_rejected_total";

/// Gauge: number of loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "gridlock_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "gridlock_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "gridlock_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSchedule { .. } => "insert_schedule",
        Command::DeleteSchedule { .. } => "delete_schedule",
        Command::InsertResource { .. } => "insert_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::CommitTimetable { .. } => "commit_timetable",
        Command::RevertTimetable { .. } => "revert_timetable",
        Command::SelectSchedules => "select_schedules",
        Command::SelectResources { .. } => "select_resources",
        Command::SelectTimetableEntries { .. } => "select_timetable_entries",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectGenerationRequest { .. } => "select_generation_request",
    }
}
