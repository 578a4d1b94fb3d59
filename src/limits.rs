// ── Grid defaults ────────────────────────────────────────────────

/// Day count used when a schedule was created without one.
pub const DEFAULT_DAYS: i64 = 5;
/// Slot-per-day count used when a schedule was created without one.
pub const DEFAULT_SLOTS: i64 = 8;

/// Upper bound on `days * slots` for any schedule grid.
pub const MAX_GRID_CELLS: usize = 2_048;

// ── Tenant limits ────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_SCHEDULES_PER_TENANT: usize = 10_000;
pub const MAX_FACULTY_PER_TENANT: usize = 100_000;
pub const MAX_ROOMS_PER_TENANT: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;

// ── Allocation limits ────────────────────────────────────────────

/// Raw generation-service payload size accepted by the validator.
pub const MAX_ALLOCATION_BYTES: usize = 8 * 1024 * 1024;
/// How many layers of string-encoded JSON the validator will peel.
pub const MAX_UNWRAP_DEPTH: usize = 4;
pub const MAX_ENTRIES_PER_COMMIT: usize = 50_000;
pub const MAX_SECTIONS_PER_COMMIT: usize = 5_000;
pub const MAX_ID_LEN: usize = 128;

/// Ids accepted in a single generation-request filter.
pub const MAX_IN_CLAUSE_IDS: usize = 1_000;

/// Largest single WAL record; a length prefix above this is treated as a torn write.
pub const MAX_WAL_RECORD_BYTES: usize = 256 * 1024 * 1024;
