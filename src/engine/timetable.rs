use std::time::Instant;

use tracing::{info, warn};
use ulid::Ulid;

use crate::allocation::{self, AvailabilitySnapshot};
use crate::grid::Grid;
use crate::model::*;
use crate::observability::*;

use super::bitmap::{BitmapPlan, referenced_keys};
use super::materialize::materialize;
use super::{Engine, EngineError, Timetable, apply_timetable};

impl Engine {
    /// Replace a schedule's committed timetable with the generation
    /// service's output `raw`.
    ///
    /// The raw output is decoded and validated before any lock is taken, so
    /// a malformed allocation never disturbs the existing entries. The revert
    /// of the previous entries, the new entry set and every resulting bitmap
    /// write go to the WAL as one record; in-memory state changes only once
    /// that record is durable.
    pub async fn commit_timetable(
        &self,
        schedule_id: Ulid,
        raw: &str,
    ) -> Result<CommitSummary, EngineError> {
        let started = Instant::now();
        let result = self.commit_inner(schedule_id, raw).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_validation() => "rejected",
            Err(_) => "failed",
        };
        metrics::counter!(TIMETABLE_COMMITS_TOTAL, "status" => status).increment(1);
        metrics::histogram!(TIMETABLE_COMMIT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn commit_inner(&self, schedule_id: Ulid, raw: &str) -> Result<CommitSummary, EngineError> {
        let allocation = allocation::parse_allocation(raw).inspect_err(|e| {
            warn!("schedule {schedule_id}: rejected generation output: {e}");
        })?;

        let _gate = self.compaction.read().await;
        let schedule = self
            .get_schedule(&schedule_id)
            .ok_or(EngineError::NotFound(schedule_id))?;
        let mut sched = schedule.write_owned().await;
        if sched.deleted {
            return Err(EngineError::NotFound(schedule_id));
        }
        let grid = Grid::resolve(sched.days, sched.slots)?;
        let entries = materialize(schedule_id, grid, &allocation)?;
        let snapshot = snapshot_bitmaps(allocation.snapshot.as_ref(), grid)?;

        let mut keys = referenced_keys(&sched.entries);
        keys.extend(sched.snapshot_claims.iter().map(|c| c.key));
        keys.extend(referenced_keys(&entries));
        keys.extend(snapshot.iter().map(|(key, _)| *key));
        let mut locked = self.lock_resources(keys).await?;

        let mut plan = BitmapPlan::new(grid);
        plan.revert(&sched.entries, &sched.snapshot_claims, &locked);
        plan.apply(&entries, &locked);
        let snapshot_claims = plan.overlay(&snapshot, &locked);
        let writes = plan.into_writes(&locked);

        let mut sections: Vec<String> = Vec::new();
        for entry in &entries {
            if !sections.contains(&entry.section_id) {
                sections.push(entry.section_id.clone());
            }
        }
        let summary = CommitSummary {
            created: entries.len(),
            replaced: sched.entries.len(),
            sections,
        };

        self.wal_append(Event::TimetableCommitted {
            schedule_id,
            entries: entries.clone(),
            snapshot_claims: snapshot_claims.clone(),
            writes: writes.clone(),
        })
        .await?;
        record_bitmap_writes(&writes);
        let replacement = Timetable { entries, snapshot_claims };
        apply_timetable(&mut sched, replacement, &writes, &mut locked, &self.references);

        metrics::counter!(ENTRIES_COMMITTED_TOTAL).increment(summary.created as u64);
        info!(
            "schedule {schedule_id}: committed {} entries across {} sections (replaced {}, {} bitmaps written, {} resources locked)",
            summary.created,
            summary.sections.len(),
            summary.replaced,
            writes.len(),
            locked.len()
        );
        Ok(summary)
    }

    /// Clear a schedule's bitmap contributions (entries and snapshot claims)
    /// and delete its entries in one WAL record. A schedule holding nothing
    /// is a successful no-op.
    pub async fn revert_timetable(&self, schedule_id: Ulid) -> Result<RevertSummary, EngineError> {
        let _gate = self.compaction.read().await;
        let schedule = self
            .get_schedule(&schedule_id)
            .ok_or(EngineError::NotFound(schedule_id))?;
        let mut sched = schedule.write_owned().await;
        if sched.deleted {
            return Err(EngineError::NotFound(schedule_id));
        }
        if sched.entries.is_empty() && sched.snapshot_claims.is_empty() {
            return Ok(RevertSummary { deleted: 0 });
        }
        let grid = Grid::resolve(sched.days, sched.slots)?;

        let mut keys = referenced_keys(&sched.entries);
        keys.extend(sched.snapshot_claims.iter().map(|c| c.key));
        let mut locked = self.lock_resources(keys).await?;
        let mut plan = BitmapPlan::new(grid);
        plan.revert(&sched.entries, &sched.snapshot_claims, &locked);
        let writes = plan.into_writes(&locked);

        self.wal_append(Event::TimetableReverted {
            schedule_id,
            writes: writes.clone(),
        })
        .await?;
        let deleted = sched.entries.len();
        record_bitmap_writes(&writes);
        apply_timetable(&mut sched, Timetable::default(), &writes, &mut locked, &self.references);

        metrics::counter!(TIMETABLE_REVERTS_TOTAL).increment(1);
        info!(
            "schedule {schedule_id}: reverted {deleted} entries ({} bitmaps written)",
            writes.len()
        );
        Ok(RevertSummary { deleted })
    }

    /// Committed entries of a schedule, ordered by `(day, slot, section)`.
    pub async fn list_timetable_entries(
        &self,
        schedule_id: Ulid,
    ) -> Result<Vec<ScheduleEntry>, EngineError> {
        let schedule = self
            .get_schedule(&schedule_id)
            .ok_or(EngineError::NotFound(schedule_id))?;
        let sched = schedule.read().await;
        if sched.deleted {
            return Err(EngineError::NotFound(schedule_id));
        }
        let mut entries = sched.entries.clone();
        entries.sort_by(|a, b| {
            (a.day, a.slot, &a.section_id).cmp(&(b.day, b.slot, &b.section_id))
        });
        Ok(entries)
    }
}

/// Check the generator's authoritative bitmaps against the grid and key
/// them for locking. Any length other than `grid.size()` is rejected.
fn snapshot_bitmaps(
    snapshot: Option<&AvailabilitySnapshot>,
    grid: Grid,
) -> Result<Vec<(ResourceKey, Vec<u8>)>, EngineError> {
    let Some(snapshot) = snapshot else {
        return Ok(Vec::new());
    };
    let faculty = snapshot
        .faculty
        .iter()
        .map(|(id, bits)| (ResourceKey::faculty(*id), bits));
    let rooms = snapshot
        .rooms
        .iter()
        .map(|(id, bits)| (ResourceKey::room(*id), bits));
    faculty
        .chain(rooms)
        .map(|(key, bits)| {
            if bits.len() != grid.size() {
                return Err(EngineError::InvalidAllocation(format!(
                    "updatedAvailability for {} {} has {} cells, grid has {}",
                    key.kind.label(),
                    key.id,
                    bits.len(),
                    grid.size()
                )));
            }
            Ok((key, bits.clone()))
        })
        .collect()
}

fn record_bitmap_writes(writes: &[AvailabilityWrite]) {
    for write in writes {
        metrics::counter!(BITMAP_WRITES_TOTAL, "kind" => write.key.kind.label()).increment(1);
    }
}
