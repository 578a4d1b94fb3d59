use std::collections::HashSet;

use ulid::Ulid;

use crate::allocation::Allocation;
use crate::grid::Grid;
use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Flatten a validated allocation into one entry per occupied cell.
///
/// Cells outside `grid`, cells whose override index falls outside
/// `1..=grid.size()`, and a second cell at the same `(section, day, slot)` are
/// skipped. None of them produce an entry or touch a bitmap.
pub fn materialize(
    schedule_id: Ulid,
    grid: Grid,
    allocation: &Allocation,
) -> Result<Vec<ScheduleEntry>, EngineError> {
    let mut entries = Vec::with_capacity(allocation.occupied_cells());
    let mut seen: HashSet<(&str, u32, u32)> = HashSet::new();

    for section in &allocation.sections {
        for (day, cells) in section.days.iter().enumerate() {
            for (slot, cell) in cells.iter().enumerate() {
                let Some(cell) = cell else { continue };
                let (day, slot) = (day as u32, slot as u32);
                if !grid.contains(day, slot) {
                    tracing::debug!(
                        "skipping cell {} day {day} slot {slot} outside the {}x{} grid",
                        section.section_id,
                        grid.days(),
                        grid.slots()
                    );
                    continue;
                }
                if let Some(index) = cell.index
                    && grid.override_index(index).is_none()
                {
                    tracing::debug!(
                        "skipping cell {} day {day} slot {slot}: index {index} outside 1..={}",
                        section.section_id,
                        grid.size()
                    );
                    continue;
                }
                if !seen.insert((section.section_id.as_str(), day, slot)) {
                    tracing::debug!(
                        "skipping duplicate cell {} day {day} slot {slot}",
                        section.section_id
                    );
                    continue;
                }
                if entries.len() >= MAX_ENTRIES_PER_COMMIT {
                    return Err(EngineError::LimitExceeded("too many entries in allocation"));
                }
                entries.push(ScheduleEntry {
                    id: Ulid::new(),
                    schedule_id,
                    section_id: section.section_id.clone(),
                    course_id: cell.course_id.clone(),
                    faculty_ids: cell.faculty_ids.clone(),
                    room_ids: cell.room_ids.clone(),
                    day,
                    slot,
                    duration: 1,
                    kind: cell.kind,
                    slot_index: cell.index,
                });
            }
        }
    }

    Ok(entries)
}
