use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use crate::grid::Grid;
use crate::model::*;

use super::LockedResources;

/// Accumulates bitmap mutations for one commit or revert.
///
/// Every faculty member and room touched gets exactly one working copy, no
/// matter how many entries reference it; [`BitmapPlan::into_writes`] then
/// yields one absolute write per bitmap that actually changed.
pub(super) struct BitmapPlan {
    grid: Grid,
    working: BTreeMap<ResourceKey, Availability>,
}

/// Faculty/room keys referenced by `entries`, deduplicated and in lock order.
pub(super) fn referenced_keys<'a>(
    entries: impl IntoIterator<Item = &'a ScheduleEntry>,
) -> BTreeSet<ResourceKey> {
    entries
        .into_iter()
        .flat_map(|e| e.resource_keys())
        .collect()
}

impl BitmapPlan {
    pub(super) fn new(grid: Grid) -> Self {
        Self {
            grid,
            working: BTreeMap::new(),
        }
    }

    /// Release the cell every entry claimed, and the schedule's snapshot
    /// claims. Bitmaps whose stored length differs from the grid were
    /// written by another grid and hold nothing of ours, so they are left
    /// alone.
    pub(super) fn revert(
        &mut self,
        entries: &[ScheduleEntry],
        snapshot_claims: &[SnapshotClaim],
        locked: &LockedResources,
    ) {
        for entry in entries {
            let Some(idx) = self.grid.effective_index(entry.day, entry.slot, entry.slot_index)
            else {
                continue;
            };
            for key in entry.resource_keys() {
                if let Some(working) = self.current_copy(key, locked) {
                    working.release(idx);
                }
            }
        }
        let size = self.grid.size();
        for claim in snapshot_claims {
            let Some(working) = self.current_copy(claim.key, locked) else {
                continue;
            };
            for &idx in &claim.cells {
                if (idx as usize) < size {
                    working.release(idx as usize);
                }
            }
        }
    }

    /// Mark every entry's cell occupied and claimed. The cell is the
    /// generator's override index when present, the physical cell otherwise.
    pub(super) fn apply(&mut self, entries: &[ScheduleEntry], locked: &LockedResources) {
        for entry in entries {
            let Some(idx) = self.grid.effective_index(entry.day, entry.slot, entry.slot_index)
            else {
                continue;
            };
            for key in entry.resource_keys() {
                let working = self.working_copy(key, locked);
                working.set(idx);
                working.claim(idx);
            }
        }
    }

    /// Replace bits wholesale with the generator's authoritative snapshot.
    /// Each bitmap must already be `grid.size()` long. Occupied cells that
    /// nothing claims after `apply` get one claim held by this commit; those
    /// cells are returned so the revert can release them.
    pub(super) fn overlay(
        &mut self,
        snapshot: &[(ResourceKey, Vec<u8>)],
        locked: &LockedResources,
    ) -> Vec<SnapshotClaim> {
        let mut claims = Vec::new();
        for (key, bits) in snapshot {
            let working = self.working_copy(*key, locked);
            working.replace_bits(bits);
            let cells: Vec<u32> = working
                .ones()
                .filter(|idx| working.claims_at(*idx) == 0)
                .map(|idx| idx as u32)
                .collect();
            for &idx in &cells {
                working.claim(idx as usize);
            }
            if !cells.is_empty() {
                claims.push(SnapshotClaim { key: *key, cells });
            }
        }
        claims
    }

    /// Working copy for a release: `None` when the stored bitmap is absent
    /// or was written under another grid.
    fn current_copy(&mut self, key: ResourceKey, locked: &LockedResources) -> Option<&mut Availability> {
        let size = self.grid.size();
        match self.working.entry(key) {
            Entry::Occupied(o) => Some(o.into_mut()),
            Entry::Vacant(v) => match stored(locked, &key) {
                Some(a) if a.len() == size => Some(v.insert(a.clone())),
                _ => None,
            },
        }
    }

    fn working_copy(&mut self, key: ResourceKey, locked: &LockedResources) -> &mut Availability {
        let size = self.grid.size();
        self.working
            .entry(key)
            .or_insert_with(|| Availability::fitted(stored(locked, &key), size))
    }

    pub(super) fn into_writes(self, locked: &LockedResources) -> Vec<AvailabilityWrite> {
        self.working
            .into_iter()
            .filter(|(key, a)| stored(locked, key) != Some(a))
            .map(|(key, availability)| AvailabilityWrite { key, availability })
            .collect()
    }
}

fn stored<'a>(locked: &'a LockedResources, key: &ResourceKey) -> Option<&'a Availability> {
    locked.get(key).and_then(|rs| rs.availability.as_ref())
}
