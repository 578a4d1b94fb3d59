use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Which availability-carrying entity a bitmap belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Faculty,
    Room,
}

impl ResourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Faculty => "faculty",
            ResourceKind::Room => "room",
        }
    }
}

/// Identity of a faculty member or room. Ordering is the lock order:
/// all faculty before all rooms, each ascending by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub id: Ulid,
}

impl ResourceKey {
    pub fn faculty(id: Ulid) -> Self {
        Self { kind: ResourceKind::Faculty, id }
    }

    pub fn room(id: Ulid) -> Self {
        Self { kind: ResourceKind::Room, id }
    }
}

/// Occupancy bitmap for one faculty member or room, one cell per
/// `(day, slot)` of the grid that last wrote it.
///
/// `bits[i]` is 1 when the cell is occupied. `claims[i]` counts what holds
/// the cell: live entries whose effective cell is `i`, plus snapshot claims
/// (see [`SnapshotClaim`]). A release only frees a cell once its claim count
/// drops to zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    bits: Vec<u8>,
    claims: Vec<u32>,
}

impl Availability {
    pub fn zeroed(len: usize) -> Self {
        Self {
            bits: vec![0; len],
            claims: vec![0; len],
        }
    }

    /// Start from `current` if it matches `len`, otherwise from an all-zero
    /// bitmap. A length mismatch means the bitmap was written under a
    /// different grid and is stale.
    pub fn fitted(current: Option<&Availability>, len: usize) -> Self {
        match current {
            Some(a) if a.len() == len => a.clone(),
            _ => Self::zeroed(len),
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    pub fn is_set(&self, idx: usize) -> bool {
        self.bits.get(idx).is_some_and(|b| *b != 0)
    }

    pub fn claims_at(&self, idx: usize) -> u32 {
        self.claims.get(idx).copied().unwrap_or(0)
    }

    pub fn set(&mut self, idx: usize) {
        self.bits[idx] = 1;
    }

    pub fn claim(&mut self, idx: usize) {
        self.claims[idx] = self.claims[idx].saturating_add(1);
    }

    /// Drop one claim on `idx` and free the cell once nothing claims it.
    pub fn release(&mut self, idx: usize) {
        self.claims[idx] = self.claims[idx].saturating_sub(1);
        if self.claims[idx] == 0 {
            self.bits[idx] = 0;
        }
    }

    /// Overwrite the bits wholesale, keeping claim counts. Any non-zero
    /// input value counts as occupied.
    pub fn replace_bits(&mut self, bits: &[u8]) {
        debug_assert_eq!(bits.len(), self.bits.len());
        for (dst, src) in self.bits.iter_mut().zip(bits) {
            *dst = u8::from(*src != 0);
        }
    }

    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, b)| **b != 0)
            .map(|(i, _)| i)
    }
}

/// Session type of an occupied cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    Theory,
    Practical,
}

impl SessionKind {
    pub fn label(&self) -> &'static str {
        match self {
            SessionKind::Theory => "theory",
            SessionKind::Practical => "practical",
        }
    }
}

/// One occupied cell of a committed timetable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: Ulid,
    pub schedule_id: Ulid,
    pub section_id: String,
    pub course_id: String,
    pub faculty_ids: Vec<Ulid>,
    pub room_ids: Vec<Ulid>,
    pub day: u32,
    pub slot: u32,
    /// Cells spanned, at least 1.
    pub duration: u32,
    pub kind: SessionKind,
    /// Generator-supplied 1-based global slot index, if any.
    pub slot_index: Option<u32>,
}

impl ScheduleEntry {
    pub fn resource_keys(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        self.faculty_ids
            .iter()
            .map(|id| ResourceKey::faculty(*id))
            .chain(self.room_ids.iter().map(|id| ResourceKey::room(*id)))
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Raw configuration; `None` falls back to the grid defaults.
    pub days: Option<i64>,
    pub slots: Option<i64>,
    pub entries: Vec<ScheduleEntry>,
    /// Cells this schedule's last commit occupied through an
    /// `updatedAvailability` snapshot rather than through an entry.
    pub snapshot_claims: Vec<SnapshotClaim>,
    /// Set under the write lock on delete so waiters holding a stale Arc bail out.
    pub deleted: bool,
}

impl ScheduleState {
    pub fn new(id: Ulid, name: Option<String>, days: Option<i64>, slots: Option<i64>) -> Self {
        Self {
            id,
            name,
            days,
            slots,
            entries: Vec::new(),
            snapshot_claims: Vec::new(),
            deleted: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub key: ResourceKey,
    pub name: Option<String>,
    /// `None` until the first commit touches this resource.
    pub availability: Option<Availability>,
    pub deleted: bool,
}

impl ResourceState {
    pub fn new(key: ResourceKey, name: Option<String>, availability: Option<Availability>) -> Self {
        Self {
            key,
            name,
            availability,
            deleted: false,
        }
    }
}

/// Absolute post-state of one bitmap, as carried in a WAL record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWrite {
    pub key: ResourceKey,
    pub availability: Availability,
}

/// Cells of one bitmap that a commit's snapshot set without any entry
/// justifying them. The committing schedule holds one claim on each, and
/// releases it on revert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotClaim {
    pub key: ResourceKey,
    pub cells: Vec<u32>,
}

/// The event types. This is the WAL record format; one timetable commit or
/// revert is exactly one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ScheduleCreated {
        id: Ulid,
        name: Option<String>,
        days: Option<i64>,
        slots: Option<i64>,
    },
    ScheduleDeleted {
        id: Ulid,
    },
    ResourceCreated {
        key: ResourceKey,
        name: Option<String>,
        availability: Option<Availability>,
    },
    ResourceDeleted {
        key: ResourceKey,
    },
    /// Replaces the schedule's entry set and snapshot claims, and writes
    /// the touched bitmaps.
    TimetableCommitted {
        schedule_id: Ulid,
        entries: Vec<ScheduleEntry>,
        snapshot_claims: Vec<SnapshotClaim>,
        writes: Vec<AvailabilityWrite>,
    },
    TimetableReverted {
        schedule_id: Ulid,
        writes: Vec<AvailabilityWrite>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub days: Option<i64>,
    pub slots: Option<i64>,
    pub entry_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub key: ResourceKey,
    pub name: Option<String>,
    /// Stored bits, empty when nothing has been written yet.
    pub availability: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAvailability {
    pub day: u32,
    pub slot: u32,
    pub free: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub created: usize,
    /// Entries removed by the revert phase.
    pub replaced: usize,
    pub sections: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevertSummary {
    pub deleted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fitted_discards_stale_length() {
        let mut stale = Availability::zeroed(24);
        stale.set(3);
        let fitted = Availability::fitted(Some(&stale), 40);
        assert_eq!(fitted.len(), 40);
        assert_eq!(fitted.ones().count(), 0);

        let kept = Availability::fitted(Some(&stale), 24);
        assert!(kept.is_set(3));
    }

    #[test]
    fn release_frees_only_unclaimed_cells() {
        let mut a = Availability::zeroed(8);
        a.set(2);
        a.claim(2);
        a.claim(2);
        a.release(2);
        assert!(a.is_set(2));
        assert_eq!(a.claims_at(2), 1);
        a.release(2);
        assert!(!a.is_set(2));
    }

    #[test]
    fn release_without_claim_clears() {
        let mut a = Availability::zeroed(4);
        a.set(1);
        a.release(1);
        assert!(!a.is_set(1));
        assert_eq!(a.claims_at(1), 0);
    }

    #[test]
    fn replace_bits_normalizes_values() {
        let mut a = Availability::zeroed(4);
        a.claim(0);
        a.replace_bits(&[0, 7, 1, 0]);
        assert_eq!(a.bits(), &[0, 1, 1, 0]);
        assert_eq!(a.claims_at(0), 1);
    }

    #[test]
    fn resource_key_order_puts_faculty_first() {
        let low = Ulid::from_parts(1, 0);
        let high = Ulid::from_parts(2, 0);
        let mut keys = vec![
            ResourceKey::room(low),
            ResourceKey::faculty(high),
            ResourceKey::faculty(low),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                ResourceKey::faculty(low),
                ResourceKey::faculty(high),
                ResourceKey::room(low),
            ]
        );
    }

    #[test]
    fn entry_resource_keys_cover_faculty_and_rooms() {
        let f = Ulid::new();
        let r = Ulid::new();
        let entry = ScheduleEntry {
            id: Ulid::new(),
            schedule_id: Ulid::new(),
            section_id: "S1".into(),
            course_id: "C1".into(),
            faculty_ids: vec![f],
            room_ids: vec![r],
            day: 0,
            slot: 2,
            duration: 1,
            kind: SessionKind::Theory,
            slot_index: None,
        };
        let keys: Vec<_> = entry.resource_keys().collect();
        assert_eq!(keys, vec![ResourceKey::faculty(f), ResourceKey::room(r)]);
    }
}
