use crate::engine::EngineError;
use crate::limits::*;

/// The `days x slots` matrix a schedule allocates. Cell `(day, slot)` lives
/// at bitmap index `day * slots + slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    days: u32,
    slots: u32,
}

impl Grid {
    /// Resolve a schedule's configured dimensions. Absent values take
    /// `DEFAULT_DAYS` / `DEFAULT_SLOTS`; zero, negative or oversized values
    /// are a configuration error.
    pub fn resolve(days: Option<i64>, slots: Option<i64>) -> Result<Grid, EngineError> {
        let days = days.unwrap_or(DEFAULT_DAYS);
        let slots = slots.unwrap_or(DEFAULT_SLOTS);
        if days <= 0 || slots <= 0 {
            return Err(EngineError::Configuration(format!(
                "grid dimensions must be positive, got {days} days x {slots} slots"
            )));
        }
        let cells = days.checked_mul(slots).filter(|c| *c as u128 <= MAX_GRID_CELLS as u128);
        if cells.is_none() {
            return Err(EngineError::Configuration(format!(
                "grid {days} x {slots} exceeds {MAX_GRID_CELLS} cells"
            )));
        }
        Ok(Grid {
            days: days as u32,
            slots: slots as u32,
        })
    }

    pub fn days(&self) -> u32 {
        self.days
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    pub fn size(&self) -> usize {
        self.days as usize * self.slots as usize
    }

    pub fn contains(&self, day: u32, slot: u32) -> bool {
        day < self.days && slot < self.slots
    }

    /// Physical bitmap index of a cell, `None` outside the grid.
    pub fn index(&self, day: u32, slot: u32) -> Option<usize> {
        self.contains(day, slot)
            .then(|| day as usize * self.slots as usize + slot as usize)
    }

    /// Inverse of [`Grid::index`].
    pub fn coords(&self, idx: usize) -> (u32, u32) {
        let slots = self.slots as usize;
        ((idx / slots) as u32, (idx % slots) as u32)
    }

    /// Bitmap index for a generator-supplied 1-based global slot index.
    pub fn override_index(&self, one_based: u32) -> Option<usize> {
        let idx = (one_based as usize).checked_sub(1)?;
        (idx < self.size()).then_some(idx)
    }

    /// Bitmap index an entry at `(day, slot)` occupies: the override when it
    /// is in range, the physical cell otherwise. `None` outside the grid.
    pub fn effective_index(&self, day: u32, slot: u32, slot_index: Option<u32>) -> Option<usize> {
        let physical = self.index(day, slot)?;
        Some(slot_index.and_then(|i| self.override_index(i)).unwrap_or(physical))
    }

    pub fn cells(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (0..self.days).flat_map(move |d| (0..self.slots).map(move |s| (d, s)))
    }
}
