use std::collections::BTreeMap;

use serde::Serialize;
use ulid::Ulid;

use crate::grid::Grid;
use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, SharedResource};

/// Request body for the external generation service: the grid, every
/// requested faculty member and room with its bitmap fitted to the grid,
/// and the schedule's committed entries as a partial allocation in the same
/// `timetables` shape the service answers with.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub schedule_id: Ulid,
    pub days: u32,
    pub slots: u32,
    pub faculty: Vec<ResourceSnapshot>,
    pub rooms: Vec<ResourceSnapshot>,
    pub timetables: BTreeMap<String, SectionGrid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub id: Ulid,
    pub name: Option<String>,
    pub availability: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionGrid {
    pub section_name: String,
    pub days: Vec<Vec<Option<SnapshotCell>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotCell {
    pub courseid: String,
    pub facultyid: Vec<Ulid>,
    pub roomid: Vec<Ulid>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

impl GenerationRequest {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Engine {
    pub async fn list_schedules(&self) -> Vec<ScheduleInfo> {
        let schedules: Vec<_> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(schedules.len());
        for schedule in schedules {
            let guard = schedule.read().await;
            if guard.deleted {
                continue;
            }
            out.push(ScheduleInfo {
                id: guard.id,
                name: guard.name.clone(),
                days: guard.days,
                slots: guard.slots,
                entry_count: guard.entries.len(),
            });
        }
        out.sort_by_key(|s| s.id);
        out
    }

    pub async fn list_resources(&self, kind: ResourceKind) -> Vec<ResourceInfo> {
        let resources: Vec<_> = self.resources(kind).iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(resources.len());
        for rs in resources {
            let guard = rs.read().await;
            if guard.deleted {
                continue;
            }
            out.push(ResourceInfo {
                key: guard.key,
                name: guard.name.clone(),
                availability: guard
                    .availability
                    .as_ref()
                    .map(|a| a.bits().to_vec())
                    .unwrap_or_default(),
            });
        }
        out.sort_by_key(|r| r.key.id);
        out
    }

    /// Whether `(day, slot)` of `schedule_id`'s grid is free for a faculty
    /// member or room. A missing or stale bitmap reads as free.
    pub async fn is_free(
        &self,
        key: ResourceKey,
        schedule_id: Ulid,
        day: u32,
        slot: u32,
    ) -> Result<bool, EngineError> {
        let grid = self.schedule_grid(schedule_id).await?;
        let idx = grid.index(day, slot).ok_or_else(|| {
            EngineError::InvalidAllocation(format!(
                "day {day} slot {slot} is outside the {}x{} grid",
                grid.days(),
                grid.slots()
            ))
        })?;
        let rs = self.live_resource(&key)?;
        let guard = rs.read().await;
        Ok(match &guard.availability {
            Some(a) if a.len() == grid.size() => !a.is_set(idx),
            _ => true,
        })
    }

    /// Every cell of `schedule_id`'s grid with its free/occupied state for
    /// one faculty member or room, in index order.
    pub async fn slot_availability(
        &self,
        key: ResourceKey,
        schedule_id: Ulid,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        let grid = self.schedule_grid(schedule_id).await?;
        let rs = self.live_resource(&key)?;
        let fitted = {
            let guard = rs.read().await;
            Availability::fitted(guard.availability.as_ref(), grid.size())
        };
        Ok(grid
            .cells()
            .enumerate()
            .map(|(idx, (day, slot))| SlotAvailability {
                day,
                slot,
                free: !fitted.is_set(idx),
            })
            .collect())
    }

    /// Build the generation-service request for `schedule_id`. `None` for a
    /// filter means every faculty member (or room) of the tenant.
    pub async fn generation_request(
        &self,
        schedule_id: Ulid,
        faculty_ids: Option<Vec<Ulid>>,
        room_ids: Option<Vec<Ulid>>,
    ) -> Result<GenerationRequest, EngineError> {
        for ids in [&faculty_ids, &room_ids].into_iter().flatten() {
            if ids.len() > MAX_IN_CLAUSE_IDS {
                return Err(EngineError::LimitExceeded("too many ids in generation request"));
            }
        }
        let schedule = self
            .get_schedule(&schedule_id)
            .ok_or(EngineError::NotFound(schedule_id))?;
        let sched = schedule.read().await;
        if sched.deleted {
            return Err(EngineError::NotFound(schedule_id));
        }
        let grid = Grid::resolve(sched.days, sched.slots)?;

        let faculty = self
            .resource_snapshots(ResourceKind::Faculty, faculty_ids, grid)
            .await?;
        let rooms = self.resource_snapshots(ResourceKind::Room, room_ids, grid).await?;

        let mut timetables: BTreeMap<String, SectionGrid> = BTreeMap::new();
        for entry in &sched.entries {
            let section = timetables
                .entry(entry.section_id.clone())
                .or_insert_with(|| SectionGrid {
                    section_name: entry.section_id.clone(),
                    days: vec![vec![None; grid.slots() as usize]; grid.days() as usize],
                });
            if let Some(cell) = section
                .days
                .get_mut(entry.day as usize)
                .and_then(|d| d.get_mut(entry.slot as usize))
            {
                *cell = Some(SnapshotCell {
                    courseid: entry.course_id.clone(),
                    facultyid: entry.faculty_ids.clone(),
                    roomid: entry.room_ids.clone(),
                    kind: entry.kind.label(),
                    index: entry.slot_index,
                });
            }
        }

        Ok(GenerationRequest {
            schedule_id,
            days: grid.days(),
            slots: grid.slots(),
            faculty,
            rooms,
            timetables,
        })
    }

    async fn resource_snapshots(
        &self,
        kind: ResourceKind,
        ids: Option<Vec<Ulid>>,
        grid: Grid,
    ) -> Result<Vec<ResourceSnapshot>, EngineError> {
        let resources: Vec<SharedResource> = match ids {
            Some(mut ids) => {
                ids.sort();
                ids.dedup();
                ids.into_iter()
                    .map(|id| self.live_resource(&ResourceKey { kind, id }))
                    .collect::<Result<_, _>>()?
            }
            None => {
                let mut all: Vec<_> = self
                    .resources(kind)
                    .iter()
                    .map(|e| (*e.key(), e.value().clone()))
                    .collect();
                all.sort_by_key(|(id, _)| *id);
                all.into_iter().map(|(_, rs)| rs).collect()
            }
        };

        let mut out = Vec::with_capacity(resources.len());
        for rs in resources {
            let guard = rs.read().await;
            if guard.deleted {
                continue;
            }
            let fitted = Availability::fitted(guard.availability.as_ref(), grid.size());
            out.push(ResourceSnapshot {
                id: guard.key.id,
                name: guard.name.clone(),
                availability: fitted.bits().to_vec(),
            });
        }
        Ok(out)
    }

    async fn schedule_grid(&self, schedule_id: Ulid) -> Result<Grid, EngineError> {
        let schedule = self
            .get_schedule(&schedule_id)
            .ok_or(EngineError::NotFound(schedule_id))?;
        let guard = schedule.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(schedule_id));
        }
        Grid::resolve(guard.days, guard.slots)
    }

    fn live_resource(&self, key: &ResourceKey) -> Result<SharedResource, EngineError> {
        self.get_resource(key).ok_or(EngineError::NotFound(key.id))
    }
}
