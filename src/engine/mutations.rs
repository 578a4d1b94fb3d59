use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Register a schedule. Dimensions are stored as given; the grid
    /// resolver applies defaults and rejects bad values at commit time.
    pub async fn create_schedule(
        &self,
        id: Ulid,
        name: Option<String>,
        days: Option<i64>,
        slots: Option<i64>,
    ) -> Result<(), EngineError> {
        if self.schedules.len() >= MAX_SCHEDULES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many schedules"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("schedule name too long"));
        }
        let _gate = self.compaction.read().await;
        if self.schedules.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        self.wal_append(Event::ScheduleCreated { id, name: name.clone(), days, slots })
            .await?;
        let state = ScheduleState::new(id, name, days, slots);
        self.schedules.insert(id, Arc::new(RwLock::new(state)));
        tracing::debug!("schedule {id} created");
        Ok(())
    }

    /// Remove a schedule. Refused while it still holds committed entries or
    /// snapshot claims, since its grid is what those bitmap cells are
    /// indexed by.
    pub async fn delete_schedule(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compaction.read().await;
        let schedule = self.get_schedule(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = schedule.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        if !guard.entries.is_empty() || !guard.snapshot_claims.is_empty() {
            return Err(EngineError::InUse(id));
        }

        self.wal_append(Event::ScheduleDeleted { id }).await?;
        guard.deleted = true;
        self.schedules.remove(&id);
        tracing::debug!("schedule {id} deleted");
        Ok(())
    }

    /// Register a faculty member or room. No bitmap is stored until the
    /// first commit that references it.
    pub async fn create_resource(
        &self,
        kind: ResourceKind,
        id: Ulid,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        let map = self.resources(kind);
        let (limit, msg) = match kind {
            ResourceKind::Faculty => (MAX_FACULTY_PER_TENANT, "too many faculty"),
            ResourceKind::Room => (MAX_ROOMS_PER_TENANT, "too many rooms"),
        };
        if map.len() >= limit {
            return Err(EngineError::LimitExceeded(msg));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("name too long"));
        }
        let _gate = self.compaction.read().await;
        if map.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let key = ResourceKey { kind, id };
        self.wal_append(Event::ResourceCreated { key, name: name.clone(), availability: None })
            .await?;
        map.insert(id, Arc::new(RwLock::new(ResourceState::new(key, name, None))));
        tracing::debug!("{} {id} created", kind.label());
        Ok(())
    }

    /// Remove a faculty member or room. Refused while any live entry in any
    /// schedule references it.
    pub async fn delete_resource(&self, kind: ResourceKind, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compaction.read().await;
        let key = ResourceKey { kind, id };
        let rs = self.get_resource(&key).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        // Pipelines adjust the count while holding this write lock, so it
        // is stable for as long as we hold it too.
        if self.reference_count(&key) > 0 {
            return Err(EngineError::InUse(id));
        }

        self.wal_append(Event::ResourceDeleted { key }).await?;
        guard.deleted = true;
        self.resources(kind).remove(&id);
        tracing::debug!("{} {id} deleted", kind.label());
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state: every schedule, every resource with its stored bitmap, and one
    /// commit record per schedule that holds entries or snapshot claims.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction.write().await;
        let mut events = Vec::new();

        let schedules: Vec<_> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut timetables = Vec::new();
        for schedule in schedules {
            let guard = schedule.read().await;
            events.push(Event::ScheduleCreated {
                id: guard.id,
                name: guard.name.clone(),
                days: guard.days,
                slots: guard.slots,
            });
            if !guard.entries.is_empty() || !guard.snapshot_claims.is_empty() {
                timetables.push(Event::TimetableCommitted {
                    schedule_id: guard.id,
                    entries: guard.entries.clone(),
                    snapshot_claims: guard.snapshot_claims.clone(),
                    writes: Vec::new(),
                });
            }
        }

        for kind in [ResourceKind::Faculty, ResourceKind::Room] {
            let resources: Vec<_> = self.resources(kind).iter().map(|e| e.value().clone()).collect();
            for rs in resources {
                let guard = rs.read().await;
                events.push(Event::ResourceCreated {
                    key: guard.key,
                    name: guard.name.clone(),
                    availability: guard.availability.clone(),
                });
            }
        }
        events.extend(timetables);

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
