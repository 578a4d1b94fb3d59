mod bitmap;
mod error;
mod materialize;
mod mutations;
mod queries;
mod timetable;

pub use error::EngineError;
pub use materialize::materialize;
pub use queries::{GenerationRequest, ResourceSnapshot, SectionGrid, SnapshotCell};

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedSchedule = Arc<RwLock<ScheduleState>>;
pub type SharedResource = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first Append, drains whatever else is already queued,
/// then pays for a single fsync and answers every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Non-append commands run after the batch they interrupted.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so half-buffered bytes never ride
    // along with the next batch; this batch is reported failed regardless.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            flush_and_respond(wal, &mut vec![(event, response)]);
        }
    }
}

pub struct Engine {
    pub(super) schedules: DashMap<Ulid, SharedSchedule>,
    pub(super) faculty: DashMap<Ulid, SharedResource>,
    pub(super) rooms: DashMap<Ulid, SharedResource>,
    /// Live entries and snapshot claims per faculty member / room, across
    /// all schedules.
    pub(super) references: DashMap<ResourceKey, usize>,
    /// Mutations hold this shared; compaction takes it exclusively so the
    /// rewritten WAL never misses an append made while it was built.
    pub(super) compaction: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            schedules: DashMap::new(),
            faculty: DashMap::new(),
            rooms: DashMap::new(),
            references: DashMap::new(),
            compaction: RwLock::new(()),
            wal_tx,
        };

        let replayed = events.len();
        for event in events {
            engine.replay(event);
        }
        if replayed > 0 {
            tracing::info!(
                "replayed {replayed} events from {}: {} schedules, {} faculty, {} rooms",
                wal_path.display(),
                engine.schedules.len(),
                engine.faculty.len(),
                engine.rooms.len()
            );
        }
        Ok(engine)
    }

    /// Rebuild state from a WAL record. We are the sole owner of every Arc
    /// here, so try_write always succeeds; never block, since this may run
    /// inside an async context (lazy tenant creation).
    fn replay(&self, event: Event) {
        match event {
            Event::ScheduleCreated { id, name, days, slots } => {
                let state = ScheduleState::new(id, name, days, slots);
                self.schedules.insert(id, Arc::new(RwLock::new(state)));
            }
            Event::ScheduleDeleted { id } => {
                self.schedules.remove(&id);
            }
            Event::ResourceCreated { key, name, availability } => {
                let state = ResourceState::new(key, name, availability);
                self.resources(key.kind)
                    .insert(key.id, Arc::new(RwLock::new(state)));
            }
            Event::ResourceDeleted { key } => {
                self.resources(key.kind).remove(&key.id);
            }
            Event::TimetableCommitted {
                schedule_id,
                entries,
                snapshot_claims,
                writes,
            } => {
                self.replay_timetable(schedule_id, entries, snapshot_claims, &writes);
            }
            Event::TimetableReverted { schedule_id, writes } => {
                self.replay_timetable(schedule_id, Vec::new(), Vec::new(), &writes);
            }
        }
    }

    fn replay_timetable(
        &self,
        schedule_id: Ulid,
        entries: Vec<ScheduleEntry>,
        snapshot_claims: Vec<SnapshotClaim>,
        writes: &[AvailabilityWrite],
    ) {
        let Some(schedule) = self.get_schedule(&schedule_id) else {
            tracing::warn!("replay: timetable event for unknown schedule {schedule_id}");
            return;
        };
        let mut guard = schedule
            .try_write_owned()
            .expect("replay: uncontended write");
        let mut locked = LockedResources::default();
        for write in writes {
            if let Some(rs) = self.get_resource(&write.key) {
                locked.push(
                    write.key,
                    rs.try_write_owned().expect("replay: uncontended write"),
                );
            }
        }
        let replacement = Timetable { entries, snapshot_claims };
        apply_timetable(&mut guard, replacement, writes, &mut locked, &self.references);
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub(super) fn resources(&self, kind: ResourceKind) -> &DashMap<Ulid, SharedResource> {
        match kind {
            ResourceKind::Faculty => &self.faculty,
            ResourceKind::Room => &self.rooms,
        }
    }

    pub fn get_schedule(&self, id: &Ulid) -> Option<SharedSchedule> {
        self.schedules.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource(&self, key: &ResourceKey) -> Option<SharedResource> {
        self.resources(key.kind).get(&key.id).map(|e| e.value().clone())
    }

    /// Number of live entries referencing a faculty member or room.
    pub fn reference_count(&self, key: &ResourceKey) -> usize {
        self.references.get(key).map_or(0, |n| *n)
    }

    /// Write-lock every resource in `keys`, ascending, holding all guards
    /// until the returned value drops.
    pub(super) async fn lock_resources(
        &self,
        keys: BTreeSet<ResourceKey>,
    ) -> Result<LockedResources, EngineError> {
        let mut locked = LockedResources::default();
        for key in keys {
            let rs = self.get_resource(&key).ok_or(EngineError::NotFound(key.id))?;
            let guard = rs.write_owned().await;
            if guard.deleted {
                return Err(EngineError::NotFound(key.id));
            }
            locked.push(key, guard);
        }
        Ok(locked)
    }
}

/// Write guards over a set of faculty/room records, indexed by key.
#[derive(Default)]
pub(super) struct LockedResources {
    guards: Vec<OwnedRwLockWriteGuard<ResourceState>>,
    index: HashMap<ResourceKey, usize>,
}

impl LockedResources {
    fn push(&mut self, key: ResourceKey, guard: OwnedRwLockWriteGuard<ResourceState>) {
        self.index.insert(key, self.guards.len());
        self.guards.push(guard);
    }

    pub(super) fn get(&self, key: &ResourceKey) -> Option<&ResourceState> {
        self.index.get(key).map(|i| &*self.guards[*i])
    }

    fn get_mut(&mut self, key: &ResourceKey) -> Option<&mut ResourceState> {
        let i = *self.index.get(key)?;
        Some(&mut *self.guards[i])
    }

    pub(super) fn len(&self) -> usize {
        self.guards.len()
    }
}

/// What a commit leaves a schedule holding; empty after a revert.
#[derive(Default)]
pub(super) struct Timetable {
    pub(super) entries: Vec<ScheduleEntry>,
    pub(super) snapshot_claims: Vec<SnapshotClaim>,
}

fn held_keys<'a>(
    entries: &'a [ScheduleEntry],
    snapshot_claims: &'a [SnapshotClaim],
) -> impl Iterator<Item = ResourceKey> + 'a {
    entries
        .iter()
        .flat_map(|e| e.resource_keys())
        .chain(snapshot_claims.iter().map(|c| c.key))
}

/// Replace a schedule's entries and snapshot claims, and write the bitmaps
/// computed for the replacement. No locking here: the caller holds the
/// schedule guard and every guard in `locked`.
fn apply_timetable(
    schedule: &mut ScheduleState,
    replacement: Timetable,
    writes: &[AvailabilityWrite],
    locked: &mut LockedResources,
    references: &DashMap<ResourceKey, usize>,
) {
    for key in held_keys(&schedule.entries, &schedule.snapshot_claims) {
        if let Some(mut n) = references.get_mut(&key) {
            *n = n.saturating_sub(1);
        }
        references.remove_if(&key, |_, n| *n == 0);
    }
    for key in held_keys(&replacement.entries, &replacement.snapshot_claims) {
        *references.entry(key).or_insert(0) += 1;
    }
    schedule.entries = replacement.entries;
    schedule.snapshot_claims = replacement.snapshot_claims;

    for write in writes {
        if let Some(rs) = locked.get_mut(&write.key) {
            rs.availability = Some(write.availability.clone());
        }
    }
}
