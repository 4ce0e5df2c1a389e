mod bookings;
mod conflict;
mod error;
mod queries;
mod rooms;
mod validate;

pub use error::{EngineError, ValidationError};
pub use conflict::now_ms;
pub use validate::RawBooking;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::limits::MAX_COMMIT_ATTEMPTS;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
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

/// Owns the WAL. Takes the first queued append, drains whatever else is
/// already waiting, then fsyncs the whole batch once.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        warn!("WAL batch of {} failed: {e}", batch.len());
    }
    if result.is_err()
        && let Err(rollback) = wal.discard_unsynced()
    {
        error!("WAL rollback failed, later appends may not replay: {rollback}");
        result = Err(rollback);
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    state: DashMap<Ulid, SharedRoomState>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking id → room id.
    booking_to_room: DashMap<Ulid, Ulid>,
    /// Unique room names → room id.
    room_names: DashMap<String, Ulid>,
    /// Held shared by every mutation from lock to apply, and exclusively by
    /// compaction from snapshot to log swap.
    compaction: RwLock<()>,
    policy: OverlapPolicy,
}

/// Apply a booking event to a room (caller holds the write lock).
/// Returns the id of a booking that would be overlapped, leaving `rs` unchanged.
fn apply_to_room(
    rs: &mut RoomState,
    event: &Event,
    booking_index: &DashMap<Ulid, Ulid>,
    policy: OverlapPolicy,
) -> Result<(), Ulid> {
    match event {
        Event::BookingCreated { booking } => {
            rs.insert_booking(booking.clone(), policy)?;
            booking_index.insert(booking.id, booking.room_id);
        }
        Event::BookingRescheduled { id, interval, .. } => {
            if let Some(blocking) = rs.overlapping(interval, policy).find(|b| b.id != *id) {
                return Err(blocking.id);
            }
            let Some(mut booking) = rs.remove_booking(*id) else {
                return Ok(());
            };
            booking.interval = *interval;
            rs.insert_booking(booking, policy)?;
        }
        Event::BookingCancelled { id, .. } => {
            rs.remove_booking(*id);
            booking_index.remove(id);
        }
        Event::RoomUpdated {
            name, description, ..
        } => {
            rs.name = name.clone();
            rs.description = description.clone();
        }
        // Creation and deletion touch the room map, not the room itself.
        Event::RoomCreated { .. } | Event::RoomDeleted { .. } => {}
    }
    Ok(())
}

/// A serialized write scope on one room: begin = write lock taken,
/// commit = WAL append then in-memory apply, rollback = drop.
pub(crate) struct RoomTxn<'e> {
    engine: &'e Engine,
    room_id: Ulid,
    guard: OwnedRwLockWriteGuard<RoomState>,
    _gate: RwLockReadGuard<'e, ()>,
}

impl RoomTxn<'_> {
    pub(crate) fn state(&self) -> &RoomState {
        &self.guard
    }

    /// Re-check the event against the room, append it, then apply it.
    /// Nothing is applied if the append fails.
    pub(crate) async fn commit(&mut self, event: Event) -> Result<(), EngineError> {
        let policy = self.engine.policy;
        let candidate = match &event {
            Event::BookingCreated { booking } => Some((booking.id, booking.interval)),
            Event::BookingRescheduled { id, interval, .. } => Some((*id, *interval)),
            _ => None,
        };
        if let Some((id, interval)) = candidate
            && let Some(blocking) = conflict::find_overlaps(&self.guard, &interval, Some(id), policy).next()
        {
            return Err(EngineError::Concurrency {
                room_id: self.room_id,
                blocking: Some(blocking.id),
            });
        }

        self.engine.wal_append(&event).await?;
        apply_to_room(&mut self.guard, &event, &self.engine.booking_to_room, policy).map_err(
            |blocking| EngineError::Concurrency {
                room_id: self.room_id,
                blocking: Some(blocking),
            },
        )
    }

    pub(crate) fn state_mut(&mut self) -> &mut RoomState {
        &mut self.guard
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, policy: OverlapPolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            booking_to_room: DashMap::new(),
            room_names: DashMap::new(),
            compaction: RwLock::new(()),
            policy,
        };
        for event in &events {
            engine.replay_event(event);
        }
        Ok(engine)
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    /// Rebuild state from one WAL record. We are the sole owner of every Arc
    /// here, so `try_write` never contends; blocking locks are avoided because
    /// this can run inside the runtime.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::RoomCreated {
                id,
                name,
                description,
            } => {
                let rs = RoomState::new(*id, name.clone(), description.clone());
                self.state.insert(*id, Arc::new(RwLock::new(rs)));
                self.room_names.insert(name.clone(), *id);
            }
            Event::RoomDeleted { id } => self.forget_room(id),
            Event::RoomUpdated { id, name, .. } => {
                let Some(rs) = self.get_room_state(id) else { return };
                let Ok(mut guard) = rs.try_write() else { return };
                self.room_names.remove(&guard.name);
                self.room_names.insert(name.clone(), *id);
                let _ = apply_to_room(&mut guard, event, &self.booking_to_room, self.policy);
            }
            other => {
                let Some(room_id) = event_room_id(other) else { return };
                let Some(rs) = self.get_room_state(&room_id) else { return };
                let Ok(mut guard) = rs.try_write() else { return };
                if let Err(blocking) =
                    apply_to_room(&mut guard, other, &self.booking_to_room, self.policy)
                {
                    warn!("replay: skipped event on room {room_id} overlapping booking {blocking}");
                }
            }
        }
    }

    /// Drop a room and everything indexed under it.
    fn forget_room(&self, id: &Ulid) {
        let Some((_, rs)) = self.state.remove(id) else { return };
        if let Ok(mut guard) = rs.try_write() {
            self.retire(&mut guard);
        }
    }

    fn retire(&self, rs: &mut RoomState) {
        rs.retired = true;
        self.room_names.remove_if(&rs.name, |_, owner| *owner == rs.id);
        for booking in rs.bookings.drain(..) {
            self.booking_to_room.remove(&booking.id);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(crate) fn get_room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    /// Take the compaction gate, then the room's write lock. A room deleted
    /// while we waited is reported as a concurrency failure so the caller
    /// starts over.
    pub(crate) async fn begin(&self, room_id: Ulid) -> Result<RoomTxn<'_>, EngineError> {
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let gate = self.mutation_gate().await;
        let guard = rs.write_owned().await;
        if guard.retired {
            return Err(EngineError::Concurrency {
                room_id,
                blocking: None,
            });
        }
        Ok(RoomTxn {
            engine: self,
            room_id,
            guard,
            _gate: gate,
        })
    }

    /// Run `attempt` until it stops failing on the commit backstop, at most
    /// `MAX_COMMIT_ATTEMPTS` times. Exhaustion surfaces as a conflict.
    async fn with_commit_retry<T, F, Fut>(&self, mut attempt: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt().await {
                Err(EngineError::Concurrency { room_id, blocking }) => {
                    metrics::counter!(observability::COMMIT_RETRIES_TOTAL).increment(1);
                    if tries >= MAX_COMMIT_ATTEMPTS {
                        warn!("room {room_id}: giving up after {tries} attempts");
                        return Err(EngineError::Conflict(blocking.into_iter().collect()));
                    }
                    debug!("room {room_id}: commit raced, retrying (attempt {tries})");
                }
                other => return other,
            }
        }
    }

    /// Shared side of the compaction gate. Take it before any room lock.
    pub(crate) async fn mutation_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.compaction.read().await
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    /// Mutations wait until the compacted log is in place.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction.write().await;
        let rooms: Vec<SharedRoomState> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            events.push(Event::RoomCreated {
                id: guard.id,
                name: guard.name.clone(),
                description: guard.description.clone(),
            });
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated {
                booking: b.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
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

fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingCreated { booking } => Some(booking.room_id),
        Event::BookingRescheduled { room_id, .. } | Event::BookingCancelled { room_id, .. } => {
            Some(*room_id)
        }
        Event::RoomUpdated { id, .. } => Some(*id),
        Event::RoomCreated { .. } | Event::RoomDeleted { .. } => None,
    }
}
