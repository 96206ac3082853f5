mod booking;
mod error;
mod sessions;
mod slots;
mod sweeps;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use sessions::check_transition;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::limits;
use crate::model::*;
use crate::notify::{Directory, NotificationSink};
use crate::wal::Wal;

pub type SharedSchedule = Arc<RwLock<CoachSchedule>>;

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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the batch before handling the non-append command.
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes don't
    // leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Booking and scheduling engine for one tenant.
///
/// All state lives in memory, one `CoachSchedule` per coach behind a
/// `RwLock`; every mutation is persisted to the WAL before it is applied.
pub struct Engine {
    pub state: DashMap<Ulid, SharedSchedule>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<dyn NotificationSink>,
    pub directory: Arc<dyn Directory>,
    /// Reverse lookup: session id → owning coach id.
    pub(super) session_to_coach: DashMap<Ulid, Ulid>,
    /// Reverse lookup: slot id → owning coach id.
    pub(super) slot_to_coach: DashMap<Ulid, Ulid>,
    /// Client id → sessions they booked, for listing from the client side.
    pub(super) client_sessions: DashMap<Ulid, Vec<Ulid>>,
    /// Held for the duration of a reminder sweep so overlapping ticks skip.
    pub(super) sweep_lock: Mutex<()>,
}

/// Apply an event to a schedule (no locking — caller holds the write lock).
fn apply_to_schedule(sched: &mut CoachSchedule, event: &Event) {
    match event {
        Event::SlotCreated { slot } => {
            sched.insert_slot(slot.clone());
        }
        Event::SlotUpdated { slot } => {
            // Remove and reinsert so a changed start time keeps sort order.
            sched.remove_slot(slot.id);
            sched.insert_slot(slot.clone());
        }
        Event::SlotDeleted { id, .. } => {
            sched.remove_slot(*id);
        }
        Event::SessionBooked { session } => {
            sched.insert_session(session.clone());
        }
        Event::SessionStatusChanged {
            id,
            status,
            at,
            by,
            reason,
            ..
        } => {
            if let Some(s) = sched.session_mut(*id) {
                s.status = *status;
                match status {
                    SessionStatus::Canceled => {
                        s.canceled_at = Some(*at);
                        s.canceled_by = *by;
                        s.cancel_reason = reason.clone();
                    }
                    SessionStatus::Completed => {
                        s.completed_at = Some(*at);
                    }
                    _ => {}
                }
            }
        }
        Event::SessionFieldsUpdated {
            id,
            title,
            notes,
            coach_notes,
            client_notes,
            meeting_link,
            location,
            ..
        } => {
            if let Some(s) = sched.session_mut(*id) {
                if title.is_some() {
                    s.title = title.clone();
                }
                if notes.is_some() {
                    s.notes = notes.clone();
                }
                if coach_notes.is_some() {
                    s.coach_notes = coach_notes.clone();
                }
                if client_notes.is_some() {
                    s.client_notes = client_notes.clone();
                }
                if meeting_link.is_some() {
                    s.meeting_link = meeting_link.clone();
                }
                if location.is_some() {
                    s.location = location.clone();
                }
            }
        }
        Event::ReminderMarked { id, kind, .. } => {
            if let Some(s) = sched.session_mut(*id) {
                s.mark_reminder(*kind);
            }
        }
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<dyn NotificationSink>,
        directory: Arc<dyn Directory>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            directory,
            session_to_coach: DashMap::new(),
            slot_to_coach: DashMap::new(),
            client_sessions: DashMap::new(),
            sweep_lock: Mutex::new(()),
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds. Never use blocking_write here: this may run inside an
        // async context (lazy tenant creation).
        for event in &events {
            let coach_id = event.coach_id();
            let entry = engine
                .state
                .entry(coach_id)
                .or_insert_with(|| Arc::new(RwLock::new(CoachSchedule::new(coach_id))))
                .clone();
            let mut guard = entry.try_write().expect("replay: uncontended write");
            engine.index_event(event);
            apply_to_schedule(&mut guard, event);
        }

        Ok(engine)
    }

    /// Maintain the secondary indexes for one event.
    fn index_event(&self, event: &Event) {
        match event {
            Event::SlotCreated { slot } => {
                self.slot_to_coach.insert(slot.id, slot.coach_id);
            }
            Event::SlotDeleted { id, .. } => {
                self.slot_to_coach.remove(id);
            }
            Event::SessionBooked { session } => {
                self.session_to_coach.insert(session.id, session.coach_id);
                self.client_sessions
                    .entry(session.client_id)
                    .or_default()
                    .push(session.id);
            }
            _ => {}
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

    /// WAL-append, then apply to in-memory state and the secondary indexes.
    /// The event is durable before the state changes.
    pub(super) async fn persist_and_apply(
        &self,
        sched: &mut CoachSchedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.index_event(event);
        apply_to_schedule(sched, event);
        Ok(())
    }

    pub fn schedule(&self, coach_id: &Ulid) -> Option<SharedSchedule> {
        self.state.get(coach_id).map(|e| e.value().clone())
    }

    /// Schedule for a coach, created lazily on first slot creation.
    pub(super) fn schedule_entry(&self, coach_id: Ulid) -> Result<SharedSchedule, EngineError> {
        if let Some(existing) = self.state.get(&coach_id) {
            return Ok(existing.value().clone());
        }
        if self.state.len() >= limits::MAX_COACHES_PER_TENANT {
            return Err(EngineError::LimitExceeded("coaches per tenant"));
        }
        Ok(self
            .state
            .entry(coach_id)
            .or_insert_with(|| Arc::new(RwLock::new(CoachSchedule::new(coach_id))))
            .clone())
    }

    pub fn coach_of_session(&self, session_id: &Ulid) -> Option<Ulid> {
        self.session_to_coach.get(session_id).map(|e| *e.value())
    }

    pub fn coach_of_slot(&self, slot_id: &Ulid) -> Option<Ulid> {
        self.slot_to_coach.get(slot_id).map(|e| *e.value())
    }

    pub async fn appends_since_compact(&self) -> u64 {
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

    /// Rewrite the log as the minimal event set recreating current state:
    /// one SlotCreated per slot and one SessionBooked per session, with all
    /// derived fields (status, flags, timestamps) baked into the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        for entry in self.state.iter() {
            let sched = entry.value().read().await;
            for slot in &sched.slots {
                events.push(Event::SlotCreated { slot: slot.clone() });
            }
            for session in &sched.sessions {
                events.push(Event::SessionBooked {
                    session: session.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}
