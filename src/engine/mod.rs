mod batch;
mod conflict;
mod error;
pub mod machine;
mod mutations;
mod queries;
pub mod router;

pub use batch::{BatchFailure, BatchReport};
pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::config::Policy;
use crate::directory::{Directory, DirectoryError};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// Locking partition: one resource on one date.
pub type DayKey = (Ulid, NaiveDate);
pub type SharedDay = Arc<RwLock<DayLedger>>;

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

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is running are
/// written together and made durable by one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Commit what we have before compaction can swap the file
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        // Nothing of a failed batch may stay on disk ahead of the next one
        if let Err(undo) = wal.rollback() {
            tracing::error!("wal rollback after failed commit ({e}) failed: {undo}");
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Write guard ──────────────────────────────────────────

/// Exclusive access to one day ledger, plus a share of the commit gate.
///
/// The commit gate is always taken before any ledger lock. Compaction takes
/// it exclusively, so it sees no half-applied commit and no append lands in
/// the log it is about to replace.
pub(super) struct DayGuard {
    ledger: OwnedRwLockWriteGuard<DayLedger>,
    _commit: OwnedRwLockReadGuard<()>,
}

impl Deref for DayGuard {
    type Target = DayLedger;
    fn deref(&self) -> &DayLedger {
        &self.ledger
    }
}

impl DerefMut for DayGuard {
    fn deref_mut(&mut self) -> &mut DayLedger {
        &mut self.ledger
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) policy: Policy,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) resources: DashMap<Ulid, ResourceInfo>,
    pub(super) days: DashMap<DayKey, SharedDay>,
    /// Reservation id → partition holding it.
    pub(super) index: DashMap<Ulid, DayKey>,
    /// Requester id → their reservation ids, in submission order.
    pub(super) by_requester: DashMap<Ulid, Vec<Ulid>>,
    pub(super) commit_gate: Arc<RwLock<()>>,
    /// Directory changes made through the engine, for compaction.
    pub(super) actor_changes: DashMap<Ulid, ActorChange>,
    /// Serializes resource registry and directory writes.
    pub(super) registry_lock: tokio::sync::Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Latest runtime change to one actor.
#[derive(Debug, Clone)]
pub(super) enum ActorChange {
    Registered(Actor),
    /// Deactivation of an actor that came from the roster.
    Deactivated,
}

fn day_key(event: &Event) -> Option<DayKey> {
    match event {
        Event::ReservationCreated {
            resource_id, slot, ..
        } => Some((*resource_id, slot.date)),
        Event::ReservationTransitioned {
            resource_id, date, ..
        } => Some((*resource_id, *date)),
        Event::ReservationSnapshot { reservation } => {
            Some((reservation.resource_id, reservation.slot.date))
        }
        _ => None,
    }
}

/// Apply a reservation event to its ledger. Caller holds the ledger's write lock.
fn apply_to_day(day: &mut DayLedger, event: &Event) {
    match event {
        Event::ReservationCreated {
            id,
            resource_id,
            requester,
            owner_scope,
            slot,
            status,
            created_at,
        } => day.insert(Reservation {
            id: *id,
            resource_id: *resource_id,
            requester: *requester,
            owner_scope: owner_scope.clone(),
            slot: *slot,
            status: *status,
            rejection_reason: None,
            created_at: *created_at,
            updated_at: *created_at,
        }),
        Event::ReservationTransitioned {
            id, to, reason, at, ..
        } => {
            if let Some(r) = day.get_mut(id) {
                r.status = *to;
                if reason.is_some() {
                    r.rejection_reason = reason.clone();
                }
                r.updated_at = *at;
            }
        }
        Event::ReservationSnapshot { reservation } => day.insert(reservation.clone()),
        Event::ResourceRegistered { .. }
        | Event::ResourceUpdated { .. }
        | Event::ResourceStatusChanged { .. }
        | Event::ActorRegistered { .. }
        | Event::ActorDeactivated { .. } => {}
    }
}

fn apply_to_registry(resources: &DashMap<Ulid, ResourceInfo>, event: &Event) {
    match event {
        Event::ResourceRegistered {
            id,
            name,
            kind,
            capacity,
            status,
        } => {
            resources.insert(
                *id,
                ResourceInfo {
                    id: *id,
                    name: name.clone(),
                    kind: *kind,
                    capacity: *capacity,
                    status: *status,
                },
            );
        }
        Event::ResourceUpdated {
            id,
            name,
            kind,
            capacity,
        } => {
            if let Some(mut info) = resources.get_mut(id) {
                info.name = name.clone();
                info.kind = *kind;
                info.capacity = *capacity;
            }
        }
        Event::ResourceStatusChanged { id, status } => {
            if let Some(mut info) = resources.get_mut(id) {
                info.status = *status;
            }
        }
        _ => {}
    }
}

impl Engine {
    /// Replay the log at `wal_path` and start the WAL writer task.
    pub fn new(
        wal_path: PathBuf,
        policy: Policy,
        directory: Arc<dyn Directory>,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            policy,
            directory,
            resources: DashMap::new(),
            days: DashMap::new(),
            index: DashMap::new(),
            by_requester: DashMap::new(),
            actor_changes: DashMap::new(),
            commit_gate: Arc::new(RwLock::new(())),
            registry_lock: tokio::sync::Mutex::new(()),
            wal_tx,
            notify,
        };

        // Rebuild ledgers unshared, then publish them
        let mut ledgers: HashMap<DayKey, DayLedger> = HashMap::new();
        for event in &events {
            match day_key(event) {
                Some(key) => {
                    let day = ledgers
                        .entry(key)
                        .or_insert_with(|| DayLedger::new(key.0, key.1));
                    apply_to_day(day, event);
                    engine.index_event(event);
                }
                None => {
                    apply_to_registry(&engine.resources, event);
                    if let Err(e) = engine.apply_actor_event(event) {
                        warn!("skipping directory record on replay: {e}");
                    }
                }
            }
        }
        for (key, day) in ledgers {
            engine.days.insert(key, Arc::new(RwLock::new(day)));
        }

        info!(
            events = events.len(),
            resources = engine.resources.len(),
            reservations = engine.index.len(),
            "engine replayed {}",
            wal_path.display()
        );
        Ok(engine)
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
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

    fn index_event(&self, event: &Event) {
        let (id, requester, key) = match event {
            Event::ReservationCreated {
                id,
                requester,
                resource_id,
                slot,
                ..
            } => (*id, *requester, (*resource_id, slot.date)),
            Event::ReservationSnapshot { reservation: r } => {
                (r.id, r.requester, (r.resource_id, r.slot.date))
            }
            _ => return,
        };
        self.index.insert(id, key);
        self.by_requester.entry(requester).or_default().push(id);
    }

    /// WAL-append, apply to the held ledger, index and notify.
    pub(super) async fn persist_and_apply(
        &self,
        day: &mut DayLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_day(day, event);
        self.index_event(event);
        self.notify.send(event);
        Ok(())
    }

    /// WAL-append and apply a registry event. Caller holds the commit gate
    /// and the registry lock.
    pub(super) async fn persist_registry(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_registry(&self.resources, event);
        self.notify.send(event);
        Ok(())
    }

    /// Apply a directory event to the directory and the change set.
    pub(super) fn apply_actor_event(&self, event: &Event) -> Result<(), DirectoryError> {
        match event {
            Event::ActorRegistered { actor } => {
                self.directory.register(actor.clone())?;
                self.actor_changes
                    .insert(actor.id, ActorChange::Registered(actor.clone()));
            }
            Event::ActorDeactivated { id } => {
                self.directory.deactivate(id)?;
                let mut change = self.actor_changes.entry(*id).or_insert(ActorChange::Deactivated);
                if let ActorChange::Registered(actor) = change.value_mut() {
                    actor.active = false;
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub(super) fn get_day(&self, key: &DayKey) -> Option<SharedDay> {
        self.days.get(key).map(|e| e.value().clone())
    }

    /// Lock a day ledger for writing, creating it on first use.
    pub(super) async fn day_write(&self, resource_id: Ulid, date: NaiveDate) -> DayGuard {
        let commit = self.commit_gate.clone().read_owned().await;
        let shared = self
            .days
            .entry((resource_id, date))
            .or_insert_with(|| Arc::new(RwLock::new(DayLedger::new(resource_id, date))))
            .clone();
        DayGuard {
            ledger: shared.write_owned().await,
            _commit: commit,
        }
    }

    /// Partition holding reservation `id`.
    pub(super) fn locate(&self, id: &Ulid) -> Result<DayKey, EngineError> {
        self.index
            .get(id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*id))
    }

    pub(super) async fn lookup_actor(&self, id: Ulid) -> Result<Actor, EngineError> {
        self.directory
            .lookup(&id)
            .await
            .ok_or(EngineError::NotFound(id))
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the log as one record per resource, changed actor and
    /// reservation.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _quiesce = self.commit_gate.write().await;

        let mut events: Vec<Event> = self
            .resources
            .iter()
            .map(|e| {
                let r = e.value();
                Event::ResourceRegistered {
                    id: r.id,
                    name: r.name.clone(),
                    kind: r.kind,
                    capacity: r.capacity,
                    status: r.status,
                }
            })
            .collect();
        let mut actors: Vec<(Ulid, ActorChange)> = self
            .actor_changes
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        actors.sort_by_key(|(id, _)| *id);
        events.extend(actors.into_iter().map(|(id, change)| match change {
            ActorChange::Registered(actor) => Event::ActorRegistered { actor },
            ActorChange::Deactivated => Event::ActorDeactivated { id },
        }));

        let days: Vec<SharedDay> = self.days.iter().map(|e| e.value().clone()).collect();
        let mut reservations = Vec::new();
        for day in days {
            reservations.extend(day.read().await.reservations.iter().cloned());
        }
        // Submission order, so per-requester listings replay in the same order
        reservations.sort_by_key(|r| (r.created_at, r.id));
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationSnapshot { reservation }),
        );

        let count = events.len();
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
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(records = count, "WAL compacted");
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
