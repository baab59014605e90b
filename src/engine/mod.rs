mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{free_windows, merge_overlapping, subtract_intervals};
pub use error::EngineError;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedMailingState = Arc<RwLock<MailingState>>;

/// A mailing plus its subscriptions, locked together.
#[derive(Debug, Clone)]
pub struct MailingState {
    pub mailing: Mailing,
    /// Keyed by user id; one row per `(user, mailing)`.
    pub subscriptions: BTreeMap<Ulid, Subscription>,
}

/// Lookups that race with a concurrent move of the same reservation retry this many times.
const MAX_RESOLVE_ATTEMPTS: usize = 4;

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

/// Owns the WAL. Each wake-up takes every append already queued and commits them
/// with a single fsync; any other command is handled after the batch in front of it.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch: Vec<PendingAppend> = vec![(event, response)];
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

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal<Event>, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal<Event>, cmd: WalCommand) {
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

/// Reservation store and availability index, plus the mailing/subscription store the
/// notification pipeline reads from.
///
/// Every mutation runs lock → validate → WAL append → apply → post-commit hook. The
/// per-vehicle write lock makes the conflict check and the commit one atomic step;
/// different vehicles commit in parallel.
pub struct Engine {
    resources: DashMap<Ulid, SharedResourceState>,
    /// Reverse lookup: reservation id → vehicle id.
    reservation_index: DashMap<Ulid, Ulid>,
    mailings: DashMap<Ulid, SharedMailingState>,
    notifications: DashMap<Ulid, Vec<Notification>>,
    /// Mutations hold a read guard from before their first lock until after apply;
    /// compaction takes the write guard so its snapshot matches the log exactly.
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(crate) clock: Arc<dyn Clock>,
}

/// Apply a reservation event to the vehicle it lands on. `source` is only passed
/// when an update moves the reservation off another vehicle.
fn apply_reservation(
    target: &mut ResourceState,
    source: Option<&mut ResourceState>,
    event: &Event,
    index: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::ReservationCreated { reservation } => {
            target.remove(reservation.id);
            target.insert(reservation.clone());
            index.insert(reservation.id, target.id);
        }
        Event::ReservationUpdated {
            id, span, status, ..
        } => {
            let existing = match source {
                Some(src) => src.remove(*id),
                None => target.remove(*id),
            };
            if let Some(mut r) = existing {
                r.resource_id = target.id;
                r.span = *span;
                r.status = *status;
                target.insert(r);
                index.insert(*id, target.id);
            }
        }
        Event::ReservationDeleted { id, .. } => {
            target.remove(*id);
            index.remove(id);
        }
        Event::ReminderFlagSet { id, sent, .. } => {
            if let Some(r) = target.get_mut(*id) {
                r.notification_sent = *sent;
            }
        }
        _ => {}
    }
}

/// Apply a mailing-scoped event. Creation and deletion happen at the map level.
fn apply_mailing(state: &mut MailingState, event: &Event) {
    let mailing = &mut state.mailing;
    match event {
        Event::MailingUpdated {
            subject,
            body,
            send_time,
            kind,
            updated_at,
            ..
        } => {
            mailing.subject = subject.clone();
            mailing.body = body.clone();
            mailing.send_time = *send_time;
            mailing.kind = *kind;
            mailing.updated_at = *updated_at;
        }
        Event::MailingArmed { job, .. } => mailing.job_handle = *job,
        Event::MailingSent { .. } => mailing.is_sent = true,
        Event::MailingSkipped { reason, .. } => mailing.skipped = Some(reason.clone()),
        Event::FailedRecipientsRecorded { recipients, .. } => {
            mailing.failed_recipients.extend(recipients.iter().cloned());
        }
        Event::SubscriptionSet { subscription } => {
            state
                .subscriptions
                .insert(subscription.user_id, subscription.clone());
        }
        _ => {}
    }
}

fn event_mailing_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::MailingUpdated { id, .. }
        | Event::MailingArmed { id, .. }
        | Event::MailingSent { id }
        | Event::MailingSkipped { id, .. }
        | Event::FailedRecipientsRecorded { id, .. } => Some(*id),
        Event::SubscriptionSet { subscription } => Some(subscription.mailing_id),
        _ => None,
    }
}

fn record_notification(map: &DashMap<Ulid, Vec<Notification>>, notification: &Notification) {
    let mut entry = map.entry(notification.reservation_id).or_default();
    if !entry.iter().any(|n| n.id == notification.id) {
        entry.push(notification.clone());
    }
}

/// Plain (unlocked) state rebuilt from the log before the engine goes live.
#[derive(Default)]
struct Replayed {
    resources: HashMap<Ulid, ResourceState>,
    index: DashMap<Ulid, Ulid>,
    mailings: HashMap<Ulid, MailingState>,
    notifications: DashMap<Ulid, Vec<Notification>>,
}

impl Replayed {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::ReservationUpdated {
                from_resource,
                resource_id,
                ..
            } if from_resource != resource_id => {
                let mut source = self.resources.remove(from_resource);
                let target = self
                    .resources
                    .entry(*resource_id)
                    .or_insert_with(|| ResourceState::new(*resource_id));
                apply_reservation(target, source.as_mut(), event, &self.index);
                if let Some(source) = source {
                    self.resources.insert(*from_resource, source);
                }
            }
            Event::NotificationRecorded { notification } => {
                record_notification(&self.notifications, notification);
            }
            Event::MailingCreated { mailing } => {
                let subscriptions = self
                    .mailings
                    .remove(&mailing.id)
                    .map(|s| s.subscriptions)
                    .unwrap_or_default();
                self.mailings.insert(
                    mailing.id,
                    MailingState {
                        mailing: mailing.clone(),
                        subscriptions,
                    },
                );
            }
            Event::MailingDeleted { id } => {
                self.mailings.remove(id);
            }
            other => {
                if let Some(resource_id) = other.resource_id() {
                    let target = self
                        .resources
                        .entry(resource_id)
                        .or_insert_with(|| ResourceState::new(resource_id));
                    apply_reservation(target, None, other, &self.index);
                } else if let Some(mailing_id) = event_mailing_id(other)
                    && let Some(state) = self.mailings.get_mut(&mailing_id)
                {
                    apply_mailing(state, other);
                }
            }
        }
    }
}

impl Engine {
    /// Replay the log at `wal_path` and start the group-commit writer. Needs a Tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::<Event>::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut replayed = Replayed::default();
        for event in &events {
            replayed.apply(event);
        }
        tracing::debug!(
            "replayed {} events: {} vehicles, {} mailings",
            events.len(),
            replayed.resources.len(),
            replayed.mailings.len()
        );

        Ok(Self {
            resources: replayed
                .resources
                .into_iter()
                .map(|(id, rs)| (id, Arc::new(RwLock::new(rs))))
                .collect(),
            reservation_index: replayed.index,
            mailings: replayed
                .mailings
                .into_iter()
                .map(|(id, ms)| (id, Arc::new(RwLock::new(ms))))
                .collect(),
            notifications: replayed.notifications,
            commit_gate: RwLock::new(()),
            wal_tx,
            notify,
            clock,
        })
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

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// Vehicles are owned by the outer system; their conflict set is created on first use.
    fn resource_slot(&self, id: Ulid) -> SharedResourceState {
        self.resources
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(id))))
            .value()
            .clone()
    }

    pub fn reservation_resource(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    pub(crate) fn get_mailing_state(&self, id: &Ulid) -> Option<SharedMailingState> {
        self.mailings.get(id).map(|e| e.value().clone())
    }

    /// WAL-append + apply + post-commit hook for a reservation that stays on one vehicle.
    pub(super) async fn persist_reservation(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_reservation(rs, None, event, &self.reservation_index);
        self.notify.send(rs.id, event);
        Ok(())
    }

    /// Same, for a reservation moving from `source` to `target`.
    pub(super) async fn persist_move(
        &self,
        target: &mut ResourceState,
        source: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_reservation(target, Some(source), event, &self.reservation_index);
        self.notify.send(source.id, event);
        self.notify.send(target.id, event);
        Ok(())
    }

    pub(super) async fn persist_mailing(
        &self,
        state: &mut MailingState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_mailing(state, event);
        Ok(())
    }

    /// Lookup reservation → vehicle and take that vehicle's write lock, retrying if the
    /// reservation moved between the lookup and the lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let resource_id = self
                .reservation_resource(id)
                .ok_or(EngineError::NotFound(*id))?;
            let rs = self
                .get_resource(&resource_id)
                .ok_or(EngineError::NotFound(resource_id))?;
            let guard = rs.write_owned().await;
            if guard.get(*id).is_some() {
                return Ok(guard);
            }
        }
        Err(EngineError::NotFound(*id))
    }
}
