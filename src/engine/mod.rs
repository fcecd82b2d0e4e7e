mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{resolve_slots, weekly_row_for, SLOT_STEP_MIN};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedDay = Arc<RwLock<DaySchedule>>;

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
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            // Non-append commands run after this batch is durable.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
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

/// The scheduling engine for one spa.
///
/// Appointments are partitioned by date; each date's schedule sits behind its
/// own write lock, which is what makes the conflict check and the insert that
/// follows it atomic. Everything else (services, weekly hours, blocked dates,
/// clients) is catalog state in concurrent maps.
pub struct Engine {
    pub(super) days: DashMap<NaiveDate, SharedDay>,
    /// Reverse lookup: appointment id → date.
    pub(super) appointment_dates: DashMap<Ulid, NaiveDate>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) weekly: DashMap<Ulid, WeeklyAvailability>,
    pub(super) blocked: DashMap<Ulid, BlockedDate>,
    pub(super) clients: DashMap<Ulid, Client>,
    /// Lowercased email → client id.
    pub(super) client_emails: DashMap<String, Ulid>,
    /// Catalog writes that must see a stable view take this exclusively;
    /// appointment creation takes it shared. Always acquired before any day lock.
    pub(super) catalog_lock: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply an appointment event to its day (no locking; caller holds the day's lock).
fn apply_to_day(day: &mut DaySchedule, event: &Event, dates: &DashMap<Ulid, NaiveDate>) {
    match event {
        Event::AppointmentCreated { appointment } => {
            dates.insert(appointment.id, appointment.date);
            day.insert_appointment(appointment.clone());
        }
        Event::AppointmentUpdated { id, span: None, status: Some(status), .. } => {
            if let Some(a) = day.get_mut(*id) {
                a.status = *status;
            }
        }
        Event::AppointmentUpdated { id, span: Some(span), status, .. } => {
            // Re-insert to keep the day sorted by start.
            if let Some(mut a) = day.remove_appointment(*id) {
                a.span = *span;
                if let Some(status) = status {
                    a.status = *status;
                }
                day.insert_appointment(a);
            }
        }
        Event::AppointmentDeleted { id, .. } => {
            day.remove_appointment(*id);
            dates.remove(id);
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            days: DashMap::new(),
            appointment_dates: DashMap::new(),
            services: DashMap::new(),
            weekly: DashMap::new(),
            blocked: DashMap::new(),
            clients: DashMap::new(),
            client_emails: DashMap::new(),
            catalog_lock: RwLock::new(()),
            wal_tx,
            notify,
        };

        // We're the sole owner of every day Arc during replay, so try_write always
        // succeeds. Never use blocking_write here: this runs inside the runtime.
        for event in &events {
            match event.appointment_date() {
                Some(date) => {
                    let day = engine.day(date);
                    let mut guard = day.try_write().expect("replay: uncontended write");
                    apply_to_day(&mut guard, event, &engine.appointment_dates);
                }
                None => engine.apply_catalog(event),
            }
        }
        tracing::debug!("replayed {} WAL events", events.len());

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    /// Get (or lazily create) the schedule for a date.
    pub(super) fn day(&self, date: NaiveDate) -> SharedDay {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DaySchedule::new(date))))
            .value()
            .clone()
    }

    pub(super) fn existing_day(&self, date: &NaiveDate) -> Option<SharedDay> {
        self.days.get(date).map(|e| e.value().clone())
    }

    pub fn get_appointment_date(&self, id: &Ulid) -> Option<NaiveDate> {
        self.appointment_dates.get(id).map(|e| *e.value())
    }

    /// Lookup appointment → date, acquire that day's write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        id: &Ulid,
    ) -> Result<(NaiveDate, tokio::sync::OwnedRwLockWriteGuard<DaySchedule>), EngineError> {
        let date = self.get_appointment_date(id).ok_or(EngineError::NotFound(*id))?;
        let day = self.existing_day(&date).ok_or(EngineError::NotFound(*id))?;
        let guard = day.write_owned().await;
        // A concurrent delete may have won the race for the lock.
        if guard.get(*id).is_none() {
            return Err(EngineError::NotFound(*id));
        }
        Ok((date, guard))
    }

    /// WAL-append + apply + notify for an appointment event. Caller holds the day lock.
    pub(super) async fn persist_and_apply(
        &self,
        day: &mut DaySchedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_day(day, event, &self.appointment_dates);
        self.notify.send(event);
        Ok(())
    }

    /// WAL-append + apply + notify for a catalog event.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        self.notify.send(event);
        Ok(())
    }

    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::ServiceCreated { service } | Event::ServiceUpdated { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::ServiceDeleted { id } => {
                self.services.remove(id);
            }
            Event::WeeklyAvailabilitySet { row } => {
                self.weekly.insert(row.id, row.clone());
            }
            Event::WeeklyAvailabilityRemoved { id } => {
                self.weekly.remove(id);
            }
            Event::DateBlocked { blocked } => {
                self.blocked.insert(blocked.id, blocked.clone());
            }
            Event::DateUnblocked { id } => {
                self.blocked.remove(id);
            }
            Event::ClientSaved { client } => {
                if let Some(previous) = self.clients.insert(client.id, client.clone())
                    && previous.email != client.email
                {
                    self.client_emails.remove(&previous.email);
                }
                self.client_emails.insert(client.email.clone(), client.id);
            }
            Event::ClientDeleted { id } => {
                if let Some((_, client)) = self.clients.remove(id) {
                    self.client_emails.remove(&client.email);
                }
            }
            Event::AppointmentCreated { .. }
            | Event::AppointmentUpdated { .. }
            | Event::AppointmentDeleted { .. } => {}
        }
    }
}
