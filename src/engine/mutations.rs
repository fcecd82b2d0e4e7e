use std::sync::Arc;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::BOOKINGS_TOTAL;

use super::conflict::{appointment_span, check_no_conflict, validate_duration, validate_weekly};
use super::{Engine, EngineError, WalCommand};

fn check_len(value: &Option<String>, max: usize, what: &'static str) -> Result<(), EngineError> {
    if let Some(v) = value
        && v.len() > max
    {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

/// Self-service bookings must carry a non-blank value for `what`.
fn required_field(value: Option<String>, what: &'static str) -> Result<Option<String>, EngineError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(Some(v)),
        _ => Err(EngineError::Validation(what.into())),
    }
}

/// Trim, lowercase and sanity-check an email address.
pub(crate) fn normalize_email(email: &str) -> Result<String, EngineError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() {
        return Err(EngineError::Validation("email is required".into()));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(EngineError::Validation(format!("invalid email address: {email}"))),
    }
}

fn validate_service_fields(name: &str, duration_min: u32, price_cents: u32) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("service name is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("service name too long"));
    }
    validate_duration(duration_min)?;
    if price_cents > MAX_PRICE_CENTS {
        return Err(EngineError::LimitExceeded("price too high"));
    }
    Ok(())
}

impl Engine {
    // ── Services ─────────────────────────────────────────────

    fn next_sort_order(&self, category: ServiceCategory, skip: Option<Ulid>) -> u32 {
        self.services
            .iter()
            .filter(|e| e.category == category && Some(e.id) != skip)
            .map(|e| e.sort_order + 1)
            .max()
            .unwrap_or(0)
    }

    pub async fn create_service(&self, new: NewService) -> Result<Service, EngineError> {
        validate_service_fields(&new.name, new.duration_min, new.price_cents)?;
        check_len(&new.name_en, MAX_NAME_LEN, "english name too long")?;

        let _catalog = self.catalog_lock.write().await;
        if self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if self.services.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(format!("service {}", new.id)));
        }

        let service = Service {
            id: new.id,
            name: new.name,
            name_en: new.name_en,
            duration_min: new.duration_min,
            price_cents: new.price_cents,
            category: new.category,
            active: new.active,
            sort_order: self.next_sort_order(new.category, None),
        };
        self.persist_catalog(&Event::ServiceCreated {
            service: service.clone(),
        })
        .await?;
        Ok(service)
    }

    pub async fn update_service(&self, id: Ulid, patch: ServicePatch) -> Result<Service, EngineError> {
        let _catalog = self.catalog_lock.write().await;
        let mut service = self.get_service(&id).ok_or(EngineError::NotFound(id))?;

        if let Some(name) = patch.name {
            service.name = name;
        }
        if let Some(name_en) = patch.name_en {
            service.name_en = name_en;
        }
        if let Some(duration) = patch.duration_min {
            service.duration_min = duration;
        }
        if let Some(price) = patch.price_cents {
            service.price_cents = price;
        }
        if let Some(active) = patch.active {
            service.active = active;
        }
        if let Some(category) = patch.category
            && category != service.category
        {
            // Moving category appends the service to the end of its new list.
            service.category = category;
            service.sort_order = self.next_sort_order(category, Some(id));
        }
        validate_service_fields(&service.name, service.duration_min, service.price_cents)?;
        check_len(&service.name_en, MAX_NAME_LEN, "english name too long")?;

        self.persist_catalog(&Event::ServiceUpdated {
            service: service.clone(),
        })
        .await?;
        Ok(service)
    }

    /// Refused with `InUse` while any appointment references the service.
    pub async fn delete_service(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        if !self.services.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.count_appointments(|a| a.service_id == id).await > 0 {
            return Err(EngineError::InUse(id));
        }
        self.persist_catalog(&Event::ServiceDeleted { id }).await
    }

    /// Swap sort order with the neighbouring service of the same category.
    pub async fn move_service(&self, id: Ulid, direction: MoveDirection) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        let service = self.get_service(&id).ok_or(EngineError::NotFound(id))?;

        let mut siblings: Vec<Service> = self
            .services
            .iter()
            .filter(|e| e.category == service.category)
            .map(|e| e.value().clone())
            .collect();
        siblings.sort_by_key(|s| (s.sort_order, s.id));

        let pos = siblings
            .iter()
            .position(|s| s.id == id)
            .ok_or(EngineError::NotFound(id))?;
        let neighbour = match direction {
            MoveDirection::Up => pos.checked_sub(1),
            MoveDirection::Down => Some(pos + 1).filter(|&n| n < siblings.len()),
        }
        .ok_or(EngineError::LimitExceeded("cannot move service further"))?;

        let mut a = siblings[pos].clone();
        let mut b = siblings[neighbour].clone();
        // Equal sort orders (legacy data) still need to end up distinct.
        let (lo, hi) = (a.sort_order.min(b.sort_order), a.sort_order.max(b.sort_order));
        let hi = if lo == hi { hi + 1 } else { hi };
        match direction {
            MoveDirection::Up => {
                a.sort_order = lo;
                b.sort_order = hi;
            }
            MoveDirection::Down => {
                a.sort_order = hi;
                b.sort_order = lo;
            }
        }

        self.persist_catalog(&Event::ServiceUpdated { service: a }).await?;
        self.persist_catalog(&Event::ServiceUpdated { service: b }).await
    }

    // ── Weekly availability ─────────────────────────────────

    pub async fn add_weekly_availability(
        &self,
        id: Ulid,
        day_of_week: u8,
        start: TimeOfDay,
        end: TimeOfDay,
        active: bool,
    ) -> Result<WeeklyAvailability, EngineError> {
        validate_weekly(day_of_week, start, end)?;
        let _catalog = self.catalog_lock.write().await;
        if self.weekly.len() >= MAX_WEEKLY_ROWS {
            return Err(EngineError::LimitExceeded("too many weekly availability rows"));
        }
        if self.weekly.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("weekly availability {id}")));
        }
        let row = WeeklyAvailability {
            id,
            day_of_week,
            start,
            end,
            active,
        };
        self.persist_catalog(&Event::WeeklyAvailabilitySet { row: row.clone() })
            .await?;
        Ok(row)
    }

    pub async fn update_weekly_availability(
        &self,
        id: Ulid,
        patch: WeeklyPatch,
    ) -> Result<WeeklyAvailability, EngineError> {
        let _catalog = self.catalog_lock.write().await;
        let mut row = self
            .weekly
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        if let Some(dow) = patch.day_of_week {
            row.day_of_week = dow;
        }
        if let Some(start) = patch.start {
            row.start = start;
        }
        if let Some(end) = patch.end {
            row.end = end;
        }
        if let Some(active) = patch.active {
            row.active = active;
        }
        validate_weekly(row.day_of_week, row.start, row.end)?;
        self.persist_catalog(&Event::WeeklyAvailabilitySet { row: row.clone() })
            .await?;
        Ok(row)
    }

    pub async fn remove_weekly_availability(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        if !self.weekly.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_catalog(&Event::WeeklyAvailabilityRemoved { id }).await
    }

    // ── Blocked dates ───────────────────────────────────────

    pub async fn block_date(
        &self,
        id: Ulid,
        date: chrono::NaiveDate,
        reason: Option<String>,
    ) -> Result<BlockedDate, EngineError> {
        check_len(&reason, MAX_REASON_LEN, "reason too long")?;
        let _catalog = self.catalog_lock.write().await;
        if self.blocked.len() >= MAX_BLOCKED_DATES {
            return Err(EngineError::LimitExceeded("too many blocked dates"));
        }
        if self.blocked.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("blocked date {id}")));
        }
        if self.blocked.iter().any(|e| e.date == date) {
            return Err(EngineError::AlreadyExists(format!("date {date} is already blocked")));
        }
        let blocked = BlockedDate { id, date, reason };
        self.persist_catalog(&Event::DateBlocked {
            blocked: blocked.clone(),
        })
        .await?;
        Ok(blocked)
    }

    pub async fn unblock_date(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        if !self.blocked.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_catalog(&Event::DateUnblocked { id }).await
    }

    // ── Clients ─────────────────────────────────────────────

    pub async fn create_client(
        &self,
        id: Ulid,
        email: &str,
        name: Option<String>,
        phone: Option<String>,
    ) -> Result<Client, EngineError> {
        let email = normalize_email(email)?;
        check_len(&name, MAX_NAME_LEN, "client name too long")?;
        check_len(&phone, MAX_PHONE_LEN, "phone too long")?;

        let _catalog = self.catalog_lock.write().await;
        if self.clients.len() >= MAX_CLIENTS {
            return Err(EngineError::LimitExceeded("too many clients"));
        }
        if self.clients.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("client {id}")));
        }
        if self.client_emails.contains_key(&email) {
            return Err(EngineError::AlreadyExists(format!("a client with email {email} already exists")));
        }
        let client = Client { id, email, name, phone };
        self.persist_catalog(&Event::ClientSaved {
            client: client.clone(),
        })
        .await?;
        Ok(client)
    }

    /// `None` leaves a field untouched.
    pub async fn update_client(
        &self,
        id: Ulid,
        name: Option<String>,
        phone: Option<String>,
    ) -> Result<Client, EngineError> {
        check_len(&name, MAX_NAME_LEN, "client name too long")?;
        check_len(&phone, MAX_PHONE_LEN, "phone too long")?;

        let _catalog = self.catalog_lock.write().await;
        let mut client = self.get_client(&id).ok_or(EngineError::NotFound(id))?;
        if name.is_some() {
            client.name = name;
        }
        if phone.is_some() {
            client.phone = phone;
        }
        self.persist_catalog(&Event::ClientSaved {
            client: client.clone(),
        })
        .await?;
        Ok(client)
    }

    /// Refused with `InUse` while the client has appointments.
    pub async fn delete_client(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        if !self.clients.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.count_appointments(|a| a.client_id == id).await > 0 {
            return Err(EngineError::InUse(id));
        }
        self.persist_catalog(&Event::ClientDeleted { id }).await
    }

    // ── Appointments ────────────────────────────────────────

    /// Book an appointment. The conflict guard runs under the date's write
    /// lock, immediately before the WAL append, so two concurrent requests for
    /// the same slot can never both succeed.
    pub async fn create_appointment(&self, req: NewAppointment) -> Result<Appointment, EngineError> {
        let result = self.create_appointment_inner(req).await;
        let outcome = match &result {
            Ok(_) => "created",
            Err(EngineError::SlotUnavailable(_)) => "conflict",
            Err(_) => "rejected",
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn create_appointment_inner(&self, req: NewAppointment) -> Result<Appointment, EngineError> {
        check_len(&req.notes, MAX_NOTES_LEN, "notes too long")?;

        // Identify upserts the client, so it needs the catalog exclusively.
        let (_shared, _exclusive) = match &req.client {
            ClientRef::Existing(_) => (Some(self.catalog_lock.read().await), None),
            ClientRef::Identify { .. } => (None, Some(self.catalog_lock.write().await)),
        };

        let service = self
            .get_service(&req.service_id)
            .ok_or(EngineError::NotFound(req.service_id))?;
        let span = appointment_span(req.start, req.end, service.duration_min)?;

        let (client_id, upsert) = match req.client {
            ClientRef::Existing(client_id) => {
                if !self.clients.contains_key(&client_id) {
                    return Err(EngineError::NotFound(client_id));
                }
                (client_id, None)
            }
            ClientRef::Identify { email, name, phone } => {
                if !service.active {
                    return Err(EngineError::ServiceInactive(service.id));
                }
                let email = normalize_email(&email)?;
                let name = required_field(name, "client name is required")?;
                let phone = required_field(phone, "phone is required")?;
                check_len(&name, MAX_NAME_LEN, "client name too long")?;
                check_len(&phone, MAX_PHONE_LEN, "phone too long")?;
                let client = match self.client_emails.get(&email).map(|e| *e.value()) {
                    Some(existing) => {
                        let mut client = self.get_client(&existing).ok_or(EngineError::NotFound(existing))?;
                        client.name = name;
                        client.phone = phone;
                        client
                    }
                    None => {
                        if self.clients.len() >= MAX_CLIENTS {
                            return Err(EngineError::LimitExceeded("too many clients"));
                        }
                        Client {
                            id: Ulid::new(),
                            email,
                            name,
                            phone,
                        }
                    }
                };
                (client.id, Some(client))
            }
        };

        if self.appointment_dates.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(format!("appointment {}", req.id)));
        }

        let day = self.day(req.date);
        let mut guard = day.write().await;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many appointments on this date"));
        }

        check_no_conflict(&guard, &span, None)?;

        if let Some(client) = upsert {
            self.persist_catalog(&Event::ClientSaved { client }).await?;
        }

        let appointment = Appointment {
            id: req.id,
            client_id,
            service_id: service.id,
            date: req.date,
            span,
            status: req.status.unwrap_or(AppointmentStatus::Pending),
            notes: req.notes,
        };
        let event = Event::AppointmentCreated {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!("booked {} on {} {}", appointment.id, appointment.date, appointment.span);
        Ok(appointment)
    }

    /// Change status and/or start time. A new start recomputes the end from the
    /// service duration and re-runs the conflict guard, excluding the
    /// appointment itself.
    pub async fn update_appointment(
        &self,
        id: Ulid,
        patch: AppointmentPatch,
    ) -> Result<Appointment, EngineError> {
        let (date, mut guard) = self.resolve_appointment_write(&id).await?;
        let current = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;

        let new_status = match patch.status {
            Some(next) if next != current.status => {
                if !current.status.can_transition_to(next) {
                    return Err(EngineError::IllegalTransition {
                        from: current.status,
                        to: next,
                    });
                }
                Some(next)
            }
            _ => None,
        };

        let new_span = match patch.start {
            Some(start) => {
                if !current.status.is_occupying() {
                    return Err(EngineError::NotActive(id));
                }
                let service = self
                    .get_service(&current.service_id)
                    .ok_or(EngineError::NotFound(current.service_id))?;
                let span = appointment_span(start, None, service.duration_min)?;
                let final_status = new_status.unwrap_or(current.status);
                if final_status.is_occupying() {
                    check_no_conflict(&guard, &span, Some(id))?;
                }
                (span != current.span).then_some(span)
            }
            None => None,
        };

        if new_span.is_some() || new_status.is_some() {
            let event = Event::AppointmentUpdated {
                id,
                date,
                span: new_span,
                status: new_status,
            };
            self.persist_and_apply(&mut guard, &event).await?;
        }

        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn delete_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let (date, mut guard) = self.resolve_appointment_write(&id).await?;
        let event = Event::AppointmentDeleted { id, date };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── WAL maintenance ─────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state. Holds the catalog lock and every day's read lock until
    /// the rewrite is durable so no append can slip in between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;

        let mut events = Vec::new();
        for e in self.services.iter() {
            events.push(Event::ServiceCreated {
                service: e.value().clone(),
            });
        }
        for e in self.weekly.iter() {
            events.push(Event::WeeklyAvailabilitySet { row: e.value().clone() });
        }
        for e in self.blocked.iter() {
            events.push(Event::DateBlocked {
                blocked: e.value().clone(),
            });
        }
        for e in self.clients.iter() {
            events.push(Event::ClientSaved {
                client: e.value().clone(),
            });
        }

        let mut days: Vec<_> = self.days.iter().map(|e| (*e.key(), Arc::clone(e.value()))).collect();
        days.sort_by_key(|(date, _)| *date);
        let mut guards = Vec::with_capacity(days.len());
        for (_, day) in days {
            let guard = day.read_owned().await;
            for appointment in &guard.appointments {
                events.push(Event::AppointmentCreated {
                    appointment: appointment.clone(),
                });
            }
            guards.push(guard);
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
