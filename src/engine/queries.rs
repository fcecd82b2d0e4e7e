use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::resolve_slots;
use super::{Engine, EngineError, SharedDay};

impl Engine {
    pub fn get_service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    pub fn get_client(&self, id: &Ulid) -> Option<Client> {
        self.clients.get(id).map(|e| e.value().clone())
    }

    pub fn find_client_by_email(&self, email: &str) -> Option<Client> {
        let id = *self.client_emails.get(&email.trim().to_lowercase())?.value();
        self.get_client(&id)
    }

    /// Ordered by category, then sort order, then name.
    pub fn list_services(&self, active_only: bool) -> Vec<Service> {
        let mut services: Vec<Service> = self
            .services
            .iter()
            .filter(|e| !active_only || e.active)
            .map(|e| e.value().clone())
            .collect();
        services.sort_by(|a, b| {
            (a.category, a.sort_order, &a.name).cmp(&(b.category, b.sort_order, &b.name))
        });
        services
    }

    pub fn list_weekly_availability(&self, active_only: bool) -> Vec<WeeklyAvailability> {
        let mut rows: Vec<WeeklyAvailability> = self
            .weekly
            .iter()
            .filter(|e| !active_only || e.active)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| (r.day_of_week, r.start, r.id));
        rows
    }

    pub fn list_blocked_dates(&self) -> Vec<BlockedDate> {
        let mut dates: Vec<BlockedDate> = self.blocked.iter().map(|e| e.value().clone()).collect();
        dates.sort_by_key(|b| b.date);
        dates
    }

    /// Bookable start times for `service_id` on `date`. Advisory only: booked
    /// appointments are not subtracted, the conflict guard decides at booking time.
    pub fn available_slots(&self, date: NaiveDate, service_id: Ulid) -> Result<Vec<TimeOfDay>, EngineError> {
        let service = self.get_service(&service_id).ok_or(EngineError::NotFound(service_id))?;
        let weekly: Vec<WeeklyAvailability> = self.weekly.iter().map(|e| e.value().clone()).collect();
        let blocked: Vec<BlockedDate> = self
            .blocked
            .iter()
            .filter(|e| e.date == date)
            .map(|e| e.value().clone())
            .collect();
        Ok(resolve_slots(date, service.duration_min, &weekly, &blocked))
    }

    pub async fn get_appointment(&self, id: &Ulid) -> Option<Appointment> {
        let date = self.get_appointment_date(id)?;
        let day = self.existing_day(&date)?;
        let guard = day.read().await;
        guard.get(*id).cloned()
    }

    fn days_sorted(&self) -> Vec<(NaiveDate, SharedDay)> {
        let mut days: Vec<_> = self
            .days
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        days.sort_by_key(|(date, _)| *date);
        days
    }

    /// Ordered by date, then start time.
    pub async fn list_appointments(&self, filter: &AppointmentFilter) -> Vec<Appointment> {
        let days = match filter.date {
            Some(date) => self.existing_day(&date).map(|d| vec![(date, d)]).unwrap_or_default(),
            None => self.days_sorted(),
        };
        let mut out = Vec::new();
        for (_, day) in days {
            let guard = day.read().await;
            out.extend(guard.appointments.iter().filter(|a| filter.matches(a)).cloned());
        }
        out
    }

    pub(super) async fn count_appointments(&self, pred: impl Fn(&Appointment) -> bool) -> usize {
        let mut count = 0;
        for (_, day) in self.days_sorted() {
            let guard = day.read().await;
            count += guard.appointments.iter().filter(|a| pred(a)).count();
        }
        count
    }

    /// Clients with their appointment counts, ordered by name (unnamed last), then email.
    pub async fn list_clients(&self) -> Vec<ClientInfo> {
        let mut counts: HashMap<Ulid, usize> = HashMap::new();
        for (_, day) in self.days_sorted() {
            let guard = day.read().await;
            for a in &guard.appointments {
                *counts.entry(a.client_id).or_default() += 1;
            }
        }
        let mut clients: Vec<ClientInfo> = self
            .clients
            .iter()
            .map(|e| ClientInfo {
                client: e.value().clone(),
                appointment_count: counts.get(e.key()).copied().unwrap_or(0),
            })
            .collect();
        clients.sort_by(|a, b| {
            (a.client.name.is_none(), &a.client.name, &a.client.email)
                .cmp(&(b.client.name.is_none(), &b.client.name, &b.client.email))
        });
        clients
    }

    /// Dashboard counters as of `today`.
    pub async fn stats(&self, today: NaiveDate) -> Stats {
        let mut stats = Stats {
            active_services: self.services.iter().filter(|e| e.active).count(),
            ..Stats::default()
        };
        for (date, day) in self.days_sorted() {
            let guard = day.read().await;
            stats.total_appointments += guard.appointments.len();
            stats.pending_appointments += guard
                .appointments
                .iter()
                .filter(|a| a.status == AppointmentStatus::Pending)
                .count();
            if date == today {
                stats.today_appointments += guard.appointments.len();
            }
        }
        stats
    }
}
