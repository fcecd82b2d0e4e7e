use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes in a civil day. `24:00` is the only value allowed to equal it.
pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Wall-clock time in the business's local civil time, stored as minutes since midnight.
///
/// Parsed from and rendered as `"HH:MM"` (24-hour). `"24:00"` is accepted as an
/// end-of-day marker so a schedule can run until midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);

    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        Self::from_minutes(hour * 60 + minute)
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(Self(minutes as u16))
    }

    pub fn minutes(self) -> u32 {
        self.0 as u32
    }

    pub fn hour(self) -> u32 {
        self.minutes() / 60
    }

    pub fn minute(self) -> u32 {
        self.minutes() % 60
    }

    /// `None` when the result would run past the end of the day.
    pub fn checked_add_minutes(self, minutes: u32) -> Option<Self> {
        Self::from_minutes(self.minutes().checked_add(minutes)?)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTimeError(pub String);

impl fmt::Display for ParseTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day {:?} (expected HH:MM)", self.0)
    }
}

impl std::error::Error for ParseTimeError {}

impl FromStr for TimeOfDay {
    type Err = ParseTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimeError(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(err)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(err());
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let hour: u32 = h.parse().map_err(|_| err())?;
        let minute: u32 = m.parse().map_err(|_| err())?;
        TimeOfDay::from_hm(hour, minute).ok_or_else(err)
    }
}

/// Half-open interval `[start, end)` within one civil day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Span {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for empty or inverted ranges.
    pub fn checked(start: TimeOfDay, end: TimeOfDay) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_min(&self) -> u32 {
        self.end.minutes() - self.start.minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Day of week with the Sunday = 0 convention used by the weekly schedule.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceCategory {
    Facial,
    Body,
}

impl ServiceCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceCategory::Facial => "facial",
            ServiceCategory::Body => "body",
        }
    }
}

impl FromStr for ServiceCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "facial" => Ok(ServiceCategory::Facial),
            "body" => Ok(ServiceCategory::Body),
            other => Err(format!("unknown service category: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
        }
    }

    /// Only pending and confirmed appointments hold their time slot.
    pub fn is_occupying(self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::Completed)
    }

    /// The single table of legal status moves.
    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(AppointmentStatus::Pending),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            "completed" => Ok(AppointmentStatus::Completed),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub name_en: Option<String>,
    pub duration_min: u32,
    pub price_cents: u32,
    pub category: ServiceCategory,
    pub active: bool,
    pub sort_order: u32,
}

/// Recurring open hours for one weekday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyAvailability {
    pub id: Ulid,
    /// 0 = Sunday ... 6 = Saturday.
    pub day_of_week: u8,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedDate {
    pub id: Ulid,
    pub date: NaiveDate,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Ulid,
    /// Stored lowercased; unique across clients.
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub client_id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
}

/// Every appointment booked on one calendar date, sorted by start time.
#[derive(Debug, Clone)]
pub struct DaySchedule {
    pub date: NaiveDate,
    pub appointments: Vec<Appointment>,
}

impl DaySchedule {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by `span.start`.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments (of any status) whose span overlaps `query`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }
}

/// The WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceCreated { service: Service },
    ServiceUpdated { service: Service },
    ServiceDeleted { id: Ulid },
    WeeklyAvailabilitySet { row: WeeklyAvailability },
    WeeklyAvailabilityRemoved { id: Ulid },
    DateBlocked { blocked: BlockedDate },
    DateUnblocked { id: Ulid },
    ClientSaved { client: Client },
    ClientDeleted { id: Ulid },
    AppointmentCreated { appointment: Appointment },
    /// A status change and/or a move, written as one record so a combined
    /// edit is never half-applied.
    AppointmentUpdated {
        id: Ulid,
        date: NaiveDate,
        span: Option<Span>,
        status: Option<AppointmentStatus>,
    },
    AppointmentDeleted { id: Ulid, date: NaiveDate },
}

impl Event {
    /// The date whose schedule this event mutates, if any.
    pub fn appointment_date(&self) -> Option<NaiveDate> {
        match self {
            Event::AppointmentCreated { appointment } => Some(appointment.date),
            Event::AppointmentUpdated { date, .. }
            | Event::AppointmentDeleted { date, .. } => Some(*date),
            _ => None,
        }
    }
}

// ── Command inputs ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewService {
    pub id: Ulid,
    pub name: String,
    pub name_en: Option<String>,
    pub duration_min: u32,
    pub price_cents: u32,
    pub category: ServiceCategory,
    pub active: bool,
}

/// Partial service update; `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServicePatch {
    pub name: Option<String>,
    pub name_en: Option<Option<String>>,
    pub duration_min: Option<u32>,
    pub price_cents: Option<u32>,
    pub category: Option<ServiceCategory>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WeeklyPatch {
    pub day_of_week: Option<u8>,
    pub start: Option<TimeOfDay>,
    pub end: Option<TimeOfDay>,
    pub active: Option<bool>,
}

/// Who the appointment is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRef {
    /// Admin bookings name an existing client directly.
    Existing(Ulid),
    /// Self-service bookings identify by email; the client record is created
    /// or refreshed with the supplied name and phone.
    Identify {
        email: String,
        name: Option<String>,
        phone: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    /// Defaults to `start + service duration`.
    pub end: Option<TimeOfDay>,
    pub client: ClientRef,
    pub notes: Option<String>,
    /// Admin override of the initial `Pending` status.
    pub status: Option<AppointmentStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppointmentPatch {
    pub status: Option<AppointmentStatus>,
    /// New start time; the end is recomputed from the service duration.
    pub start: Option<TimeOfDay>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppointmentFilter {
    pub date: Option<NaiveDate>,
    pub status: Option<AppointmentStatus>,
    pub client_id: Option<Ulid>,
}

impl AppointmentFilter {
    pub fn matches(&self, appointment: &Appointment) -> bool {
        self.date.is_none_or(|d| appointment.date == d)
            && self.status.is_none_or(|s| appointment.status == s)
            && self.client_id.is_none_or(|c| appointment.client_id == c)
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client: Client,
    pub appointment_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub pending_appointments: usize,
    pub today_appointments: usize,
    pub total_appointments: usize,
    pub active_services: usize,
}
