use ulid::Ulid;

use crate::model::AppointmentStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(String),
    /// The proposed time overlaps this pending/confirmed appointment.
    SlotUnavailable(Ulid),
    InvalidRange(String),
    IllegalTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    /// Cancelled and completed appointments can't be moved.
    NotActive(Ulid),
    ServiceInactive(Ulid),
    /// Still referenced by appointments.
    InUse(Ulid),
    Validation(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::SlotUnavailable(id) => write!(
                f,
                "this time slot is already booked (appointment {id}); please choose another time"
            ),
            EngineError::InvalidRange(msg) => write!(f, "invalid range: {msg}"),
            EngineError::IllegalTransition { from, to } => {
                write!(f, "illegal status transition: {from} -> {to}")
            }
            EngineError::NotActive(id) => {
                write!(f, "appointment {id} is cancelled or completed and cannot be moved")
            }
            EngineError::ServiceInactive(id) => write!(f, "service {id} is not offered"),
            EngineError::InUse(id) => write!(f, "{id} is still referenced by appointments"),
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
