use ulid::Ulid;

use crate::model::SessionStatus;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or out-of-range input.
    Validation(String),
    /// New slot overlaps an existing slot (the offender's id).
    Overlap(Ulid),
    NotFound(Ulid),
    /// Actor is not a participant, or lacks authority over the field.
    Forbidden(Ulid),
    /// No declared slot matches the requested date/time.
    InvalidSlot,
    /// Another active session already occupies the requested time.
    SlotTaken,
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
    /// Structural conflict, e.g. deleting a slot with future sessions.
    Conflict(usize),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation: {msg}"),
            EngineError::Overlap(id) => write!(f, "overlaps existing slot: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Forbidden(id) => write!(f, "forbidden for actor: {id}"),
            EngineError::InvalidSlot => {
                write!(f, "no available slot matches the requested time")
            }
            EngineError::SlotTaken => write!(f, "time slot is already booked"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid transition: {from} -> {to}")
            }
            EngineError::Conflict(n) => {
                write!(f, "conflict: {n} future session(s) reference this slot")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
