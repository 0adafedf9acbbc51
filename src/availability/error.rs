use ulid::Ulid;

use crate::model::SlotKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityError {
    /// Reservation contention: the key is already held.
    SlotUnavailable(SlotKey),
    /// No such slot in the materialized set.
    NotFound(String),
    /// A holder-checked release found someone else's reservation.
    HeldByOther { key: SlotKey, holder: Ulid },
    LimitExceeded(&'static str),
}

impl std::fmt::Display for AvailabilityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AvailabilityError::SlotUnavailable(key) => write!(f, "slot unavailable: {key}"),
            AvailabilityError::NotFound(id) => write!(f, "slot not found: {id}"),
            AvailabilityError::HeldByOther { key, holder } => {
                write!(f, "slot {key} is held by {holder}")
            }
            AvailabilityError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for AvailabilityError {}
