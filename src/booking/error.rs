use ulid::Ulid;

use crate::availability::AvailabilityError;
use crate::model::{MeetingStatus, SlotKey};
use crate::store::StoreError;

/// One rejected request field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

#[derive(Debug)]
pub enum BookingError {
    /// Every offending field, not just the first.
    Validation(Vec<FieldError>),
    SlotUnavailable(SlotKey),
    NotFound(String),
    InvalidState { id: Ulid, status: MeetingStatus },
    Persistence(String),
}

impl BookingError {
    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        BookingError::Validation(vec![FieldError::new(field, reason)])
    }

    /// Stable machine-readable name, used on the wire and in metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "validation",
            BookingError::SlotUnavailable(_) => "slot_unavailable",
            BookingError::NotFound(_) => "not_found",
            BookingError::InvalidState { .. } => "invalid_state",
            BookingError::Persistence(_) => "persistence",
        }
    }

    pub fn fields(&self) -> Vec<&'static str> {
        match self {
            BookingError::Validation(errors) => errors.iter().map(|e| e.field).collect(),
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::Validation(errors) => {
                write!(f, "invalid request: ")?;
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{e}")?;
                }
                Ok(())
            }
            BookingError::SlotUnavailable(key) => write!(f, "slot unavailable: {key}"),
            BookingError::NotFound(what) => write!(f, "not found: {what}"),
            BookingError::InvalidState { id, status } => {
                write!(f, "meeting {id} is {status}")
            }
            BookingError::Persistence(e) => write!(f, "persistence error: {e}"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<AvailabilityError> for BookingError {
    fn from(e: AvailabilityError) -> Self {
        match e {
            AvailabilityError::SlotUnavailable(key) => BookingError::SlotUnavailable(key),
            AvailabilityError::HeldByOther { key, .. } => BookingError::SlotUnavailable(key),
            AvailabilityError::NotFound(what) => BookingError::NotFound(format!("slot {what}")),
            AvailabilityError::LimitExceeded(msg) => BookingError::field("scheduled_date", msg),
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => BookingError::NotFound(format!("meeting {id}")),
            other => BookingError::Persistence(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BookingError {
    fn from(e: serde_json::Error) -> Self {
        BookingError::Persistence(format!("corrupt meeting record: {e}"))
    }
}
