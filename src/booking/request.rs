use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::catalog::MeetingCatalog;
use crate::limits::*;
use crate::model::{MeetingType, Minutes};

use super::error::{BookingError, FieldError};

/// Boundary shape of a schedule request. Everything arrives as text so that
/// validation can report every bad field at once instead of failing on the first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleRequest {
    pub car_id: String,
    #[serde(rename = "type")]
    pub meeting_type: String,
    pub slot_id: String,
    pub scheduled_date: Option<String>,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub notes: Option<String>,
    pub timezone: String,
    pub duration: Option<Minutes>,
    pub owner_id: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RescheduleRequest {
    pub meeting_id: String,
    pub new_slot_id: String,
    pub new_date: Option<String>,
}

/// A schedule request that passed field validation. The slot is not resolved yet.
#[derive(Debug, Clone)]
pub(crate) struct ValidSchedule {
    pub car_id: String,
    pub meeting_type: MeetingType,
    pub slot_id: String,
    pub date: Option<NaiveDate>,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub notes: Option<String>,
    pub timezone: Tz,
    pub duration: Option<Minutes>,
    pub owner_id: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct ValidReschedule {
    pub meeting_id: Ulid,
    pub new_slot_id: String,
    pub new_date: Option<NaiveDate>,
}

/// Collects field errors while a request is checked.
#[derive(Default)]
struct Checker {
    errors: Vec<FieldError>,
}

impl Checker {
    fn fail(&mut self, field: &'static str, reason: impl Into<String>) {
        self.errors.push(FieldError::new(field, reason));
    }

    /// Trimmed required text. Blank counts as missing.
    fn required(&mut self, field: &'static str, value: &str, max: usize) -> String {
        let value = value.trim();
        if value.is_empty() {
            self.fail(field, "required");
        } else if value.len() > max {
            self.fail(field, format!("longer than {max} bytes"));
        }
        value.to_string()
    }

    /// Trimmed optional text; blank becomes `None`.
    fn optional(&mut self, field: &'static str, value: Option<&str>, max: usize) -> Option<String> {
        let value = value.map(str::trim).filter(|v| !v.is_empty())?;
        if value.len() > max {
            self.fail(field, format!("longer than {max} bytes"));
        }
        Some(value.to_string())
    }

    fn date(&mut self, field: &'static str, value: Option<&str>) -> Option<NaiveDate> {
        let value = value.map(str::trim).filter(|v| !v.is_empty())?;
        match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
            Ok(d) => Some(d),
            Err(_) => {
                self.fail(field, "expected YYYY-MM-DD");
                None
            }
        }
    }

    fn finish<T>(self, value: impl FnOnce() -> T) -> Result<T, BookingError> {
        if self.errors.is_empty() {
            Ok(value())
        } else {
            Err(BookingError::Validation(self.errors))
        }
    }
}

/// Loose shape check: one `@`, a non-empty local part, a dotted domain, no spaces.
pub fn is_valid_email(email: &str) -> bool {
    if email.len() > MAX_EMAIL_LEN || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
}

pub fn parse_timezone(name: &str) -> Result<Tz, BookingError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| BookingError::field("timezone", format!("unknown time zone {name:?}")))
}

pub fn parse_meeting_id(id: &str) -> Result<Ulid, BookingError> {
    Ulid::from_string(id.trim()).map_err(|_| BookingError::field("meeting_id", "not a valid meeting id"))
}

impl ScheduleRequest {
    pub(crate) fn validate(&self, catalog: &MeetingCatalog) -> Result<ValidSchedule, BookingError> {
        let mut c = Checker::default();
        let car_id = c.required("car_id", &self.car_id, MAX_FIELD_LEN);
        let slot_id = c.required("slot_id", &self.slot_id, MAX_FIELD_LEN);
        let name = c.required("name", &self.name, MAX_FIELD_LEN);
        let email = c.required("email", &self.email, MAX_EMAIL_LEN);
        let phone = c.optional("phone", self.phone.as_deref(), MAX_PHONE_LEN);
        let notes = c.optional("notes", self.notes.as_deref(), MAX_NOTES_LEN);
        let owner_id = c.optional("owner_id", self.owner_id.as_deref(), MAX_FIELD_LEN);
        let idempotency_key = c.optional("idempotency_key", self.idempotency_key.as_deref(), MAX_FIELD_LEN);
        let date = c.date("scheduled_date", self.scheduled_date.as_deref());

        let type_name = self.meeting_type.trim();
        let meeting_type = if type_name.is_empty() {
            c.fail("type", "required");
            None
        } else {
            let parsed = catalog.parse_type(type_name);
            if parsed.is_none() {
                c.fail("type", format!("unknown meeting type {type_name:?}"));
            }
            parsed
        };

        if !email.is_empty() && !is_valid_email(&email) {
            c.fail("email", "invalid format");
        }

        let timezone = if self.timezone.trim().is_empty() {
            c.fail("timezone", "required");
            None
        } else {
            match parse_timezone(&self.timezone) {
                Ok(tz) => Some(tz),
                Err(_) => {
                    c.fail("timezone", format!("unknown time zone {:?}", self.timezone));
                    None
                }
            }
        };

        let date_missing = self.scheduled_date.as_deref().is_none_or(|d| d.trim().is_empty());
        if catalog.legacy_slot(&slot_id).is_some() && date_missing {
            c.fail("scheduled_date", "required for legacy slot ids");
        }
        if self.duration == Some(0) {
            c.fail("duration", "must be positive");
        }

        let duration = self.duration;
        c.finish(move || ValidSchedule {
            car_id,
            // Both set whenever no error was recorded.
            meeting_type: meeting_type.unwrap_or(MeetingType::DealershipVisit),
            slot_id,
            date,
            name,
            email,
            phone,
            notes,
            timezone: timezone.unwrap_or(Tz::UTC),
            duration,
            owner_id,
            idempotency_key,
        })
    }
}

impl RescheduleRequest {
    pub(crate) fn validate(&self) -> Result<ValidReschedule, BookingError> {
        let mut c = Checker::default();
        let meeting_id = match self.meeting_id.trim() {
            "" => {
                c.fail("meeting_id", "required");
                None
            }
            id => match parse_meeting_id(id) {
                Ok(id) => Some(id),
                Err(_) => {
                    c.fail("meeting_id", "not a valid meeting id");
                    None
                }
            },
        };
        let new_slot_id = c.required("new_slot_id", &self.new_slot_id, MAX_FIELD_LEN);
        let new_date = c.date("new_date", self.new_date.as_deref());
        c.finish(move || ValidReschedule {
            meeting_id: meeting_id.unwrap_or_default(),
            new_slot_id,
            new_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ScheduleRequest {
        ScheduleRequest {
            car_id: "car-1".into(),
            meeting_type: "dealership_visit".into(),
            slot_id: "20261019-0900".into(),
            name: "Ada Lovelace".into(),
            email: "ada@example.com".into(),
            timezone: "Europe/Berlin".into(),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_minimal_request() {
        let v = valid().validate(&MeetingCatalog::default()).unwrap();
        assert_eq!(v.meeting_type, MeetingType::DealershipVisit);
        assert_eq!(v.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(v.date, None);
        assert_eq!(v.phone, None);
    }

    #[test]
    fn reports_every_missing_field() {
        let err = ScheduleRequest::default()
            .validate(&MeetingCatalog::default())
            .unwrap_err();
        let mut fields = err.fields();
        fields.sort();
        assert_eq!(fields, vec!["car_id", "email", "name", "slot_id", "timezone", "type"]);
    }

    #[test]
    fn rejects_bad_values() {
        let req = ScheduleRequest {
            meeting_type: "phone_call".into(),
            email: "not-an-email".into(),
            timezone: "Mars/Olympus".into(),
            scheduled_date: Some("19/10/2026".into()),
            duration: Some(0),
            ..valid()
        };
        let err = req.validate(&MeetingCatalog::default()).unwrap_err();
        let mut fields = err.fields();
        fields.sort();
        assert_eq!(fields, vec!["duration", "email", "scheduled_date", "timezone", "type"]);
    }

    #[test]
    fn blank_strings_are_missing() {
        let req = ScheduleRequest {
            name: "   ".into(),
            phone: Some("  ".into()),
            ..valid()
        };
        let err = req.validate(&MeetingCatalog::default()).unwrap_err();
        assert_eq!(err.fields(), vec!["name"]);
        let ok = ScheduleRequest { phone: Some("  ".into()), ..valid() };
        assert_eq!(ok.validate(&MeetingCatalog::default()).unwrap().phone, None);
    }

    #[test]
    fn legacy_slot_needs_date() {
        let req = ScheduleRequest { slot_id: "slot_2".into(), ..valid() };
        let err = req.validate(&MeetingCatalog::default()).unwrap_err();
        assert_eq!(err.fields(), vec!["scheduled_date"]);

        let req = ScheduleRequest {
            slot_id: "slot_2".into(),
            scheduled_date: Some("2026-10-19".into()),
            ..valid()
        };
        assert!(req.validate(&MeetingCatalog::default()).is_ok());
    }

    #[test]
    fn type_must_be_offered_by_catalog() {
        let catalog = MeetingCatalog::with_types(&[MeetingType::DealershipVisit]);
        let req = ScheduleRequest { meeting_type: "video_call_zoom".into(), ..valid() };
        assert_eq!(req.validate(&catalog).unwrap_err().fields(), vec!["type"]);
    }

    #[test]
    fn field_length_limits() {
        let req = ScheduleRequest {
            notes: Some("x".repeat(MAX_NOTES_LEN + 1)),
            car_id: "c".repeat(MAX_FIELD_LEN + 1),
            ..valid()
        };
        let mut fields = req.validate(&MeetingCatalog::default()).unwrap_err().fields();
        fields.sort();
        assert_eq!(fields, vec!["car_id", "notes"]);
    }

    #[test]
    fn email_shapes() {
        assert!(is_valid_email("a@b.co"));
        assert!(is_valid_email("first.last+tag@sub.example.org"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("@b.co"));
        assert!(!is_valid_email("a@@b.co"));
        assert!(!is_valid_email("a b@c.co"));
        assert!(!is_valid_email("a@.co"));
        assert!(!is_valid_email("a@b..co"));
    }

    #[test]
    fn reschedule_validation() {
        let id = Ulid::new();
        let ok = RescheduleRequest {
            meeting_id: id.to_string(),
            new_slot_id: "20261020-1000".into(),
            new_date: Some("2026-10-20".into()),
        };
        let v = ok.validate().unwrap();
        assert_eq!(v.meeting_id, id);
        assert_eq!(v.new_date, NaiveDate::from_ymd_opt(2026, 10, 20));

        let bad = RescheduleRequest {
            meeting_id: "nope".into(),
            ..Default::default()
        };
        let mut fields = bad.validate().unwrap_err().fields();
        fields.sort();
        assert_eq!(fields, vec!["meeting_id", "new_slot_id"]);
    }
}
