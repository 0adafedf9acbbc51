use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

/// Meeting lengths and slot steps are whole minutes.
pub type Minutes = u32;

/// A JSON-serializable record as held by a record store.
pub type Record = Map<String, Value>;

const SLOT_ID_FORMAT: &str = "%Y%m%d-%H%M";

/// Build the slot id for a reference-zone date and time-of-day: `YYYYMMDD-HHMM`.
pub fn slot_id_for(date: NaiveDate, time: NaiveTime) -> String {
    date.and_time(time).format(SLOT_ID_FORMAT).to_string()
}

/// Inverse of [`slot_id_for`]. `None` for anything that is not a generated slot id.
pub fn parse_slot_id(id: &str) -> Option<(NaiveDate, NaiveTime)> {
    if id.len() != 13 {
        return None;
    }
    chrono::NaiveDateTime::parse_from_str(id, SLOT_ID_FORMAT)
        .ok()
        .map(|dt| (dt.date(), dt.time()))
}

/// Reservation index key: one slot on one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub slot_id: String,
}

impl SlotKey {
    pub fn new(date: NaiveDate, slot_id: impl Into<String>) -> Self {
        Self {
            date,
            slot_id: slot_id.into(),
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.date, self.slot_id)
    }
}

/// A materialized slot snapshot. `available` reflects the reservation index at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub durations: Vec<Minutes>,
    pub available: bool,
}

impl Slot {
    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.date, self.id.clone())
    }
}

/// Boundary shape of one entry in a slot listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotListing {
    pub id: String,
    /// `HH:MM` in the caller's requested zone.
    pub time: String,
    pub available: bool,
    pub durations: Vec<Minutes>,
    /// RFC 3339 instant with the requested zone's offset.
    pub starts_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingType {
    DealershipVisit,
    VirtualTour,
    VideoCallZoom,
    VideoCallGoogleMeet,
    VideoCallTeams,
    VideoCallWhatsapp,
}

impl MeetingType {
    pub const ALL: [MeetingType; 6] = [
        MeetingType::DealershipVisit,
        MeetingType::VirtualTour,
        MeetingType::VideoCallZoom,
        MeetingType::VideoCallGoogleMeet,
        MeetingType::VideoCallTeams,
        MeetingType::VideoCallWhatsapp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingType::DealershipVisit => "dealership_visit",
            MeetingType::VirtualTour => "virtual_tour",
            MeetingType::VideoCallZoom => "video_call_zoom",
            MeetingType::VideoCallGoogleMeet => "video_call_google_meet",
            MeetingType::VideoCallTeams => "video_call_teams",
            MeetingType::VideoCallWhatsapp => "video_call_whatsapp",
        }
    }
}

impl fmt::Display for MeetingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeetingType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MeetingType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Scheduled,
    Cancelled,
}

impl MeetingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingStatus::Scheduled => "scheduled",
            MeetingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_duration() -> Minutes {
    30
}

/// A booked appointment. Canonical schema; see [`normalize_record`] for older layouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Ulid,
    pub car_id: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(rename = "type")]
    pub meeting_type: MeetingType,
    pub slot_id: String,
    pub scheduled_date: NaiveDate,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub timezone: String,
    #[serde(default = "default_duration")]
    pub duration: Minutes,
    pub status: MeetingStatus,
    #[serde(default)]
    pub join_url: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Meeting {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(self.scheduled_date, self.slot_id.clone())
    }

    /// Reference-zone start time, when the slot id is a generated one.
    pub fn scheduled_time(&self) -> Option<NaiveTime> {
        parse_slot_id(&self.slot_id).map(|(_, t)| t)
    }

    pub fn is_scheduled(&self) -> bool {
        self.status == MeetingStatus::Scheduled
    }

    pub fn to_record(&self) -> Result<Record, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => unreachable!("Meeting serializes to a JSON object"),
        }
    }

    /// Read a stored record, normalizing historical field names first.
    pub fn from_record(record: Record) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(normalize_record(record)))
    }
}

/// Historical key → canonical key. Older writers used these names for the same values.
const LEGACY_FIELDS: &[(&str, &str)] = &[
    ("listing_id", "car_id"),
    ("dealer_id", "owner_id"),
    ("meeting_type", "type"),
    ("date", "scheduled_date"),
    ("contact_name", "name"),
    ("requester_name", "name"),
    ("contact_email", "email"),
    ("contact_phone", "phone"),
];

/// Rewrite legacy keys into the canonical schema. The canonical key wins when both are present.
pub fn normalize_record(mut record: Record) -> Record {
    for (legacy, canonical) in LEGACY_FIELDS {
        if let Some(value) = record.remove(*legacy) {
            let canonical_missing = record.get(*canonical).is_none_or(Value::is_null);
            if canonical_missing && !value.is_null() {
                record.insert((*canonical).to_string(), value);
            }
        }
    }
    record
}

/// Legacy keys that may hold the value of `canonical` in older records.
pub fn legacy_names_for(canonical: &str) -> impl Iterator<Item = &'static str> + '_ {
    LEGACY_FIELDS
        .iter()
        .filter(move |(_, c)| *c == canonical)
        .map(|(legacy, _)| *legacy)
}

/// WAL record format. Flat, no nesting.
/// Record bodies travel as JSON text; bincode cannot round-trip `serde_json::Value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RecordInserted { id: Ulid, body: String },
    RecordUpdated { id: Ulid, patch: String },
    RecordDeleted { id: Ulid },
}

impl Event {
    pub fn record_id(&self) -> Ulid {
        match self {
            Event::RecordInserted { id, .. }
            | Event::RecordUpdated { id, .. }
            | Event::RecordDeleted { id } => *id,
        }
    }
}
