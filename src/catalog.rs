use chrono::NaiveTime;
use ulid::Ulid;

use crate::model::MeetingType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingTypeInfo {
    pub kind: MeetingType,
    pub label: &'static str,
    /// Set for virtual types: the provider tag used in join URLs.
    pub provider: Option<&'static str>,
}

/// Entry of the fixed slot table used by the simplified booking flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacySlot {
    pub id: &'static str,
    pub time: NaiveTime,
}

/// Read-only meeting configuration handed to the booking service.
#[derive(Debug, Clone)]
pub struct MeetingCatalog {
    types: Vec<MeetingTypeInfo>,
    legacy_slots: Vec<LegacySlot>,
}

const fn info(kind: MeetingType, label: &'static str, provider: Option<&'static str>) -> MeetingTypeInfo {
    MeetingTypeInfo { kind, label, provider }
}

const DEFAULT_TYPES: [MeetingTypeInfo; 6] = [
    info(MeetingType::DealershipVisit, "Visit at the dealership", None),
    info(MeetingType::VirtualTour, "Guided virtual tour", Some("virtual_tour")),
    info(MeetingType::VideoCallZoom, "Video call (Zoom)", Some("zoom")),
    info(MeetingType::VideoCallGoogleMeet, "Video call (Google Meet)", Some("google_meet")),
    info(MeetingType::VideoCallTeams, "Video call (Teams)", Some("teams")),
    info(MeetingType::VideoCallWhatsapp, "Video call (WhatsApp)", Some("whatsapp")),
];

const LEGACY_SLOT_TABLE: [(&str, u32); 8] = [
    ("slot_1", 9),
    ("slot_2", 10),
    ("slot_3", 11),
    ("slot_4", 12),
    ("slot_5", 14),
    ("slot_6", 15),
    ("slot_7", 16),
    ("slot_8", 17),
];

impl Default for MeetingCatalog {
    fn default() -> Self {
        Self {
            types: DEFAULT_TYPES.to_vec(),
            legacy_slots: LEGACY_SLOT_TABLE
                .iter()
                .filter_map(|&(id, hour)| {
                    NaiveTime::from_hms_opt(hour, 0, 0).map(|time| LegacySlot { id, time })
                })
                .collect(),
        }
    }
}

impl MeetingCatalog {
    /// Catalog offering only `kinds` (e.g. a dealer without video calls).
    pub fn with_types(kinds: &[MeetingType]) -> Self {
        let mut catalog = Self::default();
        catalog.types.retain(|t| kinds.contains(&t.kind));
        catalog
    }

    pub fn types(&self) -> &[MeetingTypeInfo] {
        &self.types
    }

    fn info(&self, kind: MeetingType) -> Option<&MeetingTypeInfo> {
        self.types.iter().find(|t| t.kind == kind)
    }

    /// Parse an offered meeting type name.
    pub fn parse_type(&self, name: &str) -> Option<MeetingType> {
        let kind = name.parse::<MeetingType>().ok()?;
        self.info(kind).map(|t| t.kind)
    }

    pub fn is_valid_type(&self, name: &str) -> bool {
        self.parse_type(name).is_some()
    }

    pub fn is_virtual(&self, kind: MeetingType) -> bool {
        self.provider(kind).is_some()
    }

    pub fn provider(&self, kind: MeetingType) -> Option<&'static str> {
        self.info(kind).and_then(|t| t.provider)
    }

    /// Join URL for a virtual meeting, `None` for in-person types.
    pub fn join_url(&self, base: &str, kind: MeetingType, meeting_id: Ulid) -> Option<String> {
        let provider = self.provider(kind)?;
        Some(format!("{}/{provider}/{meeting_id}", base.trim_end_matches('/')))
    }

    pub fn legacy_slots(&self) -> &[LegacySlot] {
        &self.legacy_slots
    }

    pub fn legacy_slot(&self, id: &str) -> Option<NaiveTime> {
        self.legacy_slots.iter().find(|s| s.id == id).map(|s| s.time)
    }
}
