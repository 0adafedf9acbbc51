use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use chrono::{NaiveDate, NaiveTime, Timelike, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::limits::MAX_SLOTS_PER_DAY;
use crate::model::Minutes;

/// Half-open time-of-day range `[start, end)` in the policy's reference zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, ConfigError> {
        if start >= end {
            return Err(ConfigError::InvalidRange(format!(
                "{} is not before {}",
                start.format("%H:%M"),
                end.format("%H:%M")
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse `HH:MM-HH:MM`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let (a, b) = s
            .split_once('-')
            .ok_or_else(|| ConfigError::InvalidRange(format!("expected HH:MM-HH:MM, got {s:?}")))?;
        let parse = |t: &str| {
            NaiveTime::parse_from_str(t.trim(), "%H:%M")
                .map_err(|e| ConfigError::InvalidRange(format!("{t:?}: {e}")))
        };
        Self::new(parse(a)?, parse(b)?)
    }

    pub fn duration_minutes(&self) -> Minutes {
        minute_of_day(self.end) - minute_of_day(self.start)
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_time(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }
}

impl TryFrom<String> for TimeRange {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        TimeRange::parse(&s)
    }
}

impl From<TimeRange> for String {
    fn from(r: TimeRange) -> String {
        r.to_string()
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

pub(crate) fn minute_of_day(t: NaiveTime) -> Minutes {
    t.hour() * 60 + t.minute()
}

pub fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

pub fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

const WEEKDAY_NAMES: [&str; 5] = ["monday", "tuesday", "wednesday", "thursday", "friday"];
const WEEKEND_NAMES: [&str; 2] = ["saturday", "sunday"];

fn default_timezone() -> Tz {
    Tz::UTC
}

fn default_interval() -> Minutes {
    30
}

fn default_durations() -> Vec<Minutes> {
    vec![30, 60]
}

/// Declarative business hours. Loaded once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessHoursPolicy {
    /// Reference zone the ranges below are expressed in.
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default = "default_interval")]
    pub interval_minutes: Minutes,
    /// Meeting lengths a slot may be booked for.
    #[serde(default = "default_durations")]
    pub durations: Vec<Minutes>,
    /// Monday–Friday, keyed by lowercase day name.
    #[serde(default)]
    pub weekday: BTreeMap<String, Vec<TimeRange>>,
    /// Saturday and Sunday, keyed by lowercase day name.
    #[serde(default)]
    pub weekend: BTreeMap<String, Vec<TimeRange>>,
    #[serde(default)]
    pub holidays: BTreeSet<NaiveDate>,
    /// Replaces (never merges with) the default ranges for that date.
    #[serde(default)]
    pub exceptions: BTreeMap<NaiveDate, Vec<TimeRange>>,
    #[serde(default)]
    pub lunch_break: Option<TimeRange>,
}

impl Default for BusinessHoursPolicy {
    /// Mon–Fri 09:00–17:00 with a 12:00–13:00 lunch, Saturday mornings, Sunday closed.
    fn default() -> Self {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default();
        let range = |a, b| TimeRange { start: a, end: b };
        let weekday_ranges = vec![range(t(9, 0), t(12, 0)), range(t(13, 0), t(17, 0))];
        Self {
            timezone: default_timezone(),
            interval_minutes: default_interval(),
            durations: default_durations(),
            weekday: WEEKDAY_NAMES
                .iter()
                .map(|d| (d.to_string(), weekday_ranges.clone()))
                .collect(),
            weekend: BTreeMap::from([("saturday".to_string(), vec![range(t(10, 0), t(14, 0))])]),
            holidays: BTreeSet::new(),
            exceptions: BTreeMap::new(),
            lunch_break: Some(range(t(12, 0), t(13, 0))),
        }
    }
}

impl BusinessHoursPolicy {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let policy: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_minutes == 0 || self.interval_minutes > 24 * 60 {
            return Err(ConfigError::Invalid("interval_minutes must be within 1..=1440".into()));
        }
        if (24 * 60 / self.interval_minutes) as usize > MAX_SLOTS_PER_DAY {
            return Err(ConfigError::Invalid("interval_minutes too small".into()));
        }
        if self.durations.is_empty() || self.durations.contains(&0) {
            return Err(ConfigError::Invalid("durations must be non-empty and positive".into()));
        }
        for day in self.weekday.keys() {
            if !WEEKDAY_NAMES.contains(&day.as_str()) {
                return Err(ConfigError::Invalid(format!("{day:?} is not a weekday name")));
            }
        }
        for day in self.weekend.keys() {
            if !WEEKEND_NAMES.contains(&day.as_str()) {
                return Err(ConfigError::Invalid(format!("{day:?} is not a weekend day name")));
            }
        }
        // Deserialization goes through TimeRange::parse; this catches ranges built in code.
        let all = self
            .weekday
            .values()
            .chain(self.weekend.values())
            .chain(self.exceptions.values())
            .flatten()
            .chain(self.lunch_break.iter());
        for r in all {
            TimeRange::new(r.start, r.end)?;
        }
        Ok(())
    }

    /// Default ranges for a weekday, ignoring holidays and exceptions.
    pub fn default_ranges(&self, day: Weekday) -> &[TimeRange] {
        let table = if is_weekend(day) { &self.weekend } else { &self.weekday };
        table.get(day_name(day)).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Builder used by tests and embedders: set the same ranges on several days.
    pub fn with_days(mut self, days: &[Weekday], ranges: &[TimeRange]) -> Self {
        for &day in days {
            let table = if is_weekend(day) { &mut self.weekend } else { &mut self.weekday };
            table.insert(day_name(day).to_string(), ranges.to_vec());
        }
        self
    }
}
