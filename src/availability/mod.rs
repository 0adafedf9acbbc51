mod error;
pub mod generator;

pub use error::AvailabilityError;
pub use generator::{generate_slots, ranges_for, slot_times, Candidate};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use ulid::Ulid;

use crate::limits::MAX_GENERATION_WINDOW_DAYS;
use crate::model::*;
use crate::policy::BusinessHoursPolicy;

/// Slot as materialized for a date. Never deleted once generated.
#[derive(Debug, Clone)]
struct SlotTemplate {
    id: String,
    time: NaiveTime,
    durations: Vec<Minutes>,
}

/// All slots of one date, sorted by time.
#[derive(Debug, Default)]
struct DaySlots {
    slots: Vec<SlotTemplate>,
}

impl DaySlots {
    fn find(&self, slot_id: &str) -> Option<&SlotTemplate> {
        self.slots.iter().find(|s| s.id == slot_id)
    }
}

/// One entry of the reservation index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hold {
    /// Meeting holding the slot.
    pub holder: Ulid,
    pub since: Instant,
}

/// Materialized slots plus the reservation index.
///
/// The reservation index is the single source of truth for "is this slot taken".
/// `reserve` is a check-and-set through the map entry API: the shard lock is held
/// across the vacancy check and the insert, so concurrent callers on one key see
/// exactly one success.
pub struct AvailabilityStore {
    policy: Arc<BusinessHoursPolicy>,
    days: DashMap<NaiveDate, Arc<DaySlots>>,
    held: DashMap<SlotKey, Hold>,
}

impl AvailabilityStore {
    pub fn new(policy: Arc<BusinessHoursPolicy>) -> Self {
        Self {
            policy,
            days: DashMap::new(),
            held: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &BusinessHoursPolicy {
        &self.policy
    }

    /// Today in the policy's reference zone.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.policy.timezone).date_naive()
    }

    /// The instant a reference-zone slot starts. `None` inside a DST gap.
    pub fn starts_at(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
        self.policy
            .timezone
            .from_local_datetime(&date.and_time(time))
            .earliest()
    }

    // ── Generation ───────────────────────────────────────────

    /// Materialize every date in `[start, end]` that has not been generated yet.
    /// Re-running over a covered window is a no-op. Returns the number of new days.
    pub fn ensure_generated(&self, start: NaiveDate, end: NaiveDate) -> Result<usize, AvailabilityError> {
        if end < start {
            return Ok(0);
        }
        if (end - start).num_days() >= MAX_GENERATION_WINDOW_DAYS {
            return Err(AvailabilityError::LimitExceeded("generation window too wide"));
        }
        let mut created = 0;
        let mut date = start;
        while date <= end {
            if let Entry::Vacant(v) = self.days.entry(date) {
                v.insert(Arc::new(self.build_day(date)));
                created += 1;
            }
            date = match date.checked_add_days(Days::new(1)) {
                Some(next) => next,
                None => break,
            };
        }
        if created > 0 {
            debug!("generated slots for {created} new day(s) in {start}..={end}");
            metrics::gauge!(crate::observability::GENERATED_DAYS).set(self.days.len() as f64);
        }
        Ok(created)
    }

    /// Number of dates materialized so far.
    pub fn generated_days(&self) -> usize {
        self.days.len()
    }

    fn build_day(&self, date: NaiveDate) -> DaySlots {
        let slots = generate_slots(date, &self.policy)
            .into_iter()
            .map(|c| SlotTemplate {
                id: slot_id_for(date, c.time),
                time: c.time,
                durations: c.durations,
            })
            .collect();
        DaySlots { slots }
    }

    /// Lazy backfill: the date's slots, generating them on first read.
    fn day(&self, date: NaiveDate) -> Arc<DaySlots> {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(self.build_day(date)))
            .value()
            .clone()
    }

    // ── Queries ──────────────────────────────────────────────

    fn snapshot(&self, date: NaiveDate, t: &SlotTemplate) -> Slot {
        let key = SlotKey::new(date, t.id.clone());
        Slot {
            id: t.id.clone(),
            date,
            time: t.time,
            durations: t.durations.clone(),
            available: !self.held.contains_key(&key),
        }
    }

    /// All slots of a date with their current availability.
    pub fn slots_for(&self, date: NaiveDate) -> Vec<Slot> {
        let day = self.day(date);
        day.slots.iter().map(|t| self.snapshot(date, t)).collect()
    }

    /// Slot listing for `date`, with times shown in `zone`.
    /// Reference-zone times that do not exist (DST gap) are left out.
    pub fn list_slots(&self, date: NaiveDate, zone: Tz) -> Vec<SlotListing> {
        self.slots_for(date)
            .into_iter()
            .filter_map(|slot| {
                let shown = self.starts_at(date, slot.time)?.with_timezone(&zone);
                Some(SlotListing {
                    id: slot.id,
                    time: shown.format("%H:%M").to_string(),
                    available: slot.available,
                    durations: slot.durations,
                    starts_at: shown.to_rfc3339(),
                })
            })
            .collect()
    }

    pub fn get_slot(&self, slot_id: &str) -> Result<Slot, AvailabilityError> {
        let (date, _) =
            parse_slot_id(slot_id).ok_or_else(|| AvailabilityError::NotFound(slot_id.to_string()))?;
        let day = self.day(date);
        day.find(slot_id)
            .map(|t| self.snapshot(date, t))
            .ok_or_else(|| AvailabilityError::NotFound(slot_id.to_string()))
    }

    /// The slot behind a reservation key, if the key names a real slot of that date.
    pub fn lookup(&self, key: &SlotKey) -> Result<Slot, AvailabilityError> {
        let day = self.day(key.date);
        day.find(&key.slot_id)
            .map(|t| self.snapshot(key.date, t))
            .ok_or_else(|| AvailabilityError::NotFound(key.to_string()))
    }

    pub fn is_available(&self, key: &SlotKey) -> bool {
        !self.held.contains_key(key)
    }

    pub fn holder_of(&self, key: &SlotKey) -> Option<Ulid> {
        self.held.get(key).map(|h| h.holder)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    // ── Reservation index ────────────────────────────────────

    /// Atomic check-and-set. Exactly one concurrent caller per key succeeds.
    pub fn reserve(&self, key: &SlotKey, holder: Ulid) -> Result<(), AvailabilityError> {
        if let Err(e) = self.lookup(key) {
            metrics::counter!(crate::observability::SLOT_RESERVATIONS_TOTAL, "outcome" => "not_found")
                .increment(1);
            return Err(e);
        }
        match self.held.entry(key.clone()) {
            Entry::Occupied(_) => {
                metrics::counter!(crate::observability::SLOT_RESERVATIONS_TOTAL, "outcome" => "conflict")
                    .increment(1);
                Err(AvailabilityError::SlotUnavailable(key.clone()))
            }
            Entry::Vacant(v) => {
                v.insert(Hold {
                    holder,
                    since: Instant::now(),
                });
                metrics::counter!(crate::observability::SLOT_RESERVATIONS_TOTAL, "outcome" => "reserved")
                    .increment(1);
                Ok(())
            }
        }
    }

    /// Clear the held flag. Idempotent; returns whether the key was held.
    pub fn release(&self, key: &SlotKey) -> bool {
        self.held.remove(key).is_some()
    }

    /// Release only if `holder` holds the key. A free key is not an error;
    /// a key held by someone else is.
    pub fn release_held_by(&self, key: &SlotKey, holder: Ulid) -> Result<bool, AvailabilityError> {
        if self.held.remove_if(key, |_, h| h.holder == holder).is_some() {
            return Ok(true);
        }
        match self.held.get(key) {
            Some(h) => Err(AvailabilityError::HeldByOther {
                key: key.clone(),
                holder: h.holder,
            }),
            None => Ok(false),
        }
    }

    /// Re-hold a key for a live meeting. Used by reconciliation; no slot lookup so
    /// meetings on slots the current policy no longer generates still hold them.
    pub fn restore(&self, key: &SlotKey, holder: Ulid) -> Result<bool, AvailabilityError> {
        match self.held.entry(key.clone()) {
            Entry::Occupied(o) if o.get().holder == holder => Ok(false),
            Entry::Occupied(o) => Err(AvailabilityError::HeldByOther {
                key: key.clone(),
                holder: o.get().holder,
            }),
            Entry::Vacant(v) => {
                v.insert(Hold {
                    holder,
                    since: Instant::now(),
                });
                Ok(true)
            }
        }
    }

    /// Drop holds that no live meeting references and that are older than `grace`.
    /// Returns the reclaimed keys.
    pub fn reclaim_stale(&self, live: &HashSet<SlotKey>, grace: Duration) -> Vec<SlotKey> {
        let mut reclaimed = Vec::new();
        self.held.retain(|key, hold| {
            let keep = live.contains(key) || hold.since.elapsed() < grace;
            if !keep {
                reclaimed.push(key.clone());
            }
            keep
        });
        reclaimed
    }
}
