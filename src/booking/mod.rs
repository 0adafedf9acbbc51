mod error;
mod locks;
mod request;

pub use error::{BookingError, FieldError};
pub use request::{is_valid_email, parse_meeting_id, parse_timezone, RescheduleRequest, ScheduleRequest};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, NaiveTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::availability::AvailabilityStore;
use crate::catalog::MeetingCatalog;
use crate::config::BookingConfig;
use crate::model::*;
use crate::observability::{COMPENSATIONS_TOTAL, RECONCILE_REPAIRS_TOTAL, RELEASE_FAILURES_TOTAL};
use crate::store::RecordStore;

use locks::KeyedLocks;

/// Request field names a slot reference was read from, for error reporting.
#[derive(Clone, Copy)]
struct SlotFields {
    slot: &'static str,
    date: &'static str,
}

const SCHEDULE_FIELDS: SlotFields = SlotFields {
    slot: "slot_id",
    date: "scheduled_date",
};

const RESCHEDULE_FIELDS: SlotFields = SlotFields {
    slot: "new_slot_id",
    date: "new_date",
};

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Scheduled meetings whose slot was not held and now is.
    pub restored: usize,
    /// Holds with no scheduled meeting behind them, released.
    pub reclaimed: usize,
    /// Scheduled meetings whose slot is held by a different meeting.
    pub conflicts: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self == &Self::default()
    }
}

fn record_of(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

/// Schedule, cancel and reschedule on top of the reservation index and a record store.
///
/// The slot hold and the meeting record are two resources with no shared transaction.
/// Every operation takes the slot step first and undoes it if the record write fails,
/// so a hold never outlives a failed write. Operations on one meeting are serialized.
pub struct BookingService {
    slots: Arc<AvailabilityStore>,
    store: Arc<dyn RecordStore>,
    catalog: MeetingCatalog,
    config: BookingConfig,
    meeting_locks: KeyedLocks<Ulid>,
    idempotency_locks: KeyedLocks<String>,
}

impl BookingService {
    pub fn new(
        slots: Arc<AvailabilityStore>,
        store: Arc<dyn RecordStore>,
        catalog: MeetingCatalog,
        config: BookingConfig,
    ) -> Self {
        Self {
            slots,
            store,
            catalog,
            config,
            meeting_locks: KeyedLocks::new(),
            idempotency_locks: KeyedLocks::new(),
        }
    }

    pub fn slots(&self) -> &Arc<AvailabilityStore> {
        &self.slots
    }

    pub fn catalog(&self) -> &MeetingCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &BookingConfig {
        &self.config
    }

    // ── Slot resolution ──────────────────────────────────────

    fn last_bookable_day(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_add_days(Days::new(u64::from(self.config.window_days)))
            .unwrap_or(today)
    }

    fn check_window(&self, date: NaiveDate, field: &'static str) -> Result<(), BookingError> {
        let today = self.slots.today();
        let last = self.last_bookable_day(today);
        if date < today || date > last {
            return Err(BookingError::field(
                field,
                format!("{date} is outside the booking window {today}..={last}"),
            ));
        }
        Ok(())
    }

    /// Reference-zone time of a meeting's slot, for generated and legacy ids alike.
    fn slot_time(&self, meeting: &Meeting) -> Option<NaiveTime> {
        meeting
            .scheduled_time()
            .or_else(|| self.catalog.legacy_slot(&meeting.slot_id))
    }

    /// Reservation key a meeting holds. Old records that stored a legacy slot id map
    /// to the generated slot at the same date and time.
    fn held_key(&self, meeting: &Meeting) -> SlotKey {
        match self.catalog.legacy_slot(&meeting.slot_id) {
            Some(time) => SlotKey::new(meeting.scheduled_date, slot_id_for(meeting.scheduled_date, time)),
            None => meeting.slot_key(),
        }
    }

    /// Turn a requested slot id (generated or legacy) plus optional date into a bookable slot.
    fn resolve_slot(
        &self,
        slot_id: &str,
        date: Option<NaiveDate>,
        fields: SlotFields,
    ) -> Result<Slot, BookingError> {
        let (date, time, id) = match self.catalog.legacy_slot(slot_id) {
            Some(time) => {
                let date = date.ok_or_else(|| BookingError::field(fields.date, "required for legacy slot ids"))?;
                (date, time, slot_id_for(date, time))
            }
            None => {
                let (slot_date, time) =
                    parse_slot_id(slot_id).ok_or_else(|| BookingError::NotFound(format!("slot {slot_id}")))?;
                if let Some(d) = date
                    && d != slot_date
                {
                    return Err(BookingError::field(
                        fields.date,
                        format!("{d} does not match slot {slot_id}"),
                    ));
                }
                (slot_date, time, slot_id.to_string())
            }
        };
        self.check_window(date, fields.date)?;
        let key = SlotKey::new(date, id);
        let slot = self.slots.lookup(&key)?;
        let Some(starts_at) = self.slots.starts_at(date, time) else {
            return Err(BookingError::NotFound(format!("slot {key}")));
        };
        if starts_at <= Utc::now() {
            return Err(BookingError::field(fields.slot, "slot has already started"));
        }
        Ok(slot)
    }

    fn check_duration(slot: &Slot, duration: Minutes, field: &'static str) -> Result<(), BookingError> {
        if slot.durations.contains(&duration) {
            return Ok(());
        }
        Err(BookingError::field(
            field,
            format!("{duration} min does not fit slot {}, allowed: {:?}", slot.id, slot.durations),
        ))
    }

    /// Undo a reservation after the record write that should have followed it failed.
    fn compensate(&self, op: &'static str, key: &SlotKey, holder: Ulid) {
        metrics::counter!(COMPENSATIONS_TOTAL, "op" => op, "step" => "release_reserved").increment(1);
        match self.slots.release_held_by(key, holder) {
            Ok(_) => warn!("{op} {holder}: record write failed, released {key}"),
            Err(e) => warn!("{op} {holder}: record write failed and {key} could not be released: {e}"),
        }
    }

    // ── Operations ───────────────────────────────────────────

    /// Slots of `date` as seen from `timezone`. Slots that already started show as taken.
    pub fn available_slots(&self, date: NaiveDate, timezone: &str) -> Result<Vec<SlotListing>, BookingError> {
        let zone = parse_timezone(timezone)?;
        self.check_window(date, "date")?;
        let mut listing = self.slots.list_slots(date, zone);
        if date == self.slots.today() {
            let now = Utc::now();
            for entry in &mut listing {
                let started = parse_slot_id(&entry.id)
                    .and_then(|(d, t)| self.slots.starts_at(d, t))
                    .is_none_or(|start| start <= now);
                if started {
                    entry.available = false;
                }
            }
        }
        Ok(listing)
    }

    pub async fn schedule(&self, req: &ScheduleRequest) -> Result<Meeting, BookingError> {
        let v = req.validate(&self.catalog)?;

        let idempotency_guard = match &v.idempotency_key {
            Some(key) => {
                let guard = self.idempotency_locks.lock(key.clone()).await;
                if let Some(existing) = self.find_by_idempotency_key(key).await? {
                    debug!("schedule: idempotency key {key:?} already used by {}", existing.id);
                    return Ok(existing);
                }
                Some(guard)
            }
            None => None,
        };

        let slot = self.resolve_slot(&v.slot_id, v.date, SCHEDULE_FIELDS)?;
        let duration = match v.duration {
            Some(d) => d,
            None => *slot
                .durations
                .iter()
                .min()
                .ok_or_else(|| BookingError::NotFound(format!("slot {}", slot.id)))?,
        };
        Self::check_duration(&slot, duration, "duration")?;

        let id = Ulid::new();
        let now = Utc::now();
        let meeting = Meeting {
            id,
            car_id: v.car_id,
            owner_id: v.owner_id,
            meeting_type: v.meeting_type,
            slot_id: slot.id.clone(),
            scheduled_date: slot.date,
            name: v.name,
            email: v.email,
            phone: v.phone,
            notes: v.notes,
            timezone: v.timezone.name().to_string(),
            duration,
            status: MeetingStatus::Scheduled,
            join_url: self
                .catalog
                .join_url(&self.config.join_url_base, v.meeting_type, id),
            provider: self.catalog.provider(v.meeting_type).map(str::to_string),
            idempotency_key: v.idempotency_key,
            created_at: now,
            updated_at: now,
        };
        let record = meeting.to_record()?;

        let key = slot.key();
        self.slots.reserve(&key, id)?;
        if let Err(e) = self.store.insert(record).await {
            self.compensate("schedule", &key, id);
            return Err(BookingError::Persistence(e.to_string()));
        }
        drop(idempotency_guard);

        info!("scheduled {} {id} for car {} on {key}", meeting.meeting_type, meeting.car_id);
        Ok(meeting)
    }

    pub async fn cancel(&self, meeting_id: Ulid) -> Result<Meeting, BookingError> {
        let _guard = self.meeting_locks.lock(meeting_id).await;

        let meeting = self.load(meeting_id).await?;
        if !meeting.is_scheduled() {
            return Err(BookingError::InvalidState {
                id: meeting_id,
                status: meeting.status,
            });
        }
        let patch = json!({ "status": MeetingStatus::Cancelled, "updated_at": Utc::now() });
        let updated = self.store.update(meeting_id, record_of(patch)).await?;
        let cancelled = Meeting::from_record(updated)?;

        // The cancel stands once written. A failed release is repaired by reconciliation.
        let key = self.held_key(&cancelled);
        match self.slots.release_held_by(&key, meeting_id) {
            Ok(true) => {}
            Ok(false) => debug!("cancel {meeting_id}: {key} was not held"),
            Err(e) => {
                metrics::counter!(RELEASE_FAILURES_TOTAL).increment(1);
                warn!("cancel {meeting_id}: could not release {key}: {e}");
            }
        }
        info!("cancelled {meeting_id} on {key}");
        Ok(cancelled)
    }

    /// Move a scheduled meeting to another slot.
    ///
    /// Order: reserve the new slot, write the record, release the old slot. A failed
    /// reserve changes nothing; a failed write releases the new slot again. The old slot
    /// stays held until the record no longer points at it, so it never has to be
    /// re-reserved on failure.
    pub async fn reschedule(&self, req: &RescheduleRequest) -> Result<Meeting, BookingError> {
        let v = req.validate()?;
        let id = v.meeting_id;
        let _guard = self.meeting_locks.lock(id).await;

        let meeting = self.load(id).await?;
        if !meeting.is_scheduled() {
            return Err(BookingError::InvalidState {
                id,
                status: meeting.status,
            });
        }
        let date = match self.catalog.legacy_slot(&v.new_slot_id) {
            Some(_) => v.new_date.or(Some(meeting.scheduled_date)),
            None => v.new_date,
        };
        let target = self.resolve_slot(&v.new_slot_id, date, RESCHEDULE_FIELDS)?;
        Self::check_duration(&target, meeting.duration, RESCHEDULE_FIELDS.slot)?;

        let old_key = self.held_key(&meeting);
        let new_key = target.key();
        let now = Utc::now();
        if new_key == old_key {
            let updated = self.store.update(id, record_of(json!({ "updated_at": now }))).await?;
            return Ok(Meeting::from_record(updated)?);
        }

        self.slots.reserve(&new_key, id)?;
        let patch = json!({
            "slot_id": new_key.slot_id,
            "scheduled_date": new_key.date,
            "updated_at": now,
        });
        let updated = match self.store.update(id, record_of(patch)).await {
            Ok(record) => record,
            Err(e) => {
                self.compensate("reschedule", &new_key, id);
                return Err(e.into());
            }
        };

        match self.slots.release_held_by(&old_key, id) {
            Ok(true) => {}
            Ok(false) => debug!("reschedule {id}: {old_key} was not held"),
            Err(e) => {
                metrics::counter!(RELEASE_FAILURES_TOTAL).increment(1);
                warn!("reschedule {id}: could not release {old_key}: {e}");
            }
        }
        info!("rescheduled {id} from {old_key} to {new_key}");
        Ok(Meeting::from_record(updated)?)
    }

    // ── Read projections ─────────────────────────────────────

    async fn load(&self, id: Ulid) -> Result<Meeting, BookingError> {
        let record = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("meeting {id}")))?;
        Ok(Meeting::from_record(record)?)
    }

    pub async fn get_meeting(&self, id: Ulid) -> Result<Meeting, BookingError> {
        self.load(id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Meeting>, BookingError> {
        let records = self
            .store
            .find_by_field("idempotency_key", &Value::String(key.to_string()))
            .await?;
        match records.into_iter().next() {
            Some(record) => Ok(Some(Meeting::from_record(record)?)),
            None => Ok(None),
        }
    }

    /// Meetings whose `field` (under its canonical or any historical key) equals `value`,
    /// normalized, deduplicated and sorted by slot date and time.
    async fn find_meetings(
        &self,
        field: &'static str,
        value: &str,
        keep: impl Fn(&Meeting) -> bool,
    ) -> Result<Vec<Meeting>, BookingError> {
        let needle = Value::String(value.to_string());
        let mut found = BTreeMap::new();
        for name in std::iter::once(field).chain(legacy_names_for(field)) {
            for record in self.store.find_by_field(name, &needle).await? {
                match Meeting::from_record(record) {
                    Ok(m) if keep(&m) => {
                        found.entry(m.id).or_insert(m);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("skipping unreadable meeting record: {e}"),
                }
            }
        }
        let mut meetings: Vec<Meeting> = found.into_values().collect();
        meetings.sort_by_key(|m| (m.scheduled_date, self.slot_time(m), m.id));
        Ok(meetings)
    }

    pub async fn meetings_for_car(&self, car_id: &str) -> Result<Vec<Meeting>, BookingError> {
        self.find_meetings("car_id", car_id, |m| m.car_id == car_id).await
    }

    pub async fn meetings_for_owner(
        &self,
        owner_id: &str,
        status: Option<MeetingStatus>,
    ) -> Result<Vec<Meeting>, BookingError> {
        self.find_meetings("owner_id", owner_id, |m| {
            m.owner_id.as_deref() == Some(owner_id) && status.is_none_or(|s| m.status == s)
        })
        .await
    }

    // ── Maintenance ──────────────────────────────────────────

    /// Materialize the booking window starting today.
    pub fn backfill(&self) -> Result<usize, BookingError> {
        let today = self.slots.today();
        Ok(self
            .slots
            .ensure_generated(today, self.last_bookable_day(today))?)
    }

    /// Re-derive the reservation index from scheduled meetings.
    ///
    /// Scheduled meetings re-hold their slot; holds that no scheduled meeting references
    /// and that are older than `grace` are released. `grace` keeps in-flight bookings
    /// (reserved, record not yet written) from being reclaimed. Each meeting is re-read
    /// under its lock before its slot is restored.
    pub async fn reconcile(&self, grace: Duration) -> Result<ReconcileReport, BookingError> {
        let mut report = ReconcileReport::default();
        let mut live = HashSet::new();
        for record in self.store.scan().await? {
            let id = match Meeting::from_record(record) {
                Ok(m) if m.is_scheduled() => m.id,
                Ok(_) => continue,
                Err(e) => {
                    warn!("reconcile: skipping unreadable meeting record: {e}");
                    continue;
                }
            };
            // The scan is a snapshot; cancel or reschedule may have run since.
            let _guard = self.meeting_locks.lock(id).await;
            let Some(current) = self.store.find_by_id(id).await? else {
                continue;
            };
            let meeting = match Meeting::from_record(current) {
                Ok(m) if m.is_scheduled() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!("reconcile: skipping unreadable meeting record {id}: {e}");
                    continue;
                }
            };
            let key = self.held_key(&meeting);
            match self.slots.restore(&key, meeting.id) {
                Ok(true) => report.restored += 1,
                Ok(false) => {}
                Err(e) => {
                    report.conflicts += 1;
                    warn!("reconcile: meeting {} cannot hold {key}: {e}", meeting.id);
                }
            }
            live.insert(key);
        }
        let reclaimed = self.slots.reclaim_stale(&live, grace);
        for key in &reclaimed {
            debug!("reconcile: released orphaned hold on {key}");
        }
        report.reclaimed = reclaimed.len();

        metrics::counter!(RECONCILE_REPAIRS_TOTAL, "kind" => "restored").increment(report.restored as u64);
        metrics::counter!(RECONCILE_REPAIRS_TOTAL, "kind" => "reclaimed").increment(report.reclaimed as u64);
        metrics::counter!(RECONCILE_REPAIRS_TOTAL, "kind" => "conflict").increment(report.conflicts as u64);
        if !report.is_clean() {
            info!(
                "reconcile: restored {}, reclaimed {}, conflicts {}",
                report.restored, report.reclaimed, report.conflicts
            );
        }
        Ok(report)
    }
}
