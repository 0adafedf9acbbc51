use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::booking::BookingService;
use crate::store::{StoreError, WalStore};

/// Ticker whose first tick is one period from now. Startup work runs before the loops.
fn ticker(every: Duration) -> tokio::time::Interval {
    let mut interval = interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Periodically re-derive the reservation index from scheduled meetings.
pub async fn run_reconciler(service: Arc<BookingService>, every: Duration, grace: Duration) {
    let mut interval = ticker(every);
    loop {
        interval.tick().await;
        match service.reconcile(grace).await {
            Ok(report) if report.is_clean() => debug!("reconcile: index consistent"),
            Ok(_) => {}
            Err(e) => warn!("reconcile failed: {e}"),
        }
    }
}

/// Keep the booking window materialized as days roll over.
pub async fn run_backfill(service: Arc<BookingService>, every: Duration) {
    let mut interval = ticker(every);
    loop {
        interval.tick().await;
        match service.backfill() {
            Ok(0) => {}
            Ok(n) => info!("backfill: generated {n} new day(s)"),
            Err(e) => warn!("backfill failed: {e}"),
        }
    }
}

/// Compact the log when enough appends piled up since the last compaction.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(store: &WalStore, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    store.compact().await?;
    info!("compacted WAL after {appends} appends ({} live records)", store.len());
    Ok(true)
}

pub async fn run_compactor(store: Arc<WalStore>, threshold: u64, every: Duration) {
    let mut interval = ticker(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            warn!("compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::AvailabilityStore;
    use crate::catalog::MeetingCatalog;
    use crate::config::BookingConfig;
    use crate::model::SlotKey;
    use crate::policy::BusinessHoursPolicy;
    use crate::store::{MemoryStore, RecordStore};
    use chrono::Days;
    use serde_json::json;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let store = WalStore::open(&test_wal_path("threshold.wal")).unwrap();
        let id = store
            .insert(json!({ "n": 0 }).as_object().cloned().unwrap())
            .await
            .unwrap();
        for n in 1..5 {
            store
                .update(id, json!({ "n": n }).as_object().cloned().unwrap())
                .await
                .unwrap();
        }
        assert!(!compact_if_needed(&store, 10).await.unwrap());
        assert_eq!(store.appends_since_compact().await, 5);
        assert!(compact_if_needed(&store, 5).await.unwrap());
        assert_eq!(store.appends_since_compact().await, 0);
        assert_eq!(store.find_by_id(id).await.unwrap().unwrap()["n"], json!(4));
    }

    #[tokio::test]
    async fn reconciler_reclaims_orphaned_holds() {
        let slots = Arc::new(AvailabilityStore::new(Arc::new(BusinessHoursPolicy::default())));
        let service = Arc::new(BookingService::new(
            slots.clone(),
            Arc::new(MemoryStore::new()),
            MeetingCatalog::default(),
            BookingConfig::default(),
        ));
        let key: SlotKey = (1..=7)
            .find_map(|d| slots.slots_for(slots.today() + Days::new(d)).first().map(|s| s.key()))
            .unwrap();
        slots.reserve(&key, Ulid::new()).unwrap();

        let task = tokio::spawn(run_reconciler(
            service,
            Duration::from_millis(20),
            Duration::ZERO,
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;
        task.abort();
        assert!(slots.is_available(&key));
    }

    #[tokio::test]
    async fn backfill_task_generates_window() {
        let slots = Arc::new(AvailabilityStore::new(Arc::new(BusinessHoursPolicy::default())));
        let service = Arc::new(BookingService::new(
            slots.clone(),
            Arc::new(MemoryStore::new()),
            MeetingCatalog::default(),
            BookingConfig::default(),
        ));
        let task = tokio::spawn(run_backfill(service, Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        task.abort();
        assert_eq!(slots.generated_days(), 31);
    }
}
