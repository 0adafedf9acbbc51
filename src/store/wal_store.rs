use std::io;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::model::{Event, Record};
use crate::wal::Wal;

use super::{assign_id, encode_checked, merge, RecordStore, RecordTable, StoreError};

// ── Group-commit writer ──────────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the log. Every append already queued when the task wakes
/// up is written under one fsync; a control command ends the batch early.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch: Vec<Pending> = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            control => {
                run_control(&mut wal, control);
                continue;
            }
        };
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                control => {
                    deferred = Some(control);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(control) = deferred {
            run_control(&mut wal, control);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let (events, waiters): (Vec<Event>, Vec<_>) = batch.into_iter().unzip();
    let result = wal.append_batch(&events);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for tx in waiters {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn run_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Rewrite { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Durable record store: in-memory table, write-ahead logged.
///
/// Every mutation is logged before it is applied, under the record's write lock, so
/// readers never observe an unlogged state and updates to one record are serialized.
pub struct WalStore {
    table: RecordTable,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared; compaction holds it exclusively so the snapshot it
    /// writes cannot miss an event appended while it was being taken.
    gate: RwLock<()>,
}

fn parse_object(json: &str) -> Result<Record, serde_json::Error> {
    serde_json::from_str::<Record>(json)
}

fn apply_event(table: &RecordTable, event: &Event) {
    match event {
        Event::RecordInserted { id, body } => match parse_object(body) {
            Ok(record) => table.put(*id, record),
            Err(e) => warn!("replay: skipping unreadable insert of {id}: {e}"),
        },
        Event::RecordUpdated { id, patch } => {
            let Some(handle) = table.get(id) else { return };
            match (parse_object(patch), handle.try_write()) {
                (Ok(partial), Ok(mut guard)) => merge(&mut guard, &partial),
                (Err(e), _) => warn!("replay: skipping unreadable update of {id}: {e}"),
                // Replay owns the table; nobody else holds a lock yet.
                (_, Err(_)) => unreachable!("replay: contended record lock"),
            }
        }
        Event::RecordDeleted { id } => {
            table.remove(id);
        }
    }
}

impl WalStore {
    /// Replay the log at `path` and start its writer task. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::open(path)?;
        let table = RecordTable::new();
        for event in &events {
            apply_event(&table, event);
        }
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(wal, wal_rx));
        tracing::info!(
            "opened {} ({} events, {} records)",
            path.display(),
            events.len(),
            table.len()
        );
        Ok(Self {
            table,
            wal_tx,
            gate: RwLock::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    async fn log(&self, event: Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// Rewrite the log as one insert per live record.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.gate.write().await;
        let mut events = Vec::with_capacity(self.table.len());
        for record in self.table.scan().await {
            let Some(id) = record.get("id").and_then(Value::as_str).and_then(|s| Ulid::from_string(s).ok())
            else {
                continue;
            };
            events.push(Event::RecordInserted {
                id,
                body: encode_checked(&record)?,
            });
        }
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Rewrite { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl RecordStore for WalStore {
    async fn insert(&self, mut record: Record) -> Result<Ulid, StoreError> {
        let id = assign_id(&mut record)?;
        let body = encode_checked(&record)?;
        let _shared = self.gate.read().await;
        let Some(claimed) = self.table.claim(id, record) else {
            return Err(StoreError::AlreadyExists(id));
        };
        if let Err(e) = self.log(Event::RecordInserted { id, body }).await {
            self.table.remove(&id);
            return Err(e);
        }
        drop(claimed);
        Ok(id)
    }

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Record>, StoreError> {
        match self.table.get(&id) {
            Some(handle) => Ok(Some(handle.read().await.clone())),
            None => Ok(None),
        }
    }

    async fn find_by_field(&self, field: &str, value: &Value) -> Result<Vec<Record>, StoreError> {
        Ok(self.table.find_by_field(field, value).await)
    }

    async fn update(&self, id: Ulid, partial: Record) -> Result<Record, StoreError> {
        let _shared = self.gate.read().await;
        let handle = self.table.get(&id).ok_or(StoreError::NotFound(id))?;
        let mut guard = handle.write().await;
        let mut merged = guard.clone();
        merge(&mut merged, &partial);
        encode_checked(&merged)?;
        let patch = encode_checked(&partial)?;
        self.log(Event::RecordUpdated { id, patch }).await?;
        *guard = merged.clone();
        Ok(merged)
    }

    async fn delete(&self, id: Ulid) -> Result<bool, StoreError> {
        let _shared = self.gate.read().await;
        let Some(handle) = self.table.get(&id) else {
            return Ok(false);
        };
        let _guard = handle.write().await;
        self.log(Event::RecordDeleted { id }).await?;
        self.table.remove(&id);
        Ok(true)
    }

    async fn scan(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.table.scan().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn survives_reopen() {
        let path = test_wal_path("reopen.wal");
        let a;
        let b;
        {
            let store = WalStore::open(&path).unwrap();
            a = store.insert(rec(json!({ "status": "scheduled", "car_id": "c1" }))).await.unwrap();
            b = store.insert(rec(json!({ "status": "scheduled", "car_id": "c2" }))).await.unwrap();
            store.update(a, rec(json!({ "status": "cancelled" }))).await.unwrap();
            assert!(store.delete(b).await.unwrap());
        }
        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        let rec_a = store.find_by_id(a).await.unwrap().unwrap();
        assert_eq!(rec_a["status"], json!("cancelled"));
        assert_eq!(rec_a["car_id"], json!("c1"));
        assert!(store.find_by_id(b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn compact_keeps_state() {
        let path = test_wal_path("compact.wal");
        let id;
        {
            let store = WalStore::open(&path).unwrap();
            id = store.insert(rec(json!({ "n": 0 }))).await.unwrap();
            for n in 1..=25 {
                store.update(id, rec(json!({ "n": n }))).await.unwrap();
            }
            let gone = store.insert(rec(json!({ "tmp": true }))).await.unwrap();
            store.delete(gone).await.unwrap();
            assert_eq!(store.appends_since_compact().await, 28);

            let before = std::fs::metadata(&path).unwrap().len();
            store.compact().await.unwrap();
            let after = std::fs::metadata(&path).unwrap().len();
            assert!(after < before);
            assert_eq!(store.appends_since_compact().await, 0);

            store.update(id, rec(json!({ "after": "compact" }))).await.unwrap();
        }
        let store = WalStore::open(&path).unwrap();
        let r = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(r["n"], json!(25));
        assert_eq!(r["after"], json!("compact"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_inserts_group_commit() {
        let path = test_wal_path("group_commit.wal");
        let store = Arc::new(WalStore::open(&path).unwrap());
        let mut handles = Vec::new();
        for i in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.insert(rec(json!({ "i": i }))).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.len(), 64);
        drop(store);
        let reopened = WalStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 64);
        assert_eq!(
            reopened.find_by_field("i", &json!(63)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn duplicate_ids_log_once() {
        let path = test_wal_path("duplicate_ids.wal");
        let store = Arc::new(WalStore::open(&path).unwrap());
        let id = Ulid::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert(rec(json!({ "id": id.to_string(), "writer": i })))
                    .await
            }));
        }
        let mut won = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(got) => {
                    assert_eq!(got, id);
                    won += 1;
                }
                Err(e) => assert!(matches!(e, StoreError::AlreadyExists(dup) if dup == id)),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(store.appends_since_compact().await, 1);
        drop(store);
        assert_eq!(WalStore::open(&path).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_missing_record() {
        let path = test_wal_path("update_missing.wal");
        let store = WalStore::open(&path).unwrap();
        assert!(matches!(
            store.update(Ulid::new(), Record::new()).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(!store.delete(Ulid::new()).await.unwrap());
    }
}
