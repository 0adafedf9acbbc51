//! Record persistence consumed by the booking core.
//!
//! Records are JSON objects keyed by a ULID stored under `"id"`. `update` is a
//! shallow merge and is atomic per record: each record sits behind its own lock.

mod memory;
mod wal_store;

pub use memory::MemoryStore;
pub use wal_store::WalStore;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::MAX_RECORD_BYTES;
use crate::model::Record;

pub type SharedRecord = Arc<RwLock<Record>>;

#[derive(Debug)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidRecord(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "record not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "record already exists: {id}"),
            StoreError::InvalidRecord(e) => write!(f, "invalid record: {e}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Store a new record. Uses the record's `"id"` when present, otherwise assigns one.
    async fn insert(&self, record: Record) -> Result<Ulid, StoreError>;

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Record>, StoreError>;

    /// Records whose `field` equals `value` exactly.
    async fn find_by_field(&self, field: &str, value: &Value) -> Result<Vec<Record>, StoreError>;

    /// Shallow-merge `partial` into the record and return the result. `"id"` is immutable.
    async fn update(&self, id: Ulid, partial: Record) -> Result<Record, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: Ulid) -> Result<bool, StoreError>;

    /// Every record. Used by reconciliation.
    async fn scan(&self) -> Result<Vec<Record>, StoreError>;
}

/// Concurrent record table shared by the store implementations.
pub(crate) struct RecordTable {
    records: DashMap<Ulid, SharedRecord>,
}

impl RecordTable {
    pub(crate) fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn get(&self, id: &Ulid) -> Option<SharedRecord> {
        self.records.get(id).map(|e| e.value().clone())
    }

    /// Take `id` for a new record. The record comes back write-locked, so readers wait
    /// until the caller releases it. `None` when the id is already taken.
    pub(crate) fn claim(&self, id: Ulid, record: Record) -> Option<OwnedRwLockWriteGuard<Record>> {
        match self.records.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let handle = Arc::new(RwLock::new(record));
                let guard = handle.clone().try_write_owned().ok()?;
                slot.insert(handle);
                Some(guard)
            }
        }
    }

    pub(crate) fn put(&self, id: Ulid, record: Record) {
        self.records.insert(id, Arc::new(RwLock::new(record)));
    }

    pub(crate) fn remove(&self, id: &Ulid) -> Option<SharedRecord> {
        self.records.remove(id).map(|(_, r)| r)
    }

    /// Snapshot of the per-record handles. Never hold a map guard across an await.
    pub(crate) fn handles(&self) -> Vec<SharedRecord> {
        self.records.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) async fn find_by_field(&self, field: &str, value: &Value) -> Vec<Record> {
        let mut out = Vec::new();
        for handle in self.handles() {
            let guard = handle.read().await;
            if guard.get(field) == Some(value) {
                out.push(guard.clone());
            }
        }
        out
    }

    pub(crate) async fn scan(&self) -> Vec<Record> {
        let mut out = Vec::with_capacity(self.len());
        for handle in self.handles() {
            out.push(handle.read().await.clone());
        }
        out
    }
}

/// Resolve the id of a record about to be inserted, writing a fresh one if absent.
pub(crate) fn assign_id(record: &mut Record) -> Result<Ulid, StoreError> {
    match record.get("id") {
        Some(Value::String(s)) => {
            Ulid::from_string(s).map_err(|e| StoreError::InvalidRecord(format!("id {s:?}: {e}")))
        }
        Some(Value::Null) | None => {
            let id = Ulid::new();
            record.insert("id".into(), Value::String(id.to_string()));
            Ok(id)
        }
        Some(other) => Err(StoreError::InvalidRecord(format!("id must be a string, got {other}"))),
    }
}

/// Shallow merge; the id never changes.
pub(crate) fn merge(target: &mut Record, partial: &Record) {
    for (k, v) in partial {
        if k != "id" {
            target.insert(k.clone(), v.clone());
        }
    }
}

pub(crate) fn encode_checked(record: &Record) -> Result<String, StoreError> {
    let body = serde_json::to_string(record).map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
    if body.len() > MAX_RECORD_BYTES {
        return Err(StoreError::LimitExceeded("record too large"));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn assign_id_keeps_or_creates() {
        let id = Ulid::new();
        let mut r = rec(json!({ "id": id.to_string() }));
        assert_eq!(assign_id(&mut r).unwrap(), id);

        let mut r = rec(json!({ "name": "x" }));
        let fresh = assign_id(&mut r).unwrap();
        assert_eq!(r["id"], json!(fresh.to_string()));

        let mut r = rec(json!({ "id": 7 }));
        assert!(matches!(assign_id(&mut r), Err(StoreError::InvalidRecord(_))));
        let mut r = rec(json!({ "id": "not-a-ulid" }));
        assert!(matches!(assign_id(&mut r), Err(StoreError::InvalidRecord(_))));
    }

    #[test]
    fn merge_is_shallow_and_protects_id() {
        let mut target = rec(json!({ "id": "a", "x": 1, "nested": { "k": 1, "j": 2 } }));
        merge(&mut target, &rec(json!({ "id": "b", "x": 2, "nested": { "k": 3 } })));
        assert_eq!(target["id"], json!("a"));
        assert_eq!(target["x"], json!(2));
        assert_eq!(target["nested"], json!({ "k": 3 }));
    }

    #[test]
    fn encode_checked_limits_size() {
        let big = rec(json!({ "blob": "x".repeat(MAX_RECORD_BYTES) }));
        assert!(matches!(encode_checked(&big), Err(StoreError::LimitExceeded(_))));
        assert!(encode_checked(&rec(json!({ "a": 1 }))).is_ok());
    }
}
