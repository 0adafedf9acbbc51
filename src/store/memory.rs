use async_trait::async_trait;
use serde_json::Value;
use ulid::Ulid;

use crate::model::Record;

use super::{assign_id, encode_checked, merge, RecordStore, RecordTable, StoreError};

/// Non-durable store. Same locking as [`super::WalStore`], no log.
pub struct MemoryStore {
    table: RecordTable,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            table: RecordTable::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, mut record: Record) -> Result<Ulid, StoreError> {
        let id = assign_id(&mut record)?;
        encode_checked(&record)?;
        match self.table.claim(id, record) {
            Some(_) => Ok(id),
            None => Err(StoreError::AlreadyExists(id)),
        }
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
        let handle = self.table.get(&id).ok_or(StoreError::NotFound(id))?;
        let mut guard = handle.write().await;
        let mut merged = guard.clone();
        merge(&mut merged, &partial);
        encode_checked(&merged)?;
        *guard = merged.clone();
        Ok(merged)
    }

    async fn delete(&self, id: Ulid) -> Result<bool, StoreError> {
        Ok(self.table.remove(&id).is_some())
    }

    async fn scan(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.table.scan().await)
    }
}
