use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::errors::StoreError;
use crate::models::{Record, RecordId};

/// A write guarded by optimistic concurrency: it only applies if the stored
/// record is still at `expected_version`.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedWrite {
    pub expected_version: u64,
    pub record: Record,
}

impl VersionedWrite {
    pub fn new(expected_version: u64, record: Record) -> Self {
        Self {
            expected_version,
            record,
        }
    }
}

/// Persistence contract the core needs from the storage collaborator.
pub trait RecordStore: Send + Sync {
    /// Stores a record that must not exist yet.
    fn insert_new(&self, record: Record) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<Record, StoreError>;

    /// Applies every write or none of them. Any stale version rejects the batch.
    fn commit(&self, writes: Vec<VersionedWrite>) -> Result<(), StoreError>;

    /// Records with `status == Active`, in insertion order.
    fn active(&self) -> Result<Vec<Record>, StoreError>;

    /// Every record regardless of status, in insertion order.
    fn all(&self) -> Result<Vec<Record>, StoreError>;

    /// Read-modify-write of a single record keyed on its version.
    fn update(&self, expected_version: u64, record: Record) -> Result<(), StoreError> {
        self.commit(vec![VersionedWrite::new(expected_version, record)])
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<RecordId, Record>,
    order: Vec<RecordId>,
}

/// In-process record store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryStore {
    fn insert_new(&self, record: Record) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        if inner.records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        inner.order.push(record.id.clone());
        inner.records.insert(record.id.clone(), record);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Record, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn commit(&self, writes: Vec<VersionedWrite>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::Poisoned)?;

        // Check everything before touching anything
        let mut seen = HashSet::new();
        for write in &writes {
            if !seen.insert(write.record.id.as_str()) {
                return Err(StoreError::Unavailable(format!(
                    "record {} written twice in one commit",
                    write.record.id
                )));
            }
            let current = inner
                .records
                .get(&write.record.id)
                .ok_or_else(|| StoreError::NotFound(write.record.id.clone()))?;
            if current.version != write.expected_version {
                return Err(StoreError::VersionConflict {
                    record_id: write.record.id.clone(),
                    expected: write.expected_version,
                    actual: current.version,
                });
            }
        }

        for write in writes {
            inner.records.insert(write.record.id.clone(), write.record);
        }
        Ok(())
    }

    fn active(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(Record::is_active)
            .collect())
    }

    fn all(&self) -> Result<Vec<Record>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect())
    }
}
