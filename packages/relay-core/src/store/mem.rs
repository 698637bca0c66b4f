use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{CursorStore, IdempotencyStore};
use crate::types::{Cursor, NonceKey, ProcessedRecord, Status};
use crate::Result;

/// Process-local store, used by tests and dry runs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    records: Arc<RwLock<HashMap<NonceKey, ProcessedRecord>>>,
    cursors: Arc<RwLock<HashMap<String, Cursor>>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdempotencyStore for InMemoryStore {
    fn get(&self, key: &NonceKey) -> Result<Option<ProcessedRecord>> {
        Ok(self.records.read().get(key).cloned())
    }

    fn create_if_absent(&self, record: &ProcessedRecord) -> Result<Option<ProcessedRecord>> {
        let mut guard = self.records.write();
        if let Some(existing) = guard.get(&record.key) {
            return Ok(Some(existing.clone()));
        }
        guard.insert(record.key, record.clone());
        Ok(None)
    }

    fn compare_and_set(&self, expected: Status, new: &ProcessedRecord) -> Result<bool> {
        let mut guard = self.records.write();
        match guard.get_mut(&new.key) {
            Some(current) if current.status == expected => {
                *current = new.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn records(&self) -> Result<Vec<ProcessedRecord>> {
        let mut all: Vec<_> = self.records.read().values().cloned().collect();
        all.sort_by_key(|r| r.key.to_bytes());
        Ok(all)
    }
}

impl CursorStore for InMemoryStore {
    fn load_cursor(&self, name: &str) -> Result<Option<Cursor>> {
        Ok(self.cursors.read().get(name).copied())
    }

    fn save_cursor(&self, name: &str, cursor: Cursor) -> Result<Cursor> {
        let mut guard = self.cursors.write();
        let stored = guard.entry(name.to_string()).or_insert(cursor);
        *stored = (*stored).max(cursor);
        Ok(*stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_semantics() {
        super::super::tests::exercise_store(&InMemoryStore::new());
    }
}
