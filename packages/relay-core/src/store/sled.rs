use std::path::Path;

use log::trace;

use super::{CursorStore, IdempotencyStore};
use crate::types::{Cursor, NonceKey, ProcessedRecord, Status};
use crate::Result;

const PROCESSED_TREE: &str = "processed";
const CURSORS_TREE: &str = "cursors";

/// sled-backed store. Records are serde_json values keyed by
/// [`NonceKey::to_bytes`], cursors are 16-byte big-endian values keyed by
/// direction name.
#[derive(Clone)]
pub struct SledStore {
    db: ::sled::Db,
    processed: ::sled::Tree,
    cursors: ::sled::Tree,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = ::sled::Config::new()
            .path(path)
            .mode(::sled::Mode::HighThroughput)
            .open()?;
        Self::from_db(db)
    }

    /// A store that is deleted when dropped.
    pub fn temporary() -> Result<Self> {
        Self::from_db(::sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: ::sled::Db) -> Result<Self> {
        let processed = db.open_tree(PROCESSED_TREE)?;
        let cursors = db.open_tree(CURSORS_TREE)?;
        Ok(Self {
            db,
            processed,
            cursors,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<ProcessedRecord> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl IdempotencyStore for SledStore {
    fn get(&self, key: &NonceKey) -> Result<Option<ProcessedRecord>> {
        self.processed
            .get(key.to_bytes())?
            .map(|v| Self::decode(&v))
            .transpose()
    }

    fn create_if_absent(&self, record: &ProcessedRecord) -> Result<Option<ProcessedRecord>> {
        let value = serde_json::to_vec(record)?;
        let swapped =
            self.processed
                .compare_and_swap(record.key.to_bytes(), None as Option<&[u8]>, Some(value))?;
        match swapped {
            Ok(()) => {
                self.processed.flush()?;
                trace!("created record {}", record.key);
                Ok(None)
            }
            Err(conflict) => conflict.current.map(|v| Self::decode(&v)).transpose(),
        }
    }

    fn compare_and_set(&self, expected: Status, new: &ProcessedRecord) -> Result<bool> {
        let key = new.key.to_bytes();
        let value = serde_json::to_vec(new)?;
        loop {
            let Some(current) = self.processed.get(key)? else {
                return Ok(false);
            };
            if Self::decode(&current)?.status != expected {
                return Ok(false);
            }
            // 字节级 CAS，期间被其他写者改动则重新读取
            match self
                .processed
                .compare_and_swap(key, Some(&current), Some(value.as_slice()))?
            {
                Ok(()) => {
                    self.processed.flush()?;
                    return Ok(true);
                }
                Err(_) => continue,
            }
        }
    }

    fn records(&self) -> Result<Vec<ProcessedRecord>> {
        self.processed
            .iter()
            .values()
            .map(|v| Self::decode(&v?))
            .collect()
    }
}

impl CursorStore for SledStore {
    fn load_cursor(&self, name: &str) -> Result<Option<Cursor>> {
        Ok(self
            .cursors
            .get(name)?
            .and_then(|v| Cursor::from_bytes(&v)))
    }

    fn save_cursor(&self, name: &str, cursor: Cursor) -> Result<Cursor> {
        let previous = self.cursors.fetch_and_update(name, |old: Option<&[u8]>| {
            let stored = old.and_then(Cursor::from_bytes).unwrap_or(cursor);
            Some(stored.max(cursor).to_bytes().to_vec())
        })?;
        self.cursors.flush()?;
        let previous = previous.and_then(|v| Cursor::from_bytes(&v)).unwrap_or(cursor);
        Ok(previous.max(cursor))
    }
}
