//! Durable relay state: processed-nonce records and per-direction cursors.
//!
//! Both directions share one store, so every write that races another
//! writer goes through an atomic primitive (`create_if_absent`,
//! `compare_and_set`, and the monotonic `save_cursor`).

mod mem;
mod sled;

pub use self::mem::InMemoryStore;
pub use self::sled::SledStore;

use crate::types::{Cursor, DecodedEvent, NonceKey, ProcessedRecord, Status};
use crate::Result;

/// Outcome of offering a freshly classified event to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// No record existed; a `Pending` one was created.
    Fresh(ProcessedRecord),
    /// A non-terminal record exists; continue from its status.
    Resume(ProcessedRecord),
    /// Already `Confirmed` or `Failed`.
    Done(ProcessedRecord),
}

pub trait IdempotencyStore: Send + Sync {
    fn get(&self, key: &NonceKey) -> Result<Option<ProcessedRecord>>;

    /// Inserts `record` unless the key is taken. Returns the existing record
    /// when it is.
    fn create_if_absent(&self, record: &ProcessedRecord) -> Result<Option<ProcessedRecord>>;

    /// Replaces the record for `new.key` only if its stored status is still
    /// `expected`. Returns `false` when another writer got there first.
    fn compare_and_set(&self, expected: Status, new: &ProcessedRecord) -> Result<bool>;

    fn records(&self) -> Result<Vec<ProcessedRecord>>;

    fn admit(&self, key: NonceKey, event: &DecodedEvent) -> Result<Admission> {
        let record = ProcessedRecord::pending(key, event.clone());
        Ok(match self.create_if_absent(&record)? {
            None => Admission::Fresh(record),
            Some(existing) if existing.status.is_terminal() => Admission::Done(existing),
            Some(existing) => Admission::Resume(existing),
        })
    }
}

pub trait CursorStore: Send + Sync {
    fn load_cursor(&self, name: &str) -> Result<Option<Cursor>>;

    /// Stores `max(stored, cursor)` and returns the value now stored.
    fn save_cursor(&self, name: &str, cursor: Cursor) -> Result<Cursor>;
}

pub trait RelayStore: IdempotencyStore + CursorStore {}

impl<T: IdempotencyStore + CursorStore> RelayStore for T {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::OP_TON_DEPOSIT;

    pub fn event(nonce: u64) -> DecodedEvent {
        DecodedEvent {
            opcode: OP_TON_DEPOSIT,
            nonce,
            amount: 1_000_000_000,
            source_address: "EQCFX97P86v7GNUVgwlrf-G6qNBiQo68GpeK05E-i3zeZcni".parse().unwrap(),
            destination_address: "0x1234567890123456789012345678901234567890".parse().unwrap(),
            source_chain_id: None,
            destination_chain_id: None,
        }
    }

    /// Behaviour every store implementation must share.
    pub fn exercise_store<S: RelayStore>(store: &S) {
        let key = NonceKey::new(607, OP_TON_DEPOSIT, 1);
        let ev = event(1);

        let pending = match store.admit(key, &ev).unwrap() {
            Admission::Fresh(record) => record,
            other => panic!("expected fresh admission, got {other:?}"),
        };
        assert_eq!(pending.status, Status::Pending);
        assert!(matches!(store.admit(key, &ev).unwrap(), Admission::Resume(_)));

        let proved = pending.proved(Default::default());
        assert!(store.compare_and_set(Status::Pending, &proved).unwrap());
        // A second writer still believing the record is Pending loses.
        assert!(!store.compare_and_set(Status::Pending, &pending.failed(1, "late")).unwrap());
        assert_eq!(store.get(&key).unwrap().unwrap().status, Status::ProofOk);

        let confirmed = proved.submitted(crate::types::TxId("0xabc".into())).confirmed();
        assert!(store.compare_and_set(Status::ProofOk, &confirmed).unwrap());
        assert!(matches!(store.admit(key, &ev).unwrap(), Admission::Done(_)));
        assert_eq!(store.records().unwrap().len(), 1);

        assert_eq!(store.load_cursor("evm-to-ton").unwrap(), None);
        assert_eq!(store.save_cursor("evm-to-ton", Cursor::new(10, 2)).unwrap(), Cursor::new(10, 2));
        assert_eq!(store.save_cursor("evm-to-ton", Cursor::new(9, 7)).unwrap(), Cursor::new(10, 2));
        assert_eq!(store.load_cursor("evm-to-ton").unwrap(), Some(Cursor::new(10, 2)));
        assert_eq!(store.load_cursor("ton-to-evm").unwrap(), None);
    }
}
