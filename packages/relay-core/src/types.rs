use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::codec::address::{Address, AddressKind, EvmAddress, TonAddress};

pub type ChainId = u32;
pub type Opcode = u32;

/// Source and destination chain ids of one relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainPair {
    pub source: ChainId,
    pub destination: ChainId,
}

/// Position in a monitored ledger's history.
///
/// TON uses `(logical_time, 0)`, EVM uses `(block_number, log_index)`.
/// An index of `u64::MAX` marks a height as fully scanned.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Cursor {
    pub height: u64,
    pub index: u64,
}

impl Cursor {
    pub const ZERO: Cursor = Cursor { height: 0, index: 0 };

    pub fn new(height: u64, index: u64) -> Self {
        Self { height, index }
    }

    pub fn at_height(height: u64) -> Self {
        Self { height, index: 0 }
    }

    pub fn end_of(height: u64) -> Self {
        Self {
            height,
            index: u64::MAX,
        }
    }

    pub fn is_end_of_height(&self) -> bool {
        self.index == u64::MAX
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.height.to_be_bytes());
        out[8..].copy_from_slice(&self.index.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let height = u64::from_be_bytes(bytes.get(..8)?.try_into().ok()?);
        let index = u64::from_be_bytes(bytes.get(8..16)?.try_into().ok()?);
        Some(Self { height, index })
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_end_of_height() {
            write!(f, "{}:*", self.height)
        } else {
            write!(f, "{}:{}", self.height, self.index)
        }
    }
}

/// One ledger transaction as fetched, before any decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub tx_id: String,
    pub timestamp: u64,
    pub cursor: Cursor,
    /// Candidate application message bodies (TON out-message bodies, or
    /// normalized EVM deposit logs).
    pub bodies: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedEvent {
    pub opcode: Opcode,
    pub nonce: u64,
    #[serde(with = "amount_string")]
    pub amount: u128,
    pub source_address: Address,
    pub destination_address: Address,
    #[serde(default)]
    pub source_chain_id: Option<ChainId>,
    #[serde(default)]
    pub destination_chain_id: Option<ChainId>,
}

mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Idempotency key: a nonce is unique per (source chain, opcode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NonceKey {
    pub source_chain_id: ChainId,
    pub opcode: Opcode,
    pub nonce: u64,
}

impl NonceKey {
    pub fn new(source_chain_id: ChainId, opcode: Opcode, nonce: u64) -> Self {
        Self {
            source_chain_id,
            opcode,
            nonce,
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..4].copy_from_slice(&self.source_chain_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.opcode.to_be_bytes());
        out[8..].copy_from_slice(&self.nonce.to_be_bytes());
        out
    }
}

impl fmt::Display for NonceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{:#010x}/{}",
            self.source_chain_id, self.opcode, self.nonce
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Pending,
    ProofOk,
    Submitted,
    Confirmed,
    Failed,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Confirmed | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Groth16 proof components in snarkjs' JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Groth16Proof {
    pub pi_a: Vec<String>,
    pub pi_b: Vec<Vec<String>>,
    pub pi_c: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub proof: Groth16Proof,
    #[serde(rename = "publicSignals")]
    pub public_signals: Vec<String>,
}

/// Destination-ledger-native message bytes, ready for signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub String);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_id: TxId,
    pub success: bool,
    pub height: u64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inclusion {
    Included(Receipt),
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub key: NonceKey,
    pub status: Status,
    pub last_attempt_at: u64,
    pub attempt_count: u32,
    pub event: DecodedEvent,
    #[serde(default)]
    pub proof: Option<Proof>,
    #[serde(default)]
    pub tx_id: Option<TxId>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ProcessedRecord {
    pub fn pending(key: NonceKey, event: DecodedEvent) -> Self {
        Self {
            key,
            status: Status::Pending,
            last_attempt_at: unix_now(),
            attempt_count: 0,
            event,
            proof: None,
            tx_id: None,
            last_error: None,
        }
    }

    pub fn nonce(&self) -> u64 {
        self.key.nonce
    }

    /// A failed attempt in the current stage.
    pub fn attempted(&self, attempts: u32, error: &str) -> Self {
        Self {
            attempt_count: attempts,
            last_attempt_at: unix_now(),
            last_error: Some(error.to_string()),
            ..self.clone()
        }
    }

    pub fn proved(&self, proof: Proof) -> Self {
        Self {
            status: Status::ProofOk,
            attempt_count: 0,
            last_attempt_at: unix_now(),
            proof: Some(proof),
            last_error: None,
            ..self.clone()
        }
    }

    pub fn submitted(&self, tx_id: TxId) -> Self {
        Self {
            status: Status::Submitted,
            last_attempt_at: unix_now(),
            tx_id: Some(tx_id),
            ..self.clone()
        }
    }

    /// Back to `ProofOk` so the stored proof is resubmitted.
    pub fn resubmit(&self, attempts: u32, reason: &str) -> Self {
        Self {
            status: Status::ProofOk,
            attempt_count: attempts,
            last_attempt_at: unix_now(),
            last_error: Some(reason.to_string()),
            ..self.clone()
        }
    }

    pub fn confirmed(&self) -> Self {
        Self {
            status: Status::Confirmed,
            last_attempt_at: unix_now(),
            last_error: None,
            ..self.clone()
        }
    }

    pub fn failed(&self, attempts: u32, error: &str) -> Self {
        Self {
            status: Status::Failed,
            attempt_count: attempts,
            last_attempt_at: unix_now(),
            last_error: Some(error.to_string()),
            ..self.clone()
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_orders_by_height_then_index() {
        assert!(Cursor::new(5, 3) < Cursor::new(6, 0));
        assert!(Cursor::new(6, 0) < Cursor::new(6, 1));
        assert!(Cursor::new(6, 1) < Cursor::end_of(6));
        assert!(Cursor::end_of(6) < Cursor::at_height(7));
    }

    #[test]
    fn cursor_bytes_sort_like_cursors() {
        let a = Cursor::new(1, u64::MAX).to_bytes();
        let b = Cursor::new(2, 0).to_bytes();
        assert!(a < b);
        assert_eq!(Cursor::from_bytes(&b), Some(Cursor::new(2, 0)));
        assert_eq!(Cursor::from_bytes(&b[..10]), None);
    }

    #[test]
    fn record_serializes_amount_as_string() {
        let event = DecodedEvent {
            opcode: 0x7362_d09c,
            nonce: 9,
            amount: u128::MAX >> 8,
            source_address: "0x1234567890123456789012345678901234567890".parse().unwrap(),
            destination_address: "0x1234567890123456789012345678901234567890".parse().unwrap(),
            source_chain_id: None,
            destination_chain_id: Some(1),
        };
        let record = ProcessedRecord::pending(NonceKey::new(1, event.opcode, 9), event);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(&format!("\"{}\"", u128::MAX >> 8)));
        let back: ProcessedRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn terminal_statuses() {
        assert!(Status::Confirmed.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::ProofOk.is_terminal());
        assert!(!Status::Submitted.is_terminal());
    }
}
