pub mod chain_adapter;
pub mod classifier;
pub mod codec;
pub mod config;
pub mod poller;
pub mod price;
pub mod prover;
pub mod relayer;
pub mod retry;
pub mod store;
pub mod submitter;
pub mod types;

pub use codec::{DecodeError, EncodeError};
pub use config::Config;
pub use types::{Cursor, DecodedEvent, NonceKey, ProcessedRecord, Proof, RawMessage, Status};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    /// A ledger answered, but with something we could not use.
    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Proof error: {0}")]
    Proof(String),

    #[error("Submission error: {0}")]
    Submission(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    /// Transient errors are retried with backoff at the same cursor / nonce
    /// state and never count against an attempt budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Chain(_))
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
