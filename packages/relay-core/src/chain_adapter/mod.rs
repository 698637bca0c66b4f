use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::types::{Cursor, DecodedEvent, Inclusion, RawMessage, TxId};
use crate::Result;

pub mod boc;
pub mod evm;
pub mod signer;
pub mod ton;

pub use evm::EvmAdapter;
pub use signer::{CommandSigner, EvmWalletSigner};
pub use ton::TonAdapter;

/// 账本类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ledger {
    Ton,
    Evm,
}

impl fmt::Display for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ledger::Ton => f.write_str("ton"),
            Ledger::Evm => f.write_str("evm"),
        }
    }
}

/// One page of ledger history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerPage {
    /// Oldest first.
    pub messages: Vec<RawMessage>,
    /// Highest position the adapter fully examined, which may lie past the
    /// last message when a range held nothing of interest.
    pub scanned_to: Option<Cursor>,
    /// The adapter stopped early and more history is available.
    pub has_more: bool,
}

/// 读取链上交易
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerReadPort: Send + Sync {
    fn ledger(&self) -> Ledger;

    /// Transactions of `address` strictly after `since`, at most `limit`.
    async fn get_transactions(
        &self,
        address: &str,
        since: Cursor,
        limit: usize,
    ) -> Result<LedgerPage>;

    async fn is_deployed(&self, address: &str) -> Result<bool>;
}

/// 提交并确认目标链交易
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerWritePort: Send + Sync {
    fn ledger(&self) -> Ledger;

    /// Submits signed, ledger-native bytes. `Error::Submission` means the
    /// ledger rejected them.
    async fn submit(&self, signed: &[u8]) -> Result<TxId>;

    async fn await_inclusion(&self, tx_id: &TxId, timeout: Duration) -> Result<Inclusion>;

    /// Whether the destination bridge already recorded `event`'s nonce.
    async fn effect_exists(&self, event: &DecodedEvent) -> Result<bool>;
}

/// Wallet capability. Turns an unsigned outbound payload into bytes the
/// destination ledger accepts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Maps a reqwest failure onto the error taxonomy: transport problems are
/// network errors, anything the server said is a chain error.
pub(crate) fn http_error(context: &str, e: reqwest::Error) -> crate::Error {
    if e.is_decode() || e.is_status() {
        crate::Error::Chain(format!("{}: {}", context, e))
    } else {
        crate::Error::Network(format!("{}: {}", context, e))
    }
}
