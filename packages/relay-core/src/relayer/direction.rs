//! The two relay directions. The orchestrator is written once against
//! [`Direction`]; everything ledger-specific about a direction lives here.

use async_trait::async_trait;
use std::sync::Arc;

use crate::chain_adapter::evm::withdraw_calldata;
use crate::chain_adapter::ton::unlock_body;
use crate::chain_adapter::{Ledger, LedgerPage, LedgerReadPort};
use crate::codec::{EncodeError, OP_EVM_DEPOSIT, OP_TON_DEPOSIT, OP_TON_UNLOCK};
use crate::types::{Address, ChainPair, Cursor, DecodedEvent, Opcode, OutboundMessage, Proof};
use crate::Result;

#[async_trait]
pub trait Direction: Send + Sync {
    fn name(&self) -> &'static str;

    fn source_ledger(&self) -> Ledger;

    fn destination_ledger(&self) -> Ledger;

    /// The one opcode this direction relays.
    fn deposit_opcode(&self) -> Opcode;

    fn resolve_chain_ids(&self) -> ChainPair;

    /// Bridge account watched on the source ledger.
    fn source_bridge(&self) -> &Address;

    async fn poll_source(&self, since: Cursor, limit: usize) -> Result<LedgerPage>;

    /// Unsigned destination-ledger message carrying `proof`.
    fn build_outbound(&self, event: &DecodedEvent, proof: &Proof) -> Result<OutboundMessage, EncodeError>;
}

/// EVM `DepositEvent` logs become proof-carrying unlock messages for the
/// TON bridge, serialized as a bag of cells.
pub struct EvmToTon {
    reader: Arc<dyn LedgerReadPort>,
    evm_bridge: Address,
    chains: ChainPair,
}

impl EvmToTon {
    pub const NAME: &'static str = "evm-to-ton";

    pub fn new(reader: Arc<dyn LedgerReadPort>, evm_bridge: Address, chains: ChainPair) -> Self {
        Self {
            reader,
            evm_bridge,
            chains,
        }
    }
}

#[async_trait]
impl Direction for EvmToTon {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn source_ledger(&self) -> Ledger {
        Ledger::Evm
    }

    fn destination_ledger(&self) -> Ledger {
        Ledger::Ton
    }

    fn deposit_opcode(&self) -> Opcode {
        OP_EVM_DEPOSIT
    }

    fn resolve_chain_ids(&self) -> ChainPair {
        self.chains
    }

    fn source_bridge(&self) -> &Address {
        &self.evm_bridge
    }

    async fn poll_source(&self, since: Cursor, limit: usize) -> Result<LedgerPage> {
        self.reader
            .get_transactions(&self.evm_bridge.to_string(), since, limit)
            .await
    }

    fn build_outbound(&self, event: &DecodedEvent, proof: &Proof) -> Result<OutboundMessage, EncodeError> {
        let unlock = DecodedEvent {
            opcode: OP_TON_UNLOCK,
            nonce: event.nonce,
            amount: event.amount,
            source_address: event.source_address,
            destination_address: event.destination_address,
            source_chain_id: Some(event.source_chain_id.unwrap_or(self.chains.source)),
            destination_chain_id: Some(event.destination_chain_id.unwrap_or(self.chains.destination)),
        };
        Ok(OutboundMessage {
            payload: unlock_body(&unlock, proof)?,
        })
    }
}

/// TON deposit messages become `withdraw` calls on the EVM bridge.
pub struct TonToEvm {
    reader: Arc<dyn LedgerReadPort>,
    ton_bridge: Address,
    chains: ChainPair,
}

impl TonToEvm {
    pub const NAME: &'static str = "ton-to-evm";

    pub fn new(reader: Arc<dyn LedgerReadPort>, ton_bridge: Address, chains: ChainPair) -> Self {
        Self {
            reader,
            ton_bridge,
            chains,
        }
    }
}

#[async_trait]
impl Direction for TonToEvm {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn source_ledger(&self) -> Ledger {
        Ledger::Ton
    }

    fn destination_ledger(&self) -> Ledger {
        Ledger::Evm
    }

    fn deposit_opcode(&self) -> Opcode {
        OP_TON_DEPOSIT
    }

    fn resolve_chain_ids(&self) -> ChainPair {
        self.chains
    }

    fn source_bridge(&self) -> &Address {
        &self.ton_bridge
    }

    async fn poll_source(&self, since: Cursor, limit: usize) -> Result<LedgerPage> {
        self.reader
            .get_transactions(&self.ton_bridge.to_string(), since, limit)
            .await
    }

    fn build_outbound(&self, event: &DecodedEvent, proof: &Proof) -> Result<OutboundMessage, EncodeError> {
        Ok(OutboundMessage {
            payload: withdraw_calldata(event, proof)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_adapter::{boc, MockLedgerReadPort};
    use crate::codec::{self, MAX_CELL_BITS};
    use crate::types::Groth16Proof;

    const TON: &str = "EQCFX97P86v7GNUVgwlrf-G6qNBiQo68GpeK05E-i3zeZcni";

    fn proof() -> Proof {
        Proof {
            proof: Groth16Proof {
                pi_a: vec!["1".into(), "2".into(), "1".into()],
                pi_b: vec![
                    vec!["3".into(), "4".into()],
                    vec!["5".into(), "6".into()],
                    vec!["1".into(), "0".into()],
                ],
                pi_c: vec!["7".into(), "8".into(), "1".into()],
            },
            public_signals: vec!["9".into()],
        }
    }

    #[test]
    fn evm_deposit_becomes_ton_unlock_with_chain_ids() {
        let direction = EvmToTon::new(
            Arc::new(MockLedgerReadPort::new()),
            "0x00000000000000000000000000000000000000b1".parse().unwrap(),
            ChainPair {
                source: 11155111,
                destination: 607,
            },
        );
        let deposit = DecodedEvent {
            opcode: OP_EVM_DEPOSIT,
            nonce: 4,
            amount: 500,
            source_address: "0x00000000000000000000000000000000000000ff".parse().unwrap(),
            destination_address: TON.parse().unwrap(),
            source_chain_id: None,
            destination_chain_id: None,
        };
        let outbound = direction.build_outbound(&deposit, &proof()).unwrap();
        assert!(boc::is_boc(&outbound.payload));
        let root = boc::parse(&outbound.payload).unwrap();
        assert!(root.descendants().iter().all(|c| c.bits() <= MAX_CELL_BITS));
        let (unlock, carried) = codec::decode_cell(&root).unwrap();
        assert_eq!(unlock.opcode, OP_TON_UNLOCK);
        assert_eq!(unlock.nonce, 4);
        assert_eq!(unlock.amount, 500);
        assert_eq!(unlock.destination_address, deposit.destination_address);
        assert_eq!(unlock.source_chain_id, Some(11155111));
        assert_eq!(unlock.destination_chain_id, Some(607));
        assert_eq!(carried, Some(proof()));
    }

    #[test]
    fn ton_deposit_with_ton_recipient_cannot_be_withdrawn_on_evm() {
        let direction = TonToEvm::new(
            Arc::new(MockLedgerReadPort::new()),
            TON.parse().unwrap(),
            ChainPair {
                source: 607,
                destination: 1,
            },
        );
        let bad = DecodedEvent {
            opcode: OP_TON_DEPOSIT,
            nonce: 1,
            amount: 1,
            source_address: TON.parse().unwrap(),
            destination_address: TON.parse().unwrap(),
            source_chain_id: None,
            destination_chain_id: None,
        };
        assert!(matches!(
            direction.build_outbound(&bad, &proof()),
            Err(EncodeError::AddressKind { .. })
        ));
        assert_eq!(direction.deposit_opcode(), OP_TON_DEPOSIT);
        assert_eq!(direction.name(), "ton-to-evm");
    }
}
