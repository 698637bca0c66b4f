//! Proof pipeline: prover input construction, proving, local verification.

mod snarkjs;

pub use snarkjs::SnarkjsBackend;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::U256;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::types::{Address, ChainPair, DecodedEvent, Proof};
use crate::{Error, Result};

/// Circuit witness input. Every value is a decimal field element, as
/// snarkjs expects in `input.json`. The key set must match the circuit's
/// input signals exactly; the witness calculator rejects unknown keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProverInput {
    pub nonce: String,
    pub amount: String,
    pub destination_address: String,
    /// Destination chain named by the message, when it names one.
    pub destination_chain_id: String,
    pub source_chain_id: String,
    pub source_bridge_address: String,
    /// Destination chain of the relay direction.
    pub dest_chain_id: String,
}

/// snarkjs verification key JSON, kept opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerificationKey(pub serde_json::Value);

impl VerificationKey {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read verification key {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::Config(format!("Failed to parse verification key {}: {}", path.display(), e))
        })
    }
}

/// Opaque zero-knowledge proving backend.
///
/// `Error::Proof` means the backend ran and rejected the input; spawn and
/// I/O failures are reported as `Error::Network` and retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProvingBackend: Send + Sync {
    async fn full_prove(&self, input: &ProverInput) -> Result<Proof>;

    async fn verify(&self, key: &VerificationKey, proof: &Proof) -> Result<bool>;
}

/// Field element for an address: the EVM address or the TON account hash,
/// read as a big-endian integer.
pub fn address_field(address: &Address) -> String {
    match address {
        Address::Evm(a) => U256::from_big_endian(&a.0).to_string(),
        Address::Ton(a) => U256::from_big_endian(&a.hash).to_string(),
    }
}

pub struct ProofPipeline {
    backend: Arc<dyn ProvingBackend>,
    verification_key: VerificationKey,
}

impl ProofPipeline {
    pub fn new(backend: Arc<dyn ProvingBackend>, verification_key: VerificationKey) -> Self {
        Self {
            backend,
            verification_key,
        }
    }

    /// `sourceChainId` and `destChainId` always come from the direction;
    /// `destinationChainId` is the message's own, falling back to the
    /// direction's.
    pub fn build_input(
        event: &DecodedEvent,
        chains: ChainPair,
        source_bridge: &Address,
    ) -> ProverInput {
        ProverInput {
            nonce: event.nonce.to_string(),
            amount: event.amount.to_string(),
            destination_address: address_field(&event.destination_address),
            destination_chain_id: event
                .destination_chain_id
                .unwrap_or(chains.destination)
                .to_string(),
            source_chain_id: chains.source.to_string(),
            source_bridge_address: address_field(source_bridge),
            dest_chain_id: chains.destination.to_string(),
        }
    }

    /// Proves and then verifies locally. A proof that does not verify is
    /// never returned.
    pub async fn prove(&self, input: &ProverInput) -> Result<Proof> {
        debug!("proving nonce {}", input.nonce);
        let proof = self.backend.full_prove(input).await?;
        if !self.backend.verify(&self.verification_key, &proof).await? {
            warn!("proof for nonce {} failed local verification", input.nonce);
            return Err(Error::Proof(format!(
                "proof for nonce {} failed local verification",
                input.nonce
            )));
        }
        Ok(proof)
    }
}
