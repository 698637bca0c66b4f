use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

use crate::chain_adapter::{LedgerWritePort, Signer};
use crate::relayer::direction::Direction;
use crate::types::{DecodedEvent, Inclusion, Proof, Receipt, TxId};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed(Receipt),
    /// Included but failed on the destination ledger.
    Rejected(String),
    /// Not seen within the inclusion timeout.
    NotLanded,
}

/// A rejection reason that means the destination already holds the effect.
pub fn is_already_processed(reason: &str) -> bool {
    reason.to_ascii_lowercase().contains("already")
}

/// Builds, signs and submits destination messages for one direction.
pub struct OutboundSubmitter {
    direction: Arc<dyn Direction>,
    signer: Arc<dyn Signer>,
    writer: Arc<dyn LedgerWritePort>,
    inclusion_timeout: Duration,
}

impl OutboundSubmitter {
    pub fn new(
        direction: Arc<dyn Direction>,
        signer: Arc<dyn Signer>,
        writer: Arc<dyn LedgerWritePort>,
        inclusion_timeout: Duration,
    ) -> Self {
        Self {
            direction,
            signer,
            writer,
            inclusion_timeout,
        }
    }

    /// Destination-side existence check for the event's nonce.
    pub async fn already_landed(&self, event: &DecodedEvent) -> Result<bool> {
        self.writer.effect_exists(event).await
    }

    pub async fn submit(&self, event: &DecodedEvent, proof: &Proof) -> Result<TxId> {
        let outbound = self.direction.build_outbound(event, proof)?;
        let signed = self.signer.sign(&outbound.payload).await?;
        let tx_id = self.writer.submit(&signed).await?;
        info!(
            "{}: submitted nonce {} as {}",
            self.direction.name(),
            event.nonce,
            tx_id
        );
        Ok(tx_id)
    }

    pub async fn confirm(&self, tx_id: &TxId) -> Result<Confirmation> {
        let inclusion = self
            .writer
            .await_inclusion(tx_id, self.inclusion_timeout)
            .await?;
        Ok(match inclusion {
            Inclusion::Included(receipt) if receipt.success => {
                debug!("{} included at {}", tx_id, receipt.height);
                Confirmation::Confirmed(receipt)
            }
            Inclusion::Included(receipt) => Confirmation::Rejected(
                receipt
                    .reason
                    .unwrap_or_else(|| "transaction failed".to_string()),
            ),
            Inclusion::Timeout => Confirmation::NotLanded,
        })
    }
}
