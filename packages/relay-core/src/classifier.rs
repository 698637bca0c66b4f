use log::{debug, trace};

use crate::codec;
use crate::types::{DecodedEvent, Opcode, RawMessage};

/// Picks the relay-relevant events out of a raw ledger transaction.
///
/// Bodies that fail to decode, or decode to an opcode this direction does
/// not relay, are skipped and only logged.
#[derive(Debug, Clone)]
pub struct Classifier {
    accepted: Vec<Opcode>,
}

impl Classifier {
    pub fn new(accepted: impl IntoIterator<Item = Opcode>) -> Self {
        Self {
            accepted: accepted.into_iter().collect(),
        }
    }

    pub fn accepts(&self, opcode: Opcode) -> bool {
        self.accepted.contains(&opcode)
    }

    pub fn classify(&self, message: &RawMessage) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        for (i, body) in message.bodies.iter().enumerate() {
            match codec::decode(body) {
                Ok(event) if self.accepts(event.opcode) => events.push(event),
                Ok(event) => trace!(
                    "tx {} body {}: opcode {:#010x} not relayed here",
                    message.tx_id,
                    i,
                    event.opcode
                ),
                Err(e) => debug!("tx {} body {}: skipped undecodable body: {}", message.tx_id, i, e),
            }
        }
        events
    }
}
