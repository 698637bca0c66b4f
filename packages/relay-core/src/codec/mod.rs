//! Bridge application message codec.
//!
//! A message is a 32-bit opcode followed by the fields declared for that
//! opcode in [`SCHEMAS`], bit-packed big-endian the way a TON cell stores
//! them. Flat messages travel as the cell data zero-padded to a byte
//! boundary; a message with a proof keeps it in a referenced cell tree.
//! One generic routine reads and writes every message kind; adding a kind
//! means adding a table row.

pub mod address;
mod bits;
pub mod cell;

use ethers::types::U256;

use crate::types::{Address, AddressKind, DecodedEvent, EvmAddress, Groth16Proof, Opcode, Proof, TonAddress};
use bits::{BitReader, BitWriter};
pub use cell::{Cell, MAX_CELL_BITS, MAX_CELL_REFS};

/// Deposit observed on TON (jetton-style `transfer_notification` body).
pub const OP_TON_DEPOSIT: Opcode = 0x7362_d09c;
/// Proof-carrying unlock sent to the TON bridge.
pub const OP_TON_UNLOCK: Opcode = 0x8362_d09c;
/// EVM `DepositEvent` log, normalized by the EVM adapter.
pub const OP_EVM_DEPOSIT: Opcode = 0x9362_d09c;

const MAX_COINS_BYTES: usize = 15;
/// 256-bit words per list cell, behind an 8-bit count.
const WORDS_PER_CELL: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of message: needed {needed} bits, {remaining} left")]
    UnexpectedEnd { needed: usize, remaining: usize },

    #[error("unknown opcode {0:#010x}")]
    UnknownOpcode(u32),

    #[error("unsupported address tag {0:#04b}")]
    AddressTag(u8),

    #[error("anycast addresses are not supported")]
    Anycast,

    #[error("{0} trailing bits after last field")]
    TrailingData(usize),

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("missing or malformed {0} cell")]
    Reference(&'static str),

    #[error("{0} unexpected cell references")]
    UnexpectedReferences(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("unknown opcode {0:#010x}")]
    UnknownOpcode(u32),

    #[error("{field} must be a {expected} address")]
    AddressKind {
        field: &'static str,
        expected: AddressKind,
    },

    #[error("amount {0} does not fit in 120 bits")]
    AmountTooLarge(u128),

    #[error("missing {0}")]
    MissingChainId(&'static str),

    #[error("proof element {0:?} is not a 256-bit decimal integer")]
    ProofElement(String),

    #[error("too many proof elements in {0}")]
    TooManyElements(&'static str),

    #[error("proof component {0} has the wrong shape")]
    ProofShape(&'static str),

    #[error("cell of {bits} bits and {refs} references exceeds the cell limits")]
    CellOverflow { bits: usize, refs: usize },

    #[error("{0} carries a proof and must be encoded as a cell")]
    NeedsCell(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Nonce,
    SourceAddress(AddressKind),
    Counterparty(AddressKind),
    Amount,
    DestinationChainId,
    SourceChainId,
    /// Proof cell tree, stored as the next reference of the root cell.
    ProofRef,
}

#[derive(Debug)]
pub struct Schema {
    pub opcode: Opcode,
    pub name: &'static str,
    pub fields: &'static [Field],
}

pub static SCHEMAS: &[Schema] = &[
    Schema {
        opcode: OP_TON_DEPOSIT,
        name: "ton_deposit",
        fields: &[
            Field::Nonce,
            Field::SourceAddress(AddressKind::Ton),
            Field::Counterparty(AddressKind::Evm),
            Field::Amount,
        ],
    },
    Schema {
        opcode: OP_TON_UNLOCK,
        name: "ton_unlock",
        fields: &[
            Field::ProofRef,
            Field::Nonce,
            Field::Amount,
            Field::Counterparty(AddressKind::Ton),
            Field::DestinationChainId,
            Field::SourceChainId,
            Field::SourceAddress(AddressKind::Evm),
        ],
    },
    Schema {
        opcode: OP_EVM_DEPOSIT,
        name: "evm_deposit",
        fields: &[
            Field::Nonce,
            Field::SourceAddress(AddressKind::Evm),
            Field::Counterparty(AddressKind::Ton),
            Field::Amount,
        ],
    },
];

pub fn schema_for(opcode: Opcode) -> Option<&'static Schema> {
    SCHEMAS.iter().find(|s| s.opcode == opcode)
}

pub fn decode(bytes: &[u8]) -> Result<DecodedEvent, DecodeError> {
    decode_with_proof(bytes).map(|(event, _)| event)
}

/// Decodes a flat message. A schema with a proof reference cannot decode
/// here; use [`decode_cell`].
pub fn decode_with_proof(bytes: &[u8]) -> Result<(DecodedEvent, Option<Proof>), DecodeError> {
    decode_cell(&Cell::from_bytes(bytes))
}

/// Decodes a message cell and, when its schema carries one, the proof tree.
pub fn decode_cell(cell: &Cell) -> Result<(DecodedEvent, Option<Proof>), DecodeError> {
    let mut r = BitReader::for_cell(cell);
    let mut refs = cell.refs().iter();
    let opcode = r.read_uint(32)? as Opcode;
    let schema = schema_for(opcode).ok_or(DecodeError::UnknownOpcode(opcode))?;

    let mut nonce = 0;
    let mut amount = 0;
    let mut source = None;
    let mut counterparty = None;
    let mut source_chain_id = None;
    let mut destination_chain_id = None;
    let mut proof = None;

    for field in schema.fields {
        match *field {
            Field::Nonce => nonce = r.read_uint(64)? as u64,
            Field::SourceAddress(kind) => source = Some(read_address(&mut r, kind)?),
            Field::Counterparty(kind) => counterparty = Some(read_address(&mut r, kind)?),
            Field::Amount => amount = read_coins(&mut r)?,
            Field::DestinationChainId => destination_chain_id = Some(r.read_uint(32)? as u32),
            Field::SourceChainId => source_chain_id = Some(r.read_uint(32)? as u32),
            Field::ProofRef => {
                let tree = refs.next().ok_or(DecodeError::Reference("proof"))?;
                proof = Some(read_proof(tree)?);
            }
        }
    }
    r.finish()?;
    let extra = refs.count();
    if extra > 0 {
        return Err(DecodeError::UnexpectedReferences(extra));
    }

    // Every schema row declares both addresses; see `every_schema_is_complete`.
    let (Some(source_address), Some(destination_address)) = (source, counterparty) else {
        return Err(DecodeError::UnknownOpcode(opcode));
    };

    let event = DecodedEvent {
        opcode,
        nonce,
        amount,
        source_address,
        destination_address,
        source_chain_id,
        destination_chain_id,
    };
    Ok((event, proof))
}

/// Encodes a flat message: the root cell data, zero padded.
pub fn encode(event: &DecodedEvent) -> Result<Vec<u8>, EncodeError> {
    let schema = schema_for(event.opcode).ok_or(EncodeError::UnknownOpcode(event.opcode))?;
    if schema.fields.contains(&Field::ProofRef) {
        return Err(EncodeError::NeedsCell(schema.name));
    }
    Ok(encode_cell(event, &Proof::default())?.into_data())
}

/// Encodes `event` under the schema of `event.opcode` as a cell. The proof
/// is only written when the schema references one.
pub fn encode_cell(event: &DecodedEvent, proof: &Proof) -> Result<Cell, EncodeError> {
    let schema = schema_for(event.opcode).ok_or(EncodeError::UnknownOpcode(event.opcode))?;
    let mut w = BitWriter::new();
    let mut refs = Vec::new();
    w.write_uint(event.opcode as u128, 32);

    for field in schema.fields {
        match *field {
            Field::Nonce => w.write_uint(event.nonce as u128, 64),
            Field::SourceAddress(kind) => {
                write_address(&mut w, kind, &event.source_address, "source address")?
            }
            Field::Counterparty(kind) => write_address(
                &mut w,
                kind,
                &event.destination_address,
                "destination address",
            )?,
            Field::Amount => write_coins(&mut w, event.amount)?,
            Field::DestinationChainId => {
                let id = event
                    .destination_chain_id
                    .ok_or(EncodeError::MissingChainId("destination chain id"))?;
                w.write_uint(id as u128, 32);
            }
            Field::SourceChainId => {
                let id = event
                    .source_chain_id
                    .ok_or(EncodeError::MissingChainId("source chain id"))?;
                w.write_uint(id as u128, 32);
            }
            Field::ProofRef => refs.push(proof_cell(proof)?),
        }
    }
    w.into_cell(refs)
}

fn read_address(r: &mut BitReader<'_>, kind: AddressKind) -> Result<Address, DecodeError> {
    match kind {
        AddressKind::Evm => Ok(Address::Evm(EvmAddress(r.read_bytes::<20>()?))),
        AddressKind::Ton => {
            // addr_std$10 anycast:(Maybe Anycast) workchain_id:int8 address:bits256
            let tag = r.read_uint(2)? as u8;
            if tag != 0b10 {
                return Err(DecodeError::AddressTag(tag));
            }
            if r.read_bit()? {
                return Err(DecodeError::Anycast);
            }
            let workchain = r.read_uint(8)? as u8 as i8;
            let hash = r.read_bytes::<32>()?;
            Ok(Address::Ton(TonAddress::new(workchain, hash)))
        }
    }
}

fn write_address(
    w: &mut BitWriter,
    kind: AddressKind,
    address: &Address,
    field: &'static str,
) -> Result<(), EncodeError> {
    match (kind, address) {
        (AddressKind::Evm, Address::Evm(a)) => w.write_bytes(&a.0),
        (AddressKind::Ton, Address::Ton(a)) => {
            w.write_uint(0b10, 2);
            w.write_bit(false);
            w.write_uint(a.workchain as u8 as u128, 8);
            w.write_bytes(&a.hash);
        }
        _ => {
            return Err(EncodeError::AddressKind {
                field,
                expected: kind,
            })
        }
    }
    Ok(())
}

/// `VarUInteger 16`: a 4-bit byte length followed by the magnitude.
fn read_coins(r: &mut BitReader<'_>) -> Result<u128, DecodeError> {
    let len = r.read_uint(4)? as usize;
    r.read_uint(len * 8)
}

fn write_coins(w: &mut BitWriter, amount: u128) -> Result<(), EncodeError> {
    let len = (128 - amount.leading_zeros() as usize + 7) / 8;
    if len > MAX_COINS_BYTES {
        return Err(EncodeError::AmountTooLarge(amount));
    }
    w.write_uint(len as u128, 4);
    w.write_uint(amount, len * 8);
    Ok(())
}

fn read_u256(r: &mut BitReader<'_>) -> Result<String, DecodeError> {
    let word = r.read_bytes::<32>()?;
    Ok(U256::from_big_endian(&word).to_string())
}

fn write_u256(w: &mut BitWriter, value: &str) -> Result<(), EncodeError> {
    let n = U256::from_dec_str(value).map_err(|_| EncodeError::ProofElement(value.to_string()))?;
    let mut word = [0u8; 32];
    n.to_big_endian(&mut word);
    w.write_bytes(&word);
    Ok(())
}

/// Words chained over list cells; a cell's only reference continues the list.
fn read_list(cell: &Cell, name: &'static str) -> Result<Vec<String>, DecodeError> {
    let mut out = Vec::new();
    let mut next = Some(cell);
    while let Some(cell) = next {
        let mut r = BitReader::for_cell(cell);
        let count = r.read_uint(8)? as usize;
        for _ in 0..count {
            out.push(read_u256(&mut r)?);
        }
        r.finish()?;
        next = match cell.refs() {
            [] => None,
            [tail] => Some(tail),
            _ => return Err(DecodeError::Reference(name)),
        };
    }
    Ok(out)
}

fn list_cell(values: &[String]) -> Result<Cell, EncodeError> {
    let mut tail: Option<Cell> = None;
    for chunk in values.chunks(WORDS_PER_CELL).rev() {
        let mut w = BitWriter::new();
        w.write_uint(chunk.len() as u128, 8);
        for value in chunk {
            write_u256(&mut w, value)?;
        }
        tail = Some(w.into_cell(tail.into_iter().collect())?);
    }
    match tail {
        Some(cell) => Ok(cell),
        None => {
            let mut w = BitWriter::new();
            w.write_uint(0, 8);
            w.into_cell(Vec::new())
        }
    }
}

/// The proof cell has no data and references pi_a, pi_b, pi_c and the
/// public signals in that order. The pi_b cell holds an 8-bit row count
/// and references one list per row.
fn read_proof(cell: &Cell) -> Result<Proof, DecodeError> {
    let [pi_a, pi_b, pi_c, signals] = cell.refs() else {
        return Err(DecodeError::Reference("proof"));
    };
    if cell.bits() != 0 {
        return Err(DecodeError::Reference("proof"));
    }
    let mut r = BitReader::for_cell(pi_b);
    let rows = r.read_uint(8)? as usize;
    r.finish()?;
    if rows != pi_b.refs().len() {
        return Err(DecodeError::Reference("pi_b"));
    }
    Ok(Proof {
        proof: Groth16Proof {
            pi_a: read_list(pi_a, "pi_a")?,
            pi_b: pi_b
                .refs()
                .iter()
                .map(|row| read_list(row, "pi_b"))
                .collect::<Result<Vec<_>, _>>()?,
            pi_c: read_list(pi_c, "pi_c")?,
        },
        public_signals: read_list(signals, "public signals")?,
    })
}

fn proof_cell(proof: &Proof) -> Result<Cell, EncodeError> {
    let groth = &proof.proof;
    if groth.pi_b.len() > MAX_CELL_REFS {
        return Err(EncodeError::TooManyElements("pi_b"));
    }
    let rows = groth
        .pi_b
        .iter()
        .map(|row| list_cell(row))
        .collect::<Result<Vec<_>, _>>()?;
    let mut w = BitWriter::new();
    w.write_uint(rows.len() as u128, 8);
    let pi_b = w.into_cell(rows)?;
    BitWriter::new().into_cell(vec![
        list_cell(&groth.pi_a)?,
        pi_b,
        list_cell(&groth.pi_c)?,
        list_cell(&proof.public_signals)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evm(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn ton() -> Address {
        "EQCFX97P86v7GNUVgwlrf-G6qNBiQo68GpeK05E-i3zeZcni".parse().unwrap()
    }

    fn deposit(nonce: u64, amount: u128) -> DecodedEvent {
        DecodedEvent {
            opcode: OP_TON_DEPOSIT,
            nonce,
            amount,
            source_address: ton(),
            destination_address: evm("0x1234567890123456789012345678901234567890"),
            source_chain_id: None,
            destination_chain_id: None,
        }
    }

    fn sample_proof() -> Proof {
        Proof {
            proof: Groth16Proof {
                pi_a: vec!["1".into(), "2".into(), "1".into()],
                pi_b: vec![
                    vec!["3".into(), "4".into()],
                    vec!["5".into(), "6".into()],
                    vec!["1".into(), "0".into()],
                ],
                pi_c: vec![
                    "21888242871839275222246405745257275088548364400416034343698204186575808495616".into(),
                    "8".into(),
                    "1".into(),
                ],
            },
            public_signals: vec!["1".into(), "1000000000".into()],
        }
    }

    #[test]
    fn every_schema_is_complete() {
        for schema in SCHEMAS {
            let has = |f: fn(&Field) -> bool| schema.fields.iter().filter(|x| f(x)).count();
            assert_eq!(has(|f| matches!(f, Field::Nonce)), 1, "{}", schema.name);
            assert_eq!(has(|f| matches!(f, Field::Amount)), 1, "{}", schema.name);
            assert_eq!(has(|f| matches!(f, Field::SourceAddress(_))), 1, "{}", schema.name);
            assert_eq!(has(|f| matches!(f, Field::Counterparty(_))), 1, "{}", schema.name);
        }
    }

    #[test]
    fn ton_deposit_layout_is_bit_exact() {
        let bytes = encode(&deposit(1, 1_000_000_000)).unwrap();
        // 32 opcode + 64 nonce + 267 address + 160 counterparty + 4 + 32 coins
        assert_eq!(bytes.len(), (32 + 64 + 267 + 160 + 4 + 32 + 7) / 8);
        assert_eq!(&bytes[..4], &[0x73, 0x62, 0xd0, 0x9c]);
        assert_eq!(&bytes[4..12], &1u64.to_be_bytes());
        // addr_std tag `10`, no anycast, then the workchain byte straddling.
        assert_eq!(bytes[12] >> 5, 0b100);
    }

    #[test]
    fn deposit_round_trips() {
        for amount in [0u128, 1, 1_000_000_000, (1u128 << 120) - 1] {
            let event = deposit(42, amount);
            let bytes = encode(&event).unwrap();
            assert_eq!(decode(&bytes).unwrap(), event);
        }
    }

    #[test]
    fn unlock_round_trips_with_proof() {
        let event = DecodedEvent {
            opcode: OP_TON_UNLOCK,
            nonce: u64::MAX,
            amount: 5,
            source_address: evm("0x00000000000000000000000000000000000000ff"),
            destination_address: ton(),
            source_chain_id: Some(11155111),
            destination_chain_id: Some(0xffff_ffff),
        };
        let proof = sample_proof();
        let cell = encode_cell(&event, &proof).unwrap();
        assert_eq!(cell.refs().len(), 1);
        for c in cell.descendants() {
            assert!(c.bits() <= MAX_CELL_BITS);
            assert!(c.refs().len() <= MAX_CELL_REFS);
        }
        let (decoded, decoded_proof) = decode_cell(&cell).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded_proof, Some(proof));
    }

    #[test]
    fn long_signal_lists_chain_over_cells() {
        let mut proof = sample_proof();
        proof.public_signals = (0..10).map(|i| i.to_string()).collect();
        let event = DecodedEvent {
            opcode: OP_TON_UNLOCK,
            nonce: 1,
            amount: 1,
            source_address: evm("0x00000000000000000000000000000000000000ff"),
            destination_address: ton(),
            source_chain_id: Some(1),
            destination_chain_id: Some(2),
        };
        let cell = encode_cell(&event, &proof).unwrap();
        // root, proof, pi_a, pi_b + 3 rows, pi_c, 4 signal cells
        assert_eq!(cell.descendants().len(), 12);
        assert_eq!(decode_cell(&cell).unwrap().1, Some(proof));
    }

    #[test]
    fn unlock_needs_its_proof_reference() {
        let event = DecodedEvent {
            opcode: OP_TON_UNLOCK,
            nonce: 1,
            amount: 1,
            source_address: evm("0x00000000000000000000000000000000000000ff"),
            destination_address: ton(),
            source_chain_id: Some(1),
            destination_chain_id: Some(2),
        };
        assert_eq!(encode(&event), Err(EncodeError::NeedsCell("ton_unlock")));

        let cell = encode_cell(&event, &sample_proof()).unwrap();
        let bare = Cell::new(cell.data().to_vec(), cell.bits(), vec![]).unwrap();
        assert_eq!(decode_cell(&bare), Err(DecodeError::Reference("proof")));

        let deposit_cell = encode_cell(&deposit(1, 1), &Proof::default()).unwrap();
        let with_extra = Cell::new(
            deposit_cell.data().to_vec(),
            deposit_cell.bits(),
            vec![Cell::default()],
        )
        .unwrap();
        assert_eq!(decode_cell(&with_extra), Err(DecodeError::UnexpectedReferences(1)));
    }

    #[test]
    fn truncated_deposit_is_rejected() {
        let err = decode(&[0x73, 0x62, 0xd0, 0x9c]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnexpectedEnd {
                needed: 64,
                remaining: 0
            }
        );
    }

    #[test]
    fn every_strict_prefix_fails() {
        let bytes = encode(&deposit(7, 123_456)).unwrap();
        for len in 0..bytes.len() {
            assert!(decode(&bytes[..len]).is_err(), "prefix of {len} bytes decoded");
        }
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(
            decode(&[0xde, 0xad, 0xbe, 0xef, 0, 0]),
            Err(DecodeError::UnknownOpcode(0xdeadbeef))
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode(&deposit(7, 1)).unwrap();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(DecodeError::TrailingData(_))));
    }

    #[test]
    fn addr_none_source_is_rejected() {
        let mut w = BitWriter::new();
        w.write_uint(OP_TON_DEPOSIT as u128, 32);
        w.write_uint(1, 64);
        w.write_uint(0b00, 2);
        assert_eq!(
            decode(&w.into_bytes()),
            Err(DecodeError::AddressTag(0))
        );
    }

    #[test]
    fn encode_checks_address_kinds_and_amount() {
        let mut event = deposit(1, 1);
        event.destination_address = ton();
        assert!(matches!(
            encode(&event),
            Err(EncodeError::AddressKind { expected: AddressKind::Evm, .. })
        ));

        let event = deposit(1, 1u128 << 120);
        assert_eq!(
            encode(&event),
            Err(EncodeError::AmountTooLarge(1u128 << 120))
        );
    }

    #[test]
    fn unlock_requires_chain_ids_and_numeric_proof() {
        let mut event = DecodedEvent {
            opcode: OP_TON_UNLOCK,
            nonce: 1,
            amount: 1,
            source_address: evm("0x00000000000000000000000000000000000000ff"),
            destination_address: ton(),
            source_chain_id: Some(1),
            destination_chain_id: None,
        };
        assert_eq!(
            encode_cell(&event, &sample_proof()),
            Err(EncodeError::MissingChainId("destination chain id"))
        );

        event.destination_chain_id = Some(2);
        let mut proof = sample_proof();
        proof.public_signals.push("0xabc".into());
        assert_eq!(
            encode_cell(&event, &proof),
            Err(EncodeError::ProofElement("0xabc".into()))
        );
    }
}
