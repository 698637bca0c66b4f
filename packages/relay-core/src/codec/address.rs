//! Ledger-native address types.
//!
//! TON addresses are accepted in raw form (`0:<hex>`) and in the 48 character
//! user-friendly form (flags, workchain, hash, CRC16-XMODEM). EVM addresses
//! are `0x` followed by 40 hex digits. `Address` renders TON addresses in raw
//! form so the two kinds never collide as strings.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::DecodeError;

const FRIENDLY_LEN: usize = 36;
const FLAG_BOUNCEABLE: u8 = 0x11;
const FLAG_NON_BOUNCEABLE: u8 = 0x51;
const FLAG_TESTNET: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Ton,
    Evm,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressKind::Ton => f.write_str("TON"),
            AddressKind::Evm => f.write_str("EVM"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TonAddress {
    pub workchain: i8,
    pub hash: [u8; 32],
}

impl TonAddress {
    pub fn new(workchain: i8, hash: [u8; 32]) -> Self {
        Self { workchain, hash }
    }

    pub fn to_friendly(&self, bounceable: bool, testnet: bool) -> String {
        let mut bytes = Vec::with_capacity(FRIENDLY_LEN);
        let mut flags = if bounceable {
            FLAG_BOUNCEABLE
        } else {
            FLAG_NON_BOUNCEABLE
        };
        if testnet {
            flags |= FLAG_TESTNET;
        }
        bytes.push(flags);
        bytes.push(self.workchain as u8);
        bytes.extend_from_slice(&self.hash);
        bytes.extend_from_slice(&crc16(&bytes).to_be_bytes());
        URL_SAFE.encode(bytes)
    }

    fn parse_raw(s: &str) -> Result<Self, DecodeError> {
        let (wc, hash_hex) = s
            .split_once(':')
            .ok_or_else(|| invalid(s, "expected <workchain>:<hash>"))?;
        let workchain: i8 = wc.parse().map_err(|_| invalid(s, "bad workchain"))?;
        let hash: [u8; 32] = hex::decode(hash_hex)
            .map_err(|_| invalid(s, "hash is not hex"))?
            .try_into()
            .map_err(|_| invalid(s, "hash must be 32 bytes"))?;
        Ok(Self { workchain, hash })
    }

    fn parse_friendly(s: &str) -> Result<Self, DecodeError> {
        let bytes = if s.contains('-') || s.contains('_') {
            URL_SAFE.decode(s)
        } else {
            STANDARD.decode(s)
        }
        .map_err(|_| invalid(s, "not base64"))?;
        if bytes.len() != FRIENDLY_LEN {
            return Err(invalid(s, "friendly address must be 36 bytes"));
        }
        let flags = bytes[0] & !FLAG_TESTNET;
        if flags != FLAG_BOUNCEABLE && flags != FLAG_NON_BOUNCEABLE {
            return Err(invalid(s, "unknown address flags"));
        }
        let checksum = u16::from_be_bytes([bytes[34], bytes[35]]);
        if crc16(&bytes[..34]) != checksum {
            return Err(invalid(s, "checksum mismatch"));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[2..34]);
        Ok(Self {
            workchain: bytes[1] as i8,
            hash,
        })
    }
}

impl FromStr for TonAddress {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains(':') {
            Self::parse_raw(s)
        } else {
            Self::parse_friendly(s)
        }
    }
}

impl fmt::Display for TonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.workchain, hex::encode(self.hash))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EvmAddress(pub [u8; 20]);

impl FromStr for EvmAddress {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| invalid(s, "missing 0x prefix"))?;
        let bytes: [u8; 20] = hex::decode(digits)
            .map_err(|_| invalid(s, "not hex"))?
            .try_into()
            .map_err(|_| invalid(s, "must be 20 bytes"))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    Ton(TonAddress),
    Evm(EvmAddress),
}

impl Address {
    pub fn kind(&self) -> AddressKind {
        match self {
            Address::Ton(_) => AddressKind::Ton,
            Address::Evm(_) => AddressKind::Evm,
        }
    }
}

impl FromStr for Address {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.starts_with("0x") || t.starts_with("0X") {
            t.parse().map(Address::Evm)
        } else {
            t.parse().map(Address::Ton)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ton(a) => a.fmt(f),
            Address::Evm(a) => a.fmt(f),
        }
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn invalid(input: &str, reason: &str) -> DecodeError {
    DecodeError::InvalidAddress(format!("{input}: {reason}"))
}

/// CRC16-XMODEM, as used by TON user-friendly addresses.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
