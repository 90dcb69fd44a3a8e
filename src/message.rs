//! Core bridge message types.
//!
//! A message is identified by `(source_chain, nonce)` and carries an ordered
//! list of 32-byte content words from a source address to a destination
//! address on another chain. Followers create messages on ingestion; the only
//! later mutation is filling in the signature field.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

/// Sentinel stored in a message's signature field once the portal has
/// consumed its nonce. Terminal: a `used` message is never re-signed.
pub const SIG_USED: &str = "used";

/// A three-letter chain identifier, e.g. `eth`, `bse`, `xch`.
///
/// Stored and transmitted as the raw three ASCII bytes; the same value is
/// embedded in routes, EIP-712 payloads, and portal spend solutions.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ChainTag([u8; 3]);

impl ChainTag {
    pub const fn new(tag: [u8; 3]) -> Self {
        Self(tag)
    }

    pub fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }
}

/// Error returned when parsing a [`ChainTag`] from a string or byte slice.
#[derive(Debug, thiserror::Error)]
#[error("invalid chain tag {0:?}: expected exactly 3 ASCII characters")]
pub struct ChainTagError(String);

impl FromStr for ChainTag {
    type Err = ChainTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_alphanumeric) {
            return Err(ChainTagError(s.to_string()));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }
}

impl TryFrom<&[u8]> for ChainTag {
    type Error = ChainTagError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != 3 {
            return Err(ChainTagError(hex::encode(bytes)));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }
}

impl Display for ChainTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl Serialize for ChainTag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainTag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A cross-chain message observed on a source chain.
///
/// `contents` is kept as 32-byte words; [`join_contents`] / [`split_contents`]
/// convert to and from the flat byte string persisted in the store.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    /// 32-byte nonce. Sequential big-endian integer on E-chains, the bridging
    /// coin id on the X-chain.
    pub nonce: B256,
    pub source_chain: ChainTag,
    /// Source address, left-zero-padded to 32 bytes.
    pub source: B256,
    pub destination_chain: ChainTag,
    pub destination: B256,
    pub contents: Vec<B256>,
    /// Height at which the message was confirmed on its source chain.
    pub block_number: u64,
    /// Empty = unsigned, [`SIG_USED`] = consumed on-chain, anything else is
    /// the bech32m wire encoding of the signature.
    pub sig: String,
}

impl Message {
    pub fn is_unsigned(&self) -> bool {
        self.sig.is_empty()
    }

    pub fn is_used(&self) -> bool {
        self.sig == SIG_USED
    }

    /// Nonce as an integer, for E-chain sequence arithmetic and the portal
    /// used-set. `None` if the high 24 bytes are not all zero.
    pub fn nonce_int(&self) -> Option<u64> {
        nonce_to_int(&self.nonce)
    }
}

/// Converts a 32-byte big-endian nonce to `u64` if it fits.
pub fn nonce_to_int(nonce: &B256) -> Option<u64> {
    if nonce[..24].iter().any(|b| *b != 0) {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&nonce[24..]);
    Some(u64::from_be_bytes(buf))
}

/// Converts an integer nonce to its 32-byte big-endian form.
pub fn int_to_nonce(nonce: u64) -> B256 {
    let mut out = B256::ZERO;
    out[24..].copy_from_slice(&nonce.to_be_bytes());
    out
}

/// Flattens content words into the byte string persisted in the store.
pub fn join_contents(contents: &[B256]) -> Vec<u8> {
    let mut out = Vec::with_capacity(contents.len() * 32);
    for word in contents {
        out.extend_from_slice(word.as_slice());
    }
    out
}

/// Splits a persisted byte string back into 32-byte words.
///
/// The input length must be a multiple of 32.
pub fn split_contents(raw: &[u8]) -> Result<Vec<B256>, ContentsError> {
    if raw.len() % 32 != 0 {
        return Err(ContentsError(raw.len()));
    }
    Ok(raw.chunks_exact(32).map(B256::from_slice).collect())
}

/// Normalizes an arbitrary-length atom to exactly 32 bytes: shorter values
/// are left-zero-padded, longer values keep their trailing 32 bytes.
pub fn normalize_word(raw: &[u8]) -> B256 {
    let mut out = B256::ZERO;
    if raw.len() >= 32 {
        out.copy_from_slice(&raw[raw.len() - 32..]);
    } else {
        out[32 - raw.len()..].copy_from_slice(raw);
    }
    out
}

/// Left-pads a source address to 32 bytes.
pub fn pad_source(raw: &[u8]) -> B256 {
    normalize_word(raw)
}

/// Error returned when a persisted contents blob is not word-aligned.
#[derive(Debug, thiserror::Error)]
#[error("contents blob of {0} bytes is not a multiple of 32")]
pub struct ContentsError(usize);

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;

    #[test]
    fn chain_tag_round_trips() {
        let tag: ChainTag = "eth".parse().unwrap();
        assert_eq!(tag.as_bytes(), b"eth");
        assert_eq!(tag.to_string(), "eth");
    }

    #[test]
    fn chain_tag_rejects_wrong_length() {
        assert!("ethereum".parse::<ChainTag>().is_err());
        assert!("et".parse::<ChainTag>().is_err());
        assert!(ChainTag::try_from(&b"xchx"[..]).is_err());
    }

    #[test]
    fn nonce_int_conversion() {
        let nonce = int_to_nonce(7);
        assert_eq!(
            nonce,
            b256!("0000000000000000000000000000000000000000000000000000000000000007")
        );
        assert_eq!(nonce_to_int(&nonce), Some(7));

        let too_big = b256!("0100000000000000000000000000000000000000000000000000000000000000");
        assert_eq!(nonce_to_int(&too_big), None);
    }

    #[test]
    fn contents_round_trip() {
        let words = vec![B256::repeat_byte(1), B256::repeat_byte(2)];
        let flat = join_contents(&words);
        assert_eq!(flat.len(), 64);
        assert_eq!(split_contents(&flat).unwrap(), words);
        assert!(split_contents(&flat[..33]).is_err());
    }

    #[test]
    fn normalize_pads_short_atoms() {
        let word = normalize_word(&[0xaa, 0xbb]);
        assert_eq!(&word[30..], &[0xaa, 0xbb]);
        assert!(word[..30].iter().all(|b| *b == 0));
    }

    #[test]
    fn normalize_truncates_long_atoms_keeping_tail() {
        let mut long = vec![0xff; 40];
        long[39] = 0x01;
        let word = normalize_word(&long);
        assert_eq!(word[31], 0x01);
        assert_eq!(word[0], 0xff);
    }
}
