//! Signature wire format.
//!
//! A published signature is three dash-separated bech32m groups:
//!
//! ```text
//! r1...-c1...-s1...
//! ```
//!
//! The `r` group carries the route (`source_chain || destination_chain ||
//! nonce`, 38 bytes), the `c` group the 32-byte portal coin binding (empty
//! string when the destination is an E-chain), and the `s` group the raw
//! signature bytes. Decoding is strict: exactly three groups, fixed HRPs,
//! bech32m checksums, and fixed payload lengths for `r` and `c`.

use alloy_primitives::B256;
use bech32::primitives::decode::CheckedHrpstring;
use bech32::{Bech32m, Hrp};

use crate::message::ChainTag;

const ROUTE_HRP: &str = "r";
const COIN_HRP: &str = "c";
const SIG_HRP: &str = "s";

/// The `(source_chain, destination_chain, nonce)` triple identifying the
/// message a signature belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Route {
    pub source_chain: ChainTag,
    pub destination_chain: ChainTag,
    pub nonce: B256,
}

impl Route {
    fn to_bytes(self) -> [u8; 38] {
        let mut out = [0u8; 38];
        out[..3].copy_from_slice(self.source_chain.as_bytes());
        out[3..6].copy_from_slice(self.destination_chain.as_bytes());
        out[6..].copy_from_slice(self.nonce.as_slice());
        out
    }
}

/// A fully decoded signature publication.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DecodedSignature {
    pub route: Route,
    /// Portal coin the signature is bound to; `None` for E-chain destinations.
    pub coin_id: Option<B256>,
    pub sig: Vec<u8>,
}

/// Errors raised while decoding a signature string.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("expected three dash-separated groups, got {0}")]
    GroupCount(usize),
    #[error("group {hrp}: {reason}")]
    Group { hrp: &'static str, reason: String },
    #[error("route payload must be 38 bytes, got {0}")]
    RouteLength(usize),
    #[error("coin binding must be 32 bytes, got {0}")]
    CoinLength(usize),
    #[error("signature payload is empty")]
    EmptySignature,
}

/// Encodes a signature publication into its wire form.
pub fn encode_signature(route: Route, coin_id: Option<B256>, sig: &[u8]) -> String {
    let mut out = encode_group(ROUTE_HRP, &route.to_bytes());
    out.push('-');
    if let Some(coin_id) = coin_id {
        out.push_str(&encode_group(COIN_HRP, coin_id.as_slice()));
    }
    out.push('-');
    out.push_str(&encode_group(SIG_HRP, sig));
    out
}

/// Decodes a wire-form signature, rejecting anything malformed.
pub fn decode_signature(encoded: &str) -> Result<DecodedSignature, CodecError> {
    let parts: Vec<&str> = encoded.split('-').collect();
    if parts.len() != 3 {
        return Err(CodecError::GroupCount(parts.len()));
    }

    let route_bytes = decode_group(ROUTE_HRP, parts[0])?;
    if route_bytes.len() != 38 {
        return Err(CodecError::RouteLength(route_bytes.len()));
    }
    let route = Route {
        source_chain: ChainTag::try_from(&route_bytes[..3]).map_err(|e| CodecError::Group {
            hrp: ROUTE_HRP,
            reason: e.to_string(),
        })?,
        destination_chain: ChainTag::try_from(&route_bytes[3..6]).map_err(|e| {
            CodecError::Group {
                hrp: ROUTE_HRP,
                reason: e.to_string(),
            }
        })?,
        nonce: B256::from_slice(&route_bytes[6..]),
    };

    let coin_id = if parts[1].is_empty() {
        None
    } else {
        let coin_bytes = decode_group(COIN_HRP, parts[1])?;
        if coin_bytes.len() != 32 {
            return Err(CodecError::CoinLength(coin_bytes.len()));
        }
        Some(B256::from_slice(&coin_bytes))
    };

    let sig = decode_group(SIG_HRP, parts[2])?;
    if sig.is_empty() {
        return Err(CodecError::EmptySignature);
    }

    Ok(DecodedSignature {
        route,
        coin_id,
        sig,
    })
}

fn encode_group(hrp: &str, data: &[u8]) -> String {
    // Single-letter HRPs and in-range data; encoding cannot fail.
    let hrp = Hrp::parse(hrp).expect("static hrp");
    bech32::encode::<Bech32m>(hrp, data).expect("bech32m encoding")
}

fn decode_group(expected_hrp: &'static str, group: &str) -> Result<Vec<u8>, CodecError> {
    let checked =
        CheckedHrpstring::new::<Bech32m>(group).map_err(|e| CodecError::Group {
            hrp: expected_hrp,
            reason: e.to_string(),
        })?;
    if checked.hrp().as_str() != expected_hrp {
        return Err(CodecError::Group {
            hrp: expected_hrp,
            reason: format!("unexpected prefix {}", checked.hrp()),
        });
    }
    Ok(checked.byte_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> Route {
        Route {
            source_chain: "eth".parse().unwrap(),
            destination_chain: "xch".parse().unwrap(),
            nonce: B256::repeat_byte(7),
        }
    }

    #[test]
    fn round_trips_with_coin_binding() {
        let coin = B256::repeat_byte(0xcc);
        let sig = vec![0xab; 96];
        let encoded = encode_signature(route(), Some(coin), &sig);
        let decoded = decode_signature(&encoded).unwrap();
        assert_eq!(decoded.route, route());
        assert_eq!(decoded.coin_id, Some(coin));
        assert_eq!(decoded.sig, sig);
    }

    #[test]
    fn round_trips_without_coin_binding() {
        let sig = vec![0x11; 65];
        let encoded = encode_signature(route(), None, &sig);
        assert_eq!(encoded.split('-').nth(1), Some(""));
        let decoded = decode_signature(&encoded).unwrap();
        assert_eq!(decoded.coin_id, None);
        assert_eq!(decoded.sig, sig);
    }

    #[test]
    fn groups_carry_expected_prefixes() {
        let encoded = encode_signature(route(), Some(B256::ZERO), &[1, 2, 3]);
        let parts: Vec<&str> = encoded.split('-').collect();
        assert!(parts[0].starts_with("r1"));
        assert!(parts[1].starts_with("c1"));
        assert!(parts[2].starts_with("s1"));
    }

    #[test]
    fn rejects_wrong_group_count() {
        let encoded = encode_signature(route(), None, &[1]);
        let truncated = encoded.rsplit_once('-').unwrap().0;
        assert!(matches!(
            decode_signature(truncated),
            Err(CodecError::GroupCount(2))
        ));
    }

    #[test]
    fn rejects_swapped_groups() {
        let encoded = encode_signature(route(), Some(B256::ZERO), &[1, 2, 3]);
        let parts: Vec<&str> = encoded.split('-').collect();
        let swapped = format!("{}-{}-{}", parts[2], parts[1], parts[0]);
        assert!(decode_signature(&swapped).is_err());
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let mut encoded = encode_signature(route(), None, &[9; 65]);
        // Flip the final checksum character.
        let last = encoded.pop().unwrap();
        encoded.push(if last == 'q' { 'p' } else { 'q' });
        assert!(decode_signature(&encoded).is_err());
    }

    #[test]
    fn rejects_short_route() {
        let hrp = Hrp::parse("r").unwrap();
        let short = bech32::encode::<Bech32m>(hrp, &[0u8; 10]).unwrap();
        let sig_group = encode_signature(route(), None, &[1]);
        let sig_group = sig_group.split('-').nth(2).unwrap();
        let bad = format!("{short}--{sig_group}");
        assert!(matches!(
            decode_signature(&bad),
            Err(CodecError::RouteLength(10))
        ));
    }
}
