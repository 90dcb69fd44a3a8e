//! BLS hot-key signing.
//!
//! X-chain signatures use the augmented scheme over BLS12-381 with public
//! keys in G1 (48 bytes) and signatures in G2 (96 bytes): the signer's
//! public key is prepended to the message before hashing to the curve, so a
//! signature never validates under a different key's message space.

use blst::BLST_ERROR;
use blst::min_pk::{PublicKey, SecretKey, Signature};

/// Domain separation tag for the augmented scheme (min-pk ciphersuite).
pub const AUG_SCHEME_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_AUG_";

#[derive(Debug, thiserror::Error)]
pub enum BlsError {
    #[error("invalid BLS secret key: {0}")]
    SecretKey(String),
}

/// The validator's hot signing key.
pub struct HotKey {
    secret: SecretKey,
    public: PublicKey,
}

impl HotKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, BlsError> {
        let secret =
            SecretKey::from_bytes(bytes).map_err(|e| BlsError::SecretKey(format!("{e:?}")))?;
        let public = secret.sk_to_pk();
        Ok(Self { secret, public })
    }

    pub fn public_bytes(&self) -> [u8; 48] {
        self.public.to_bytes()
    }

    /// Augmented-scheme signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; 96] {
        self.secret
            .sign(message, AUG_SCHEME_DST, &self.public.to_bytes())
            .to_bytes()
    }
}

/// Verifies an augmented-scheme signature.
pub fn verify(public: &[u8; 48], message: &[u8], signature: &[u8; 96]) -> bool {
    let Ok(pk) = PublicKey::from_bytes(public) else {
        return false;
    };
    let Ok(sig) = Signature::from_bytes(signature) else {
        return false;
    };
    sig.verify(true, message, AUG_SCHEME_DST, &pk.to_bytes(), &pk, true)
        == BLST_ERROR::BLST_SUCCESS
}
