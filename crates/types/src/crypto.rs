//! ECDSA signatures over the secp256k1 curve with public-key recovery.
//!
//! Validators are identified by a 20-byte address derived from the Keccak-256
//! hash of the uncompressed public key, so every signature carries enough
//! information to recover its sender without a key registry.

use k256::elliptic_curve::sec1::ToEncodedPoint as _;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::hash::Hash;

const SIGNATURE_LENGTH: usize = 65;
const ADDRESS_LENGTH: usize = 20;

/// Errors from key handling, signing, and recovery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Key bytes did not parse as a valid secp256k1 key.
    #[error("invalid secp256k1 key")]
    InvalidKey,

    /// Signature bytes were malformed or had the wrong length.
    #[error("invalid signature encoding (length {0})")]
    InvalidSignature(usize),

    /// Recovery id byte outside the supported range.
    #[error("invalid recovery id: {0}")]
    InvalidRecoveryId(u8),

    /// Recovery failed: the signature does not match the digest.
    #[error("public key recovery failed")]
    RecoveryFailed,

    /// The signing operation itself failed.
    #[error("signing failed")]
    SigningFailed,
}

/// A validator identifier: the last 20 bytes of the Keccak-256 hash of the
/// uncompressed public key (sans the 0x04 prefix).
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl Address {
    /// Returns a reference to the bytes of this address.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}…", hex::encode(&self.0[..4]))
    }
}

/// Secp256k1 secret key. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct SecretKey(k256::ecdsa::SigningKey);

impl SecretKey {
    /// Generate a secret key from a cryptographically secure entropy source.
    pub fn generate() -> Self {
        Self(k256::SecretKey::random(&mut rand::rngs::OsRng).into())
    }

    /// Parse a secret key from raw scalar bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let sk = k256::ecdsa::SigningKey::from_slice(bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(sk))
    }

    /// The raw scalar bytes, for key storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    /// The corresponding public key.
    pub fn public(&self) -> PublicKey {
        PublicKey(*self.0.verifying_key())
    }

    /// The validator address of this key.
    pub fn address(&self) -> Address {
        self.public().address()
    }

    /// Sign a message digest.
    pub fn sign_hash(&self, hash: &Hash) -> Result<Signature, CryptoError> {
        let (sig, recid) = self
            .0
            .sign_prehash_recoverable(hash.as_bytes())
            .map_err(|_| CryptoError::SigningFailed)?;
        Ok(Signature { sig, recid })
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "SecretKey({})", self.address())
    }
}

/// Secp256k1 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(k256::ecdsa::VerifyingKey);

impl PublicKey {
    /// Derive the validator address: Keccak-256 of the uncompressed point
    /// without the 0x04 prefix, keeping the last 20 bytes.
    pub fn address(&self) -> Address {
        let point = self.0.to_encoded_point(false);
        let digest = Hash::keccak(&point.as_bytes()[1..]);
        let mut addr = [0u8; ADDRESS_LENGTH];
        addr.copy_from_slice(&digest.as_bytes()[12..]);
        Address(addr)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.address())
    }
}

/// Recoverable secp256k1 signature, wire-encoded as the 65 bytes `r ‖ s ‖ v`
/// with `v = recovery_id + 27`.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    sig: k256::ecdsa::Signature,
    recid: k256::ecdsa::RecoveryId,
}

impl Signature {
    /// Recover the public key that produced this signature over `hash`.
    pub fn recover(&self, hash: &Hash) -> Result<PublicKey, CryptoError> {
        let vk =
            k256::ecdsa::VerifyingKey::recover_from_prehash(hash.as_bytes(), &self.sig, self.recid)
                .map_err(|_| CryptoError::RecoveryFailed)?;
        Ok(PublicKey(vk))
    }

    /// Recover the sender address for a signature over `hash`.
    pub fn recover_address(&self, hash: &Hash) -> Result<Address, CryptoError> {
        Ok(self.recover(hash)?.address())
    }

    /// Wire encoding: `r ‖ s ‖ v`.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        let mut out = [0u8; SIGNATURE_LENGTH];
        let (r, s) = self.sig.split_bytes();
        out[..32].copy_from_slice(&r);
        out[32..64].copy_from_slice(&s);
        out[64] = self.recid.to_byte() + 27;
        out
    }

    /// Parse the 65-byte wire encoding. Accepts both raw (0..=3) and
    /// offset (27..=30) recovery bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SIGNATURE_LENGTH {
            return Err(CryptoError::InvalidSignature(bytes.len()));
        }
        let v = bytes[64];
        let raw = if v >= 27 { v - 27 } else { v };
        let recid =
            k256::ecdsa::RecoveryId::from_byte(raw).ok_or(CryptoError::InvalidRecoveryId(v))?;
        let sig = k256::ecdsa::Signature::from_slice(&bytes[..64])
            .map_err(|_| CryptoError::InvalidSignature(bytes.len()))?;
        Ok(Self { sig, recid })
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature(0x{}…)", hex::encode(&self.to_bytes()[..4]))
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeTuple;
        let bytes = self.to_bytes();
        let mut tup = serializer.serialize_tuple(SIGNATURE_LENGTH)?;
        for b in &bytes {
            tup.serialize_element(b)?;
        }
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SigVisitor;

        impl<'de> serde::de::Visitor<'de> for SigVisitor {
            type Value = Signature;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "a {}-byte signature", SIGNATURE_LENGTH)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut bytes = [0u8; SIGNATURE_LENGTH];
                for (i, slot) in bytes.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Signature::from_bytes(&bytes).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_tuple(SIGNATURE_LENGTH, SigVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_recover_roundtrip() {
        let sk = SecretKey::generate();
        let digest = Hash::keccak(b"message");
        let sig = sk.sign_hash(&digest).unwrap();
        assert_eq!(sig.recover_address(&digest).unwrap(), sk.address());
    }

    #[test]
    fn test_recover_with_wrong_digest_gives_other_address() {
        let sk = SecretKey::generate();
        let sig = sk.sign_hash(&Hash::keccak(b"a")).unwrap();
        let recovered = sig.recover_address(&Hash::keccak(b"b"));
        // Recovery either fails or yields an unrelated address; it must never
        // attribute the signature to the real signer.
        if let Ok(addr) = recovered {
            assert_ne!(addr, sk.address());
        }
    }

    #[test]
    fn test_signature_byte_roundtrip() {
        let sk = SecretKey::generate();
        let digest = Hash::keccak(b"wire");
        let sig = sk.sign_hash(&digest).unwrap();
        let decoded = Signature::from_bytes(&sig.to_bytes()).unwrap();
        assert_eq!(decoded, sig);
        assert_eq!(decoded.recover_address(&digest).unwrap(), sk.address());
    }

    #[test]
    fn test_signature_rejects_bad_length() {
        assert_eq!(
            Signature::from_bytes(&[0u8; 64]),
            Err(CryptoError::InvalidSignature(64))
        );
    }

    #[test]
    fn test_address_is_stable_for_a_key() {
        let sk = SecretKey::generate();
        assert_eq!(sk.address(), sk.public().address());
    }

    #[test]
    fn test_secret_key_from_bytes_rejects_zero() {
        assert!(SecretKey::from_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_secret_key_byte_roundtrip() {
        let sk = SecretKey::generate();
        let restored = SecretKey::from_bytes(&sk.to_bytes()).unwrap();
        assert_eq!(restored.address(), sk.address());
    }
}
