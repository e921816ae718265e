//! The Ready liveness heartbeat.

use serde::{Deserialize, Serialize};

use crate::crypto::{Address, CryptoError, SecretKey, Signature};
use crate::encoding::signing_bytes;
use crate::hash::Hash;
use crate::lockset::LockSet;

const DOMAIN_READY: &[u8] = b"lockstep/ready";

/// Announces that a validator is online, carrying its current round's prevote
/// lockset. A node starts driving consensus once it has heard from more than
/// two thirds of the validator set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    /// Monotonic per-sender counter; distinguishes successive heartbeats.
    pub nonce: u64,
    /// The sender's current prevote lockset.
    pub lockset: LockSet,
    /// Sender signature.
    pub signature: Signature,
}

impl Ready {
    /// Create and sign a heartbeat.
    pub fn new(nonce: u64, lockset: LockSet, key: &SecretKey) -> Result<Self, CryptoError> {
        let digest = Self::preimage(nonce, &lockset);
        let signature = key.sign_hash(&digest)?;
        Ok(Self {
            nonce,
            lockset,
            signature,
        })
    }

    fn preimage(nonce: u64, lockset: &LockSet) -> Hash {
        let mut bytes = DOMAIN_READY.to_vec();
        bytes.extend_from_slice(&signing_bytes(&(nonce, lockset)));
        Hash::keccak(&bytes)
    }

    /// The digest the signature covers.
    pub fn signing_hash(&self) -> Hash {
        Self::preimage(self.nonce, &self.lockset)
    }

    /// Recover the sender address.
    pub fn sender(&self) -> Result<Address, CryptoError> {
        self.signature.recover_address(&self.signing_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_roundtrip() {
        let key = SecretKey::generate();
        let ready = Ready::new(3, LockSet::new(4), &key).unwrap();
        assert_eq!(ready.sender().unwrap(), key.address());
    }

    #[test]
    fn test_nonce_changes_signing_hash() {
        let key = SecretKey::generate();
        let a = Ready::new(0, LockSet::new(4), &key).unwrap();
        let b = Ready::new(1, LockSet::new(4), &key).unwrap();
        assert_ne!(a.signing_hash(), b.signing_hash());
    }
}
