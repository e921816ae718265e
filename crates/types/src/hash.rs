//! 32-byte block and object hashes.

use serde::{Deserialize, Serialize};
use sha3::Digest as _;

/// A Keccak-256 digest.
///
/// The all-zero hash is the distinguished "nil-hash", meaning "no block".
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The nil-hash.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Compute the Keccak-256 hash of a message.
    pub fn keccak(msg: &[u8]) -> Self {
        Self(sha3::Keccak256::digest(msg).into())
    }

    /// Returns a reference to the bytes of this hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the nil-hash.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form: enough to tell hashes apart in logs.
        write!(f, "0x{}…", hex::encode(&self.0[..4]))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}
