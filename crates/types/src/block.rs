//! Minimal block structures.
//!
//! Block execution and validation live outside the consensus engine; the
//! engine only needs the chain linkage (number, parent hash) and a stable
//! block hash to vote on. Transactions are carried as opaque bytes.

use serde::{Deserialize, Serialize};

use crate::crypto::Address;
use crate::encoding::signing_bytes;
use crate::hash::Hash;
use crate::Height;

/// An opaque, pre-validated transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction(pub Vec<u8>);

/// Consensus-relevant block metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Position in the chain; genesis is 0.
    pub number: Height,
    /// Hash of the parent block header.
    pub parent_hash: Hash,
    /// Validator that sealed this block.
    pub proposer: Address,
    /// Seal time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Free-form extra data.
    pub extra: Vec<u8>,
}

impl BlockHeader {
    /// The block hash: Keccak-256 of the canonical header encoding.
    pub fn hash(&self) -> Hash {
        Hash::keccak(&signing_bytes(self))
    }
}

/// A block: header plus opaque payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Consensus metadata.
    pub header: BlockHeader,
    /// Opaque payload.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a block from a header and payload.
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// The block hash (header hash; the payload is committed to via `extra`
    /// by the external builder, which is out of scope here).
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// The block number.
    pub fn number(&self) -> Height {
        self.header.number
    }

    /// The parent block hash.
    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }
}
