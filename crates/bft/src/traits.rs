//! Collaborator contracts.
//!
//! The engine consumes the chain store, transaction pool, wire transport and
//! persistent key–value store only through these narrow traits; everything
//! behind them is out of scope and replaceable.

use lockstep_messages::Message;
use lockstep_types::{Block, Height, PrecommitLockSet, Transaction};

use crate::store::StoreError;

/// Identifies a connected peer for targeted sends.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Read-only view over the block store.
pub trait Chain: Send + Sync {
    /// The current chain head.
    fn current_block(&self) -> Block;

    /// The genesis block.
    fn genesis(&self) -> Block;

    /// A block by number, if present.
    fn block_by_number(&self, number: Height) -> Option<Block>;
}

/// Read-only view over the transaction pool. Used only to decide whether the
/// node is waiting to propose (empty-block policy).
pub trait TransactionPool: Send + Sync {
    /// Pending transactions.
    fn pending(&self) -> Vec<Transaction>;
}

/// Outbound message delivery. Implementations own threading and reliability;
/// the engine treats every send as fire-and-forget.
pub trait Transport: Send + Sync {
    /// Gossip a message to all peers.
    fn broadcast(&self, message: Message);

    /// Ship committing locksets to one peer (catch-up reply).
    fn send_precommit_locksets(&self, peer: PeerId, locksets: Vec<PrecommitLockSet>);

    /// Ask one peer for the committing locksets of the given block numbers.
    fn request_precommit_locksets(&self, peer: PeerId, heights: Vec<Height>);
}

/// Byte-oriented persistent store. Implementations provide their own internal
/// synchronization and atomicity per call.
pub trait KvStore: Send + Sync {
    /// Read a key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a key.
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;

    /// Write several keys atomically.
    fn put_batch(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), StoreError>;
}
