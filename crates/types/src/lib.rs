//! Core types for Lockstep consensus.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Hash, cryptographic keys and recoverable signatures
//! - **Consensus types**: Block, Vote, PrecommitVote, LockSet, proposals
//! - **Liveness**: the Ready heartbeat
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.
//!
//! Every signed object hashes as the Keccak-256 digest of its canonical
//! encoding minus the signature, and the signature covers that digest. The
//! canonical encoding is fixed-width little-endian bincode, so two nodes
//! encoding the same object always produce identical bytes.

mod block;
mod crypto;
mod encoding;
mod hash;
mod lockset;
mod proposal;
mod ready;
mod vote;

pub use block::{Block, BlockHeader, Transaction};
pub use crypto::{Address, CryptoError, PublicKey, SecretKey, Signature};
pub use encoding::signing_bytes;
pub use hash::Hash;
pub use lockset::{LockSet, LockSetError, PrecommitLockSet, RoundVote, VoteSet};
pub use proposal::{BlockProposal, Proposal, ProposalError, VotingInstruction};
pub use ready::Ready;
pub use vote::{PrecommitVote, Vote, VoteError, VoteType};

/// Block height, counted from genesis = 0.
pub type Height = u64;

/// Round number within a height, starting at 0.
pub type Round = u64;
