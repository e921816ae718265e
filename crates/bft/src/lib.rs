//! BFT consensus engine.
//!
//! This crate drives a fixed set of validators to agreement on an ordered
//! sequence of blocks, tolerating up to ⌊(n−1)/3⌋ arbitrary failures. It is
//! organized as a three-layer state machine:
//!
//! - [`ConsensusManager`] routes ingress, owns shared state, and drives the
//!   active height from a driver thread.
//! - [`HeightManager`] owns the rounds of one height and answers the
//!   highest-round lockset and vote-lock queries the voting rules need.
//! - [`RoundManager`] owns the two locksets of one round and applies the
//!   propose / prevote / precommit rules on every `process()` tick.
//!
//! # Safety
//!
//! - **One vote per validator per round**: locksets reject a second,
//!   different vote from the same sender.
//!
//! - **Lock discipline**: once a validator precommits a block at a height it
//!   keeps prevoting that block in later rounds, until a later-round
//!   voting instruction proves a quorum formed above the lock.
//!
//! - **Quorum intersection**: two quorums of strictly more than two thirds
//!   overlap in an honest validator, so two different blocks can never both
//!   gather a precommit quorum at one height. If the bookkeeping ever
//!   observes two such quorums the process halts rather than continue on a
//!   forked state.
//!
//! # Liveness
//!
//! - **Round rotation**: the proposer of `(height, round)` is chosen
//!   round-robin, so a faulty proposer only stalls one round.
//!
//! - **Timeout escalation**: prevote and precommit deadlines grow by a
//!   configurable factor per round, giving slow links room to catch up.
//!
//! - **Catch-up**: a node missing the committing lockset for an accepted
//!   header fetches it from peers through the [`Synchronizer`].
//!
//! All I/O crosses narrow collaborator traits ([`Chain`], [`Transport`],
//! [`KvStore`], [`TransactionPool`]); the engine itself only signs, counts
//! votes, and keeps time.

mod byzantine;
mod clock;
mod config;
mod consensus;
mod height;
mod round;
mod store;
mod synchronizer;
mod traits;
mod validators;

pub mod testonly;

#[cfg(test)]
mod tests;

#[cfg(any(test, feature = "byzantine-testing"))]
pub use byzantine::{ByzantineMode, Strategy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BftConfig, ConfigError};
pub use consensus::{ConsensusManager, EngineError};
pub use height::HeightManager;
pub use round::RoundManager;
pub use store::{ConsensusStore, StoreError, LAST_COMMITTING_LOCKSET_KEY};
pub use synchronizer::{SyncError, Synchronizer};
pub use traits::{Chain, KvStore, PeerId, TransactionPool, Transport};
pub use validators::ValidatorContract;
