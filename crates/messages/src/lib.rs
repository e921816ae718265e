//! Gossip messages for Lockstep consensus.
//!
//! [`Message`] is the tagged union of every payload exchanged between
//! validators; [`codec`] turns messages into canonical framed bytes and back.

mod codec;

pub use codec::{decode_framed, encode_framed, CodecError, CODEC_VERSION, MAX_MESSAGE_SIZE};

use serde::{Deserialize, Serialize};

use lockstep_types::{
    BlockProposal, Height, PrecommitLockSet, PrecommitVote, Proposal, Ready, Vote,
    VotingInstruction,
};

/// Every payload a validator may broadcast or send to a peer.
///
/// The wire tag of each variant is its declaration index, fixed below; new
/// variants append at the end.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Liveness heartbeat.
    Ready(Ready),
    /// A fresh block proposal.
    BlockProposal(BlockProposal),
    /// A re-proposal instruction.
    VotingInstruction(VotingInstruction),
    /// A prevote.
    Vote(Vote),
    /// A precommit vote.
    PrecommitVote(PrecommitVote),
    /// Bulk committing locksets, shipped for catch-up.
    PrecommitLockSets(Vec<PrecommitLockSet>),
    /// Request committing locksets by block number.
    GetPrecommitLockSets(Vec<Height>),
}

impl Message {
    /// The numeric wire code of this message.
    pub fn code(&self) -> u8 {
        match self {
            Message::Ready(_) => 0,
            Message::BlockProposal(_) => 1,
            Message::VotingInstruction(_) => 2,
            Message::Vote(_) => 3,
            Message::PrecommitVote(_) => 4,
            Message::PrecommitLockSets(_) => 5,
            Message::GetPrecommitLockSets(_) => 6,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Ready(_) => "ready",
            Message::BlockProposal(_) => "block_proposal",
            Message::VotingInstruction(_) => "voting_instruction",
            Message::Vote(_) => "vote",
            Message::PrecommitVote(_) => "precommit_vote",
            Message::PrecommitLockSets(_) => "precommit_locksets",
            Message::GetPrecommitLockSets(_) => "get_precommit_locksets",
        }
    }
}

impl From<Proposal> for Message {
    fn from(proposal: Proposal) -> Self {
        match proposal {
            Proposal::Block(p) => Message::BlockProposal(p),
            Proposal::Instruction(p) => Message::VotingInstruction(p),
        }
    }
}
