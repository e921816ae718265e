//! Proposals: fresh blocks and re-proposal instructions.
//!
//! A proposer either ships a concrete block ([`BlockProposal`]) or, when a
//! previous round already reached a prevote quorum that never committed,
//! points later rounds back at that block ([`VotingInstruction`]). The two
//! differ in both shape and semantics, so they are one sum type matched
//! exhaustively rather than a trait object.

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::crypto::{Address, CryptoError, SecretKey, Signature};
use crate::encoding::signing_bytes;
use crate::hash::Hash;
use crate::lockset::{LockSet, PrecommitLockSet};
use crate::{Height, Round};

const DOMAIN_BLOCK_PROPOSAL: &[u8] = b"lockstep/block-proposal";
const DOMAIN_VOTING_INSTRUCTION: &[u8] = b"lockstep/voting-instruction";

/// Structural errors in a proposal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposalError {
    /// The proposed block's number does not match the proposal height.
    #[error("block number {block} does not match proposal height {height}")]
    HeightMismatch {
        /// Proposal height.
        height: Height,
        /// Block number.
        block: Height,
    },

    /// A proposal at round > 0 must justify the round advance.
    #[error("proposal at round {0} without a round lockset")]
    RoundLocksetMissing(Round),

    /// A proposal at round 0 must not carry a round lockset.
    #[error("proposal at round 0 with a round lockset")]
    RoundLocksetUnexpected,

    /// The attached round lockset is not for the preceding round.
    #[error("round lockset for ({got_height:?}, {got_round:?}), expected ({height}, {round})")]
    WrongRoundLockset {
        /// Expected height.
        height: Height,
        /// Expected round (proposal round − 1).
        round: Round,
        /// Lockset height.
        got_height: Option<Height>,
        /// Lockset round.
        got_round: Option<Round>,
    },

    /// Voting instructions only exist for rounds after the first.
    #[error("voting instruction at round 0")]
    InstructionAtRoundZero,

    /// A voting instruction must carry a quorum lockset to point at a block.
    #[error("voting instruction lockset has no quorum")]
    InstructionWithoutQuorum,

    /// Signing or recovery failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A fresh block proposal.
///
/// `signing_lockset` is the precommit lockset that committed the parent
/// block, proving parent finality. `round_lockset` is the NoQuorum prevote
/// lockset of the preceding round, required exactly when `round > 0`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockProposal {
    /// Proposal height.
    pub height: Height,
    /// Proposal round.
    pub round: Round,
    /// The proposed block.
    pub block: Block,
    /// Quorum precommit lockset of height − 1 on the block's parent.
    pub signing_lockset: PrecommitLockSet,
    /// NoQuorum prevote lockset of round − 1; present iff round > 0.
    pub round_lockset: Option<LockSet>,
    /// Proposer signature.
    pub signature: Signature,
}

impl BlockProposal {
    /// Create and sign a block proposal, enforcing the shape invariants.
    pub fn new(
        height: Height,
        round: Round,
        block: Block,
        signing_lockset: PrecommitLockSet,
        round_lockset: Option<LockSet>,
        key: &SecretKey,
    ) -> Result<Self, ProposalError> {
        if block.number() != height {
            return Err(ProposalError::HeightMismatch {
                height,
                block: block.number(),
            });
        }
        match (&round_lockset, round) {
            (None, 0) => {}
            (None, r) => return Err(ProposalError::RoundLocksetMissing(r)),
            (Some(_), 0) => return Err(ProposalError::RoundLocksetUnexpected),
            (Some(ls), r) => {
                if ls.height() != Some(height) || ls.round() != Some(r - 1) {
                    return Err(ProposalError::WrongRoundLockset {
                        height,
                        round: r - 1,
                        got_height: ls.height(),
                        got_round: ls.round(),
                    });
                }
            }
        }
        let digest = Self::preimage(height, round, &block, &signing_lockset, &round_lockset);
        let signature = key.sign_hash(&digest)?;
        Ok(Self {
            height,
            round,
            block,
            signing_lockset,
            round_lockset,
            signature,
        })
    }

    fn preimage(
        height: Height,
        round: Round,
        block: &Block,
        signing_lockset: &PrecommitLockSet,
        round_lockset: &Option<LockSet>,
    ) -> Hash {
        let mut bytes = DOMAIN_BLOCK_PROPOSAL.to_vec();
        bytes.extend_from_slice(&signing_bytes(&(
            height,
            round,
            block,
            signing_lockset,
            round_lockset,
        )));
        Hash::keccak(&bytes)
    }

    /// The digest the proposer signature covers.
    pub fn signing_hash(&self) -> Hash {
        Self::preimage(
            self.height,
            self.round,
            &self.block,
            &self.signing_lockset,
            &self.round_lockset,
        )
    }

    /// Hash of the proposed block.
    pub fn blockhash(&self) -> Hash {
        self.block.hash()
    }

    /// Recover the proposer address.
    pub fn sender(&self) -> Result<Address, CryptoError> {
        self.signature.recover_address(&self.signing_hash())
    }
}

/// An instruction to re-propose an already prevote-quorate block.
///
/// Emitted by the proposer of a later round when the preceding round reached
/// a prevote quorum that never committed (for example across a partition).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VotingInstruction {
    /// Instruction height.
    pub height: Height,
    /// Instruction round.
    pub round: Round,
    /// Quorum prevote lockset of round − 1 naming the block to re-propose.
    pub round_lockset: LockSet,
    /// Proposer signature.
    pub signature: Signature,
}

impl VotingInstruction {
    /// Create and sign a voting instruction, enforcing the shape invariants.
    pub fn new(
        height: Height,
        round: Round,
        round_lockset: LockSet,
        key: &SecretKey,
    ) -> Result<Self, ProposalError> {
        if round == 0 {
            return Err(ProposalError::InstructionAtRoundZero);
        }
        if round_lockset.height() != Some(height) || round_lockset.round() != Some(round - 1) {
            return Err(ProposalError::WrongRoundLockset {
                height,
                round: round - 1,
                got_height: round_lockset.height(),
                got_round: round_lockset.round(),
            });
        }
        if round_lockset.has_quorum().is_none() {
            return Err(ProposalError::InstructionWithoutQuorum);
        }
        let digest = Self::preimage(height, round, &round_lockset);
        let signature = key.sign_hash(&digest)?;
        Ok(Self {
            height,
            round,
            round_lockset,
            signature,
        })
    }

    fn preimage(height: Height, round: Round, round_lockset: &LockSet) -> Hash {
        let mut bytes = DOMAIN_VOTING_INSTRUCTION.to_vec();
        bytes.extend_from_slice(&signing_bytes(&(height, round, round_lockset)));
        Hash::keccak(&bytes)
    }

    /// The digest the proposer signature covers.
    pub fn signing_hash(&self) -> Hash {
        Self::preimage(self.height, self.round, &self.round_lockset)
    }

    /// The block hash the instruction points at: the quorum target of its
    /// lockset. `None` for a malformed instruction received from the wire.
    pub fn blockhash(&self) -> Option<Hash> {
        self.round_lockset.has_quorum()
    }

    /// Recover the proposer address.
    pub fn sender(&self) -> Result<Address, CryptoError> {
        self.signature.recover_address(&self.signing_hash())
    }
}

/// Either kind of proposal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Proposal {
    /// A fresh block.
    Block(BlockProposal),
    /// A re-proposal of an already prevote-quorate block.
    Instruction(VotingInstruction),
}

impl Proposal {
    /// Proposal height.
    pub fn height(&self) -> Height {
        match self {
            Proposal::Block(p) => p.height,
            Proposal::Instruction(p) => p.height,
        }
    }

    /// Proposal round.
    pub fn round(&self) -> Round {
        match self {
            Proposal::Block(p) => p.round,
            Proposal::Instruction(p) => p.round,
        }
    }

    /// The block hash this proposal endorses.
    pub fn blockhash(&self) -> Option<Hash> {
        match self {
            Proposal::Block(p) => Some(p.blockhash()),
            Proposal::Instruction(p) => p.blockhash(),
        }
    }

    /// Recover the proposer address.
    pub fn sender(&self) -> Result<Address, CryptoError> {
        match self {
            Proposal::Block(p) => p.sender(),
            Proposal::Instruction(p) => p.sender(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockHeader, Transaction};
    use crate::vote::{PrecommitVote, Vote};

    fn block(number: Height, parent: Hash) -> Block {
        Block::new(
            BlockHeader {
                number,
                parent_hash: parent,
                proposer: Address::default(),
                timestamp: 0,
                extra: vec![],
            },
            vec![Transaction(vec![0xca, 0xfe])],
        )
    }

    fn signing_lockset(parent: Hash, keys: &[SecretKey]) -> PrecommitLockSet {
        let mut set = PrecommitLockSet::new(keys.len() as u64);
        for key in keys {
            set.add(PrecommitVote::block(0, 0, parent, key).unwrap(), false)
                .unwrap();
        }
        set
    }

    fn quorum_lockset(height: Height, round: Round, hash: Hash, keys: &[SecretKey]) -> LockSet {
        let mut set = LockSet::new(keys.len() as u64);
        for key in keys {
            set.add(Vote::block(height, round, hash, key).unwrap(), false)
                .unwrap();
        }
        set
    }

    #[test]
    fn test_fresh_proposal_roundtrip() {
        let keys: Vec<_> = (0..4).map(|_| SecretKey::generate()).collect();
        let parent = Hash::keccak(b"parent");
        let proposal = BlockProposal::new(
            1,
            0,
            block(1, parent),
            signing_lockset(parent, &keys),
            None,
            &keys[0],
        )
        .unwrap();
        assert_eq!(proposal.sender().unwrap(), keys[0].address());
        assert!(!proposal.blockhash().is_zero());
    }

    #[test]
    fn test_round_lockset_shape_is_enforced() {
        let keys: Vec<_> = (0..4).map(|_| SecretKey::generate()).collect();
        let parent = Hash::keccak(b"parent");
        let signing = signing_lockset(parent, &keys);

        assert_eq!(
            BlockProposal::new(1, 1, block(1, parent), signing.clone(), None, &keys[0]),
            Err(ProposalError::RoundLocksetMissing(1))
        );

        let wrong_round = quorum_lockset(1, 1, Hash::keccak(b"x"), &keys);
        assert!(matches!(
            BlockProposal::new(
                1,
                1,
                block(1, parent),
                signing.clone(),
                Some(wrong_round),
                &keys[0]
            ),
            Err(ProposalError::WrongRoundLockset { .. })
        ));

        let round0 = quorum_lockset(1, 0, Hash::keccak(b"x"), &keys);
        assert_eq!(
            BlockProposal::new(1, 0, block(1, parent), signing, Some(round0), &keys[0]),
            Err(ProposalError::RoundLocksetUnexpected)
        );
    }

    #[test]
    fn test_block_number_must_match_height() {
        let keys: Vec<_> = (0..4).map(|_| SecretKey::generate()).collect();
        let parent = Hash::keccak(b"parent");
        assert_eq!(
            BlockProposal::new(2, 0, block(1, parent), signing_lockset(parent, &keys), None, &keys[0]),
            Err(ProposalError::HeightMismatch { height: 2, block: 1 })
        );
    }

    #[test]
    fn test_instruction_requires_quorum() {
        let keys: Vec<_> = (0..4).map(|_| SecretKey::generate()).collect();
        let hash = Hash::keccak(b"x");

        let quorate = quorum_lockset(1, 0, hash, &keys);
        let instruction = VotingInstruction::new(1, 1, quorate, &keys[0]).unwrap();
        assert_eq!(instruction.blockhash(), Some(hash));
        assert_eq!(instruction.sender().unwrap(), keys[0].address());

        let mut split = LockSet::new(4);
        split
            .add(Vote::block(1, 0, hash, &keys[0]).unwrap(), false)
            .unwrap();
        split.add(Vote::nil(1, 0, &keys[1]).unwrap(), false).unwrap();
        assert_eq!(
            VotingInstruction::new(1, 1, split, &keys[0]),
            Err(ProposalError::InstructionWithoutQuorum)
        );
    }

    #[test]
    fn test_instruction_never_at_round_zero() {
        let keys: Vec<_> = (0..4).map(|_| SecretKey::generate()).collect();
        let quorate = quorum_lockset(1, 0, Hash::keccak(b"x"), &keys);
        assert_eq!(
            VotingInstruction::new(1, 0, quorate, &keys[0]),
            Err(ProposalError::InstructionAtRoundZero)
        );
    }
}
