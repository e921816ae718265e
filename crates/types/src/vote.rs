//! Prevotes and precommit votes.
//!
//! The two vote kinds are identical in shape but semantically distinct and
//! counted in separate locksets. Their signing preimages carry different
//! domain tags, so a prevote can never be replayed as a precommit.

use serde::{Deserialize, Serialize};

use crate::crypto::{Address, CryptoError, SecretKey, Signature};
use crate::encoding::signing_bytes;
use crate::hash::Hash;
use crate::{Height, Round};

/// Domain tag mixed into prevote signing preimages.
pub(crate) const DOMAIN_PREVOTE: &[u8] = b"lockstep/prevote";
/// Domain tag mixed into precommit signing preimages.
pub(crate) const DOMAIN_PRECOMMIT: &[u8] = b"lockstep/precommit";

/// What a vote endorses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteType {
    /// A concrete block; the vote's blockhash is non-nil.
    Block,
    /// No block this round; the vote's blockhash is the nil-hash.
    Nil,
    /// The proposal was seen and judged invalid.
    Invalid,
}

/// Structural errors in a vote.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoteError {
    /// A Block vote must carry a non-nil blockhash.
    #[error("block vote with nil blockhash")]
    BlockVoteWithoutHash,

    /// A Nil vote must carry the nil blockhash.
    #[error("nil vote with non-nil blockhash")]
    NilVoteWithHash,

    /// Signing or recovery failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

fn check_shape(vote_type: VoteType, blockhash: &Hash) -> Result<(), VoteError> {
    match vote_type {
        VoteType::Block if blockhash.is_zero() => Err(VoteError::BlockVoteWithoutHash),
        VoteType::Nil if !blockhash.is_zero() => Err(VoteError::NilVoteWithHash),
        _ => Ok(()),
    }
}

fn preimage(
    domain: &[u8],
    height: Height,
    round: Round,
    blockhash: &Hash,
    vote_type: VoteType,
) -> Hash {
    let mut bytes = domain.to_vec();
    bytes.extend_from_slice(&signing_bytes(&(height, round, blockhash, vote_type)));
    Hash::keccak(&bytes)
}

macro_rules! vote_kind {
    ($(#[$doc:meta])* $name:ident, $domain:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            /// Height this vote belongs to.
            pub height: Height,
            /// Round this vote belongs to.
            pub round: Round,
            /// Endorsed block hash, or the nil-hash.
            pub blockhash: Hash,
            /// What the vote endorses.
            pub vote_type: VoteType,
            /// Recoverable signature over the signing hash.
            pub signature: Signature,
        }

        impl $name {
            /// Create and sign a vote. Enforces the blockhash/type shape
            /// invariants at construction.
            pub fn new(
                height: Height,
                round: Round,
                blockhash: Hash,
                vote_type: VoteType,
                key: &SecretKey,
            ) -> Result<Self, VoteError> {
                check_shape(vote_type, &blockhash)?;
                let digest = preimage($domain, height, round, &blockhash, vote_type);
                let signature = key.sign_hash(&digest)?;
                Ok(Self {
                    height,
                    round,
                    blockhash,
                    vote_type,
                    signature,
                })
            }

            /// Create and sign a vote for a concrete block.
            pub fn block(
                height: Height,
                round: Round,
                blockhash: Hash,
                key: &SecretKey,
            ) -> Result<Self, VoteError> {
                Self::new(height, round, blockhash, VoteType::Block, key)
            }

            /// Create and sign a Nil vote.
            pub fn nil(height: Height, round: Round, key: &SecretKey) -> Result<Self, VoteError> {
                Self::new(height, round, Hash::ZERO, VoteType::Nil, key)
            }

            /// The digest the signature covers.
            pub fn signing_hash(&self) -> Hash {
                preimage($domain, self.height, self.round, &self.blockhash, self.vote_type)
            }

            /// Structural validity of a vote received from the wire.
            pub fn check(&self) -> Result<(), VoteError> {
                check_shape(self.vote_type, &self.blockhash)
            }

            /// Recover the signer address.
            pub fn sender(&self) -> Result<Address, CryptoError> {
                self.signature.recover_address(&self.signing_hash())
            }
        }
    };
}

vote_kind!(
    /// A prevote: first-phase vote collected in a [`crate::LockSet`].
    Vote,
    DOMAIN_PREVOTE
);

vote_kind!(
    /// A precommit vote: second-phase vote collected in a
    /// [`crate::PrecommitLockSet`]. A quorum of these commits the block.
    PrecommitVote,
    DOMAIN_PRECOMMIT
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_sign_and_recover() {
        let key = SecretKey::generate();
        let vote = Vote::block(3, 1, Hash::keccak(b"blk"), &key).unwrap();
        assert_eq!(vote.sender().unwrap(), key.address());
    }

    #[test]
    fn test_shape_invariants() {
        let key = SecretKey::generate();
        assert_eq!(
            Vote::new(1, 0, Hash::ZERO, VoteType::Block, &key),
            Err(VoteError::BlockVoteWithoutHash)
        );
        assert_eq!(
            Vote::new(1, 0, Hash::keccak(b"x"), VoteType::Nil, &key),
            Err(VoteError::NilVoteWithHash)
        );
        assert!(Vote::nil(1, 0, &key).is_ok());
    }

    #[test]
    fn test_prevote_and_precommit_domains_differ() {
        let key = SecretKey::generate();
        let hash = Hash::keccak(b"blk");
        let prevote = Vote::block(5, 0, hash, &key).unwrap();
        let precommit = PrecommitVote::block(5, 0, hash, &key).unwrap();
        // Same tuple, different signing domains: a relayed prevote signature
        // cannot pass as a precommit.
        assert_ne!(prevote.signing_hash(), precommit.signing_hash());
        let forged = PrecommitVote {
            height: 5,
            round: 0,
            blockhash: hash,
            vote_type: VoteType::Block,
            signature: prevote.signature.clone(),
        };
        assert_ne!(forged.sender().ok(), Some(key.address()));
    }

    #[test]
    fn test_tampered_vote_changes_sender() {
        let key = SecretKey::generate();
        let mut vote = Vote::block(3, 1, Hash::keccak(b"blk"), &key).unwrap();
        vote.round = 2;
        assert_ne!(vote.sender().ok(), Some(key.address()));
    }
}
