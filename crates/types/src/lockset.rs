//! Locksets: append-only per-round vote collections with quorum arithmetic.
//!
//! A lockset holds at most one vote per validator for one `(height, round)`.
//! It becomes *valid* once strictly more than two thirds of the eligible
//! votes are present, and a valid lockset resolves to either a quorum on one
//! non-nil hash or a Nil-quorum. Locksets are self-signed over their contents
//! so they can be relayed as proof objects inside proposals and catch-up
//! replies.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::{Address, CryptoError, SecretKey, Signature};
use crate::encoding::signing_bytes;
use crate::hash::Hash;
use crate::vote::{PrecommitVote, Vote, VoteError, VoteType};
use crate::{Height, Round};

/// A vote that can be collected in a [`VoteSet`].
pub trait RoundVote: Clone + PartialEq + Serialize + DeserializeOwned {
    /// Domain tag for the containing set's self-signature.
    const SET_DOMAIN: &'static [u8];

    /// Height the vote belongs to.
    fn height(&self) -> Height;
    /// Round the vote belongs to.
    fn round(&self) -> Round;
    /// Endorsed hash (nil-hash for Nil votes).
    fn blockhash(&self) -> Hash;
    /// Vote kind.
    fn vote_type(&self) -> VoteType;
    /// Structural shape check.
    fn check(&self) -> Result<(), VoteError>;
    /// Recover the signer.
    fn sender(&self) -> Result<Address, CryptoError>;
}

impl RoundVote for Vote {
    const SET_DOMAIN: &'static [u8] = b"lockstep/lockset";

    fn height(&self) -> Height {
        self.height
    }
    fn round(&self) -> Round {
        self.round
    }
    fn blockhash(&self) -> Hash {
        self.blockhash
    }
    fn vote_type(&self) -> VoteType {
        self.vote_type
    }
    fn check(&self) -> Result<(), VoteError> {
        Vote::check(self)
    }
    fn sender(&self) -> Result<Address, CryptoError> {
        Vote::sender(self)
    }
}

impl RoundVote for PrecommitVote {
    const SET_DOMAIN: &'static [u8] = b"lockstep/precommit-lockset";

    fn height(&self) -> Height {
        self.height
    }
    fn round(&self) -> Round {
        self.round
    }
    fn blockhash(&self) -> Hash {
        self.blockhash
    }
    fn vote_type(&self) -> VoteType {
        self.vote_type
    }
    fn check(&self) -> Result<(), VoteError> {
        PrecommitVote::check(self)
    }
    fn sender(&self) -> Result<Address, CryptoError> {
        PrecommitVote::sender(self)
    }
}

/// Errors from lockset insertion and validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockSetError {
    /// A different vote from the same validator already exists.
    #[error("double vote from {0}")]
    DoubleVote(Address),

    /// The vote belongs to a different (height, round) than the set.
    #[error("vote for ({got_height}, {got_round}) added to lockset for ({height}, {round})")]
    HeightRoundMismatch {
        /// Set height.
        height: Height,
        /// Set round.
        round: Round,
        /// Vote height.
        got_height: Height,
        /// Vote round.
        got_round: Round,
    },

    /// The vote is malformed or its signature does not recover.
    #[error(transparent)]
    InvalidVote(#[from] VoteError),

    /// The lockset itself carries no self-signature.
    #[error("lockset is not signed")]
    Unsigned,
}

/// Append-only set of votes for one `(height, round)`.
///
/// `eligible_votes` is the validator-set size at the set's height and is 0 at
/// the genesis height, where a single self-vote suffices for quorum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteSet<V> {
    eligible_votes: u64,
    votes: Vec<V>,
    signature: Option<Signature>,
}

/// Prevote lockset.
pub type LockSet = VoteSet<Vote>;
/// Precommit lockset; a quorum here commits the block.
pub type PrecommitLockSet = VoteSet<PrecommitVote>;

impl<V: RoundVote> VoteSet<V> {
    /// Create an empty set for a validator set of the given size.
    pub fn new(eligible_votes: u64) -> Self {
        Self {
            eligible_votes,
            votes: Vec::new(),
            signature: None,
        }
    }

    /// Number of eligible votes at this set's height.
    pub fn eligible_votes(&self) -> u64 {
        self.eligible_votes
    }

    /// The collected votes.
    pub fn votes(&self) -> &[V] {
        &self.votes
    }

    /// Number of collected votes.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    /// Whether no votes have been collected.
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Height of the contained votes, if any.
    pub fn height(&self) -> Option<Height> {
        self.votes.first().map(RoundVote::height)
    }

    /// Round of the contained votes, if any.
    pub fn round(&self) -> Option<Round> {
        self.votes.first().map(RoundVote::round)
    }

    /// Whether the exact vote is already present.
    pub fn contains(&self, vote: &V) -> bool {
        self.votes.iter().any(|v| v == vote)
    }

    /// Add a vote.
    ///
    /// Returns `Ok(true)` if inserted, `Ok(false)` if the identical vote was
    /// already present. A *different* vote from the same validator is a
    /// [`LockSetError::DoubleVote`] unless `force_replace` is set, which is
    /// reserved for re-admitting the node's own votes after a restart.
    pub fn add(&mut self, vote: V, force_replace: bool) -> Result<bool, LockSetError> {
        vote.check()?;
        let sender = vote.sender().map_err(VoteError::from)?;

        if let Some(first) = self.votes.first() {
            if first.height() != vote.height() || first.round() != vote.round() {
                return Err(LockSetError::HeightRoundMismatch {
                    height: first.height(),
                    round: first.round(),
                    got_height: vote.height(),
                    got_round: vote.round(),
                });
            }
        }

        let mut existing = None;
        for (i, vote) in self.votes.iter().enumerate() {
            if vote.sender().map_err(VoteError::from)? == sender {
                existing = Some(i);
                break;
            }
        }
        if let Some(i) = existing {
            if self.votes[i] == vote {
                return Ok(false);
            }
            if !force_replace {
                return Err(LockSetError::DoubleVote(sender));
            }
            self.votes[i] = vote;
        } else {
            self.votes.push(vote);
        }
        self.signature = None;
        Ok(true)
    }

    /// Whether strictly more than two thirds of the eligible votes are
    /// present.
    pub fn is_valid(&self) -> bool {
        3 * self.votes.len() as u64 > 2 * self.eligible_votes
    }

    /// The non-nil hash holding strictly more than two thirds of the
    /// eligible votes, if any.
    pub fn has_quorum(&self) -> Option<Hash> {
        let mut counts: Vec<(Hash, u64)> = Vec::new();
        for vote in &self.votes {
            if vote.vote_type() != VoteType::Block {
                continue;
            }
            let hash = vote.blockhash();
            match counts.iter_mut().find(|(h, _)| *h == hash) {
                Some((_, n)) => *n += 1,
                None => counts.push((hash, 1)),
            }
        }
        counts
            .into_iter()
            .find(|(_, n)| 3 * n > 2 * self.eligible_votes)
            .map(|(hash, _)| hash)
    }

    /// Whether the set is valid and the Nil bucket holds strictly more than
    /// two thirds of the eligible votes.
    pub fn no_quorum(&self) -> bool {
        let nil = self
            .votes
            .iter()
            .filter(|v| v.vote_type() == VoteType::Nil)
            .count() as u64;
        self.is_valid() && 3 * nil > 2 * self.eligible_votes
    }

    /// Digest the self-signature covers: domain tag, eligible count, votes.
    pub fn signing_hash(&self) -> Hash {
        let mut bytes = V::SET_DOMAIN.to_vec();
        bytes.extend_from_slice(&signing_bytes(&(self.eligible_votes, &self.votes)));
        Hash::keccak(&bytes)
    }

    /// Self-sign the set for gossip relay.
    pub fn sign(&mut self, key: &SecretKey) -> Result<(), CryptoError> {
        self.signature = Some(key.sign_hash(&self.signing_hash())?);
        Ok(())
    }

    /// Recover the relay signer.
    pub fn signer(&self) -> Result<Address, LockSetError> {
        let signature = self.signature.as_ref().ok_or(LockSetError::Unsigned)?;
        Ok(signature
            .recover_address(&self.signing_hash())
            .map_err(VoteError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<SecretKey> {
        (0..n).map(|_| SecretKey::generate()).collect()
    }

    fn block_votes(keys: &[SecretKey], hash: Hash) -> Vec<Vote> {
        keys.iter()
            .map(|k| Vote::block(1, 0, hash, k).unwrap())
            .collect()
    }

    #[test]
    fn test_validity_threshold() {
        // n = 4: strictly more than two thirds means at least 3 votes.
        let keys = keys(4);
        let hash = Hash::keccak(b"x");
        let mut set = LockSet::new(4);
        for (i, vote) in block_votes(&keys, hash).into_iter().enumerate() {
            set.add(vote, false).unwrap();
            assert_eq!(set.is_valid(), i + 1 >= 3);
        }
    }

    #[test]
    fn test_quorum_on_single_hash() {
        let keys = keys(4);
        let hash = Hash::keccak(b"x");
        let mut set = LockSet::new(4);
        for vote in block_votes(&keys[..3], hash) {
            set.add(vote, false).unwrap();
        }
        assert_eq!(set.has_quorum(), Some(hash));
        assert!(!set.no_quorum());
    }

    #[test]
    fn test_split_votes_reach_no_verdict() {
        let keys = keys(4);
        let mut set = LockSet::new(4);
        set.add(Vote::block(1, 0, Hash::keccak(b"x"), &keys[0]).unwrap(), false)
            .unwrap();
        set.add(Vote::block(1, 0, Hash::keccak(b"y"), &keys[1]).unwrap(), false)
            .unwrap();
        set.add(Vote::nil(1, 0, &keys[2]).unwrap(), false).unwrap();
        assert!(set.is_valid());
        assert_eq!(set.has_quorum(), None);
        assert!(!set.no_quorum());
    }

    #[test]
    fn test_nil_quorum() {
        let keys = keys(4);
        let mut set = LockSet::new(4);
        for key in &keys[..3] {
            set.add(Vote::nil(1, 0, key).unwrap(), false).unwrap();
        }
        assert!(set.no_quorum());
        assert_eq!(set.has_quorum(), None);
    }

    #[test]
    fn test_duplicate_vote_is_noop() {
        let key = SecretKey::generate();
        let vote = Vote::block(1, 0, Hash::keccak(b"x"), &key).unwrap();
        let mut set = LockSet::new(4);
        assert!(set.add(vote.clone(), false).unwrap());
        assert!(!set.add(vote, false).unwrap());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_double_vote_rejected_unless_forced() {
        let key = SecretKey::generate();
        let first = Vote::block(1, 0, Hash::keccak(b"x"), &key).unwrap();
        let second = Vote::block(1, 0, Hash::keccak(b"y"), &key).unwrap();
        let mut set = LockSet::new(4);
        set.add(first, false).unwrap();
        assert_eq!(
            set.add(second.clone(), false),
            Err(LockSetError::DoubleVote(key.address()))
        );
        // Restart re-admission path.
        assert!(set.add(second.clone(), true).unwrap());
        assert_eq!(set.len(), 1);
        assert!(set.contains(&second));
    }

    #[test]
    fn test_height_round_mismatch() {
        let keys = keys(2);
        let mut set = LockSet::new(4);
        set.add(Vote::block(1, 0, Hash::keccak(b"x"), &keys[0]).unwrap(), false)
            .unwrap();
        let err = set
            .add(Vote::block(1, 1, Hash::keccak(b"x"), &keys[1]).unwrap(), false)
            .unwrap_err();
        assert!(matches!(err, LockSetError::HeightRoundMismatch { .. }));
    }

    #[test]
    fn test_genesis_set_has_quorum_with_one_vote() {
        // eligible_votes = 0 at the genesis height: the node's own signed
        // vote is already a quorum.
        let key = SecretKey::generate();
        let genesis = Hash::keccak(b"genesis");
        let mut set = PrecommitLockSet::new(0);
        set.add(PrecommitVote::block(0, 0, genesis, &key).unwrap(), false)
            .unwrap();
        assert!(set.is_valid());
        assert_eq!(set.has_quorum(), Some(genesis));
    }

    #[test]
    fn test_empty_set_is_not_valid() {
        assert!(!LockSet::new(0).is_valid());
        assert!(!LockSet::new(4).is_valid());
    }

    #[test]
    fn test_self_signature_roundtrip() {
        let keys = keys(2);
        let mut set = LockSet::new(4);
        set.add(Vote::block(1, 0, Hash::keccak(b"x"), &keys[0]).unwrap(), false)
            .unwrap();
        assert_eq!(set.signer(), Err(LockSetError::Unsigned));
        set.sign(&keys[1]).unwrap();
        assert_eq!(set.signer().unwrap(), keys[1].address());
        // Mutation invalidates the relay signature.
        set.add(Vote::block(1, 0, Hash::keccak(b"x"), &keys[1]).unwrap(), false)
            .unwrap();
        assert_eq!(set.signer(), Err(LockSetError::Unsigned));
    }

    #[test]
    fn test_quorum_implies_threshold() {
        // No lockset reports quorum below the strict two-thirds bound.
        let keys = keys(6);
        let hash = Hash::keccak(b"x");
        let mut set = LockSet::new(6);
        for key in &keys[..4] {
            set.add(Vote::block(1, 0, hash, key).unwrap(), false).unwrap();
        }
        // 4 of 6 is exactly two thirds: not a quorum.
        assert_eq!(set.has_quorum(), None);
        set.add(Vote::block(1, 0, hash, &keys[4]).unwrap(), false)
            .unwrap();
        assert_eq!(set.has_quorum(), Some(hash));
    }
}
