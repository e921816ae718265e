//! Per-height round bookkeeping.
//!
//! A height manager owns the rounds of one height, tracks which round is
//! active, and answers the highest-round lockset and vote-lock queries that
//! the proposal and prevote rules depend on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use lockstep_types::{
    Hash, Height, LockSet, PrecommitLockSet, PrecommitVote, Proposal, Round, Vote, VoteType,
};
use tracing::{debug, warn};

use crate::consensus::ConsensusManager;
use crate::round::RoundManager;

/// Rounds of one height.
pub struct HeightManager {
    height: Height,
    eligible_votes: u64,
    rounds: RwLock<BTreeMap<Round, Arc<RoundManager>>>,
    active_round: AtomicU64,
}

impl HeightManager {
    pub(crate) fn new(height: Height, eligible_votes: u64) -> Self {
        Self {
            height,
            eligible_votes,
            rounds: RwLock::new(BTreeMap::new()),
            active_round: AtomicU64::new(0),
        }
    }

    /// Height this manager drives.
    pub fn height(&self) -> Height {
        self.height
    }

    /// The round the driver is currently working on.
    pub fn active_round(&self) -> Round {
        self.active_round.load(Ordering::SeqCst)
    }

    /// Move on to the next round.
    pub(crate) fn advance_round(&self) {
        self.active_round.fetch_add(1, Ordering::SeqCst);
    }

    /// The round manager for `round`, created lazily on first reference.
    pub fn round_manager(&self, round: Round) -> Arc<RoundManager> {
        if let Some(rm) = self.rounds.read().expect("lock poisoned").get(&round) {
            return rm.clone();
        }
        let mut rounds = self.rounds.write().expect("lock poisoned");
        rounds
            .entry(round)
            .or_insert_with(|| Arc::new(RoundManager::new(self.height, round, self.eligible_votes)))
            .clone()
    }

    /// Existing rounds, highest first.
    fn rounds_desc(&self) -> Vec<Arc<RoundManager>> {
        let rounds = self.rounds.read().expect("lock poisoned");
        rounds.values().rev().cloned().collect()
    }

    /// Existing rounds, lowest first.
    fn rounds_asc(&self) -> Vec<Arc<RoundManager>> {
        let rounds = self.rounds.read().expect("lock poisoned");
        rounds.values().cloned().collect()
    }

    /// The highest-round prevote this node emitted at this height.
    pub fn last_vote_lock(&self) -> Option<Vote> {
        self.rounds_desc().iter().find_map(|rm| rm.vote_lock())
    }

    /// The highest-round block precommit this node emitted at this height.
    /// Only Block-typed precommits ever bind later rounds.
    pub fn last_precommit_vote_lock(&self) -> Option<PrecommitVote> {
        self.rounds_desc()
            .iter()
            .find_map(|rm| rm.precommit_vote_lock())
            .filter(|lock| lock.vote_type == VoteType::Block)
    }

    /// The highest-round valid prevote lockset at this height.
    pub fn last_valid_lockset(&self) -> Option<LockSet> {
        self.rounds_desc()
            .iter()
            .map(|rm| rm.lockset())
            .find(|lockset| lockset.is_valid())
    }

    /// The highest-round valid precommit lockset at this height.
    pub fn last_valid_precommit_lockset(&self) -> Option<PrecommitLockSet> {
        self.rounds_desc()
            .iter()
            .map(|rm| rm.precommit_lockset())
            .find(|lockset| lockset.is_valid())
    }

    /// The prevote lockset that reached a quorum at this height, if any.
    pub fn last_quorum_lockset(&self) -> Option<LockSet> {
        let mut found: Option<(LockSet, Hash)> = None;
        for rm in self.rounds_asc() {
            let lockset = rm.lockset();
            if !lockset.is_valid() {
                continue;
            }
            let Some(hash) = lockset.has_quorum() else {
                continue;
            };
            if let Some((_, prior)) = &found {
                if *prior != hash {
                    warn!(
                        height = self.height,
                        first = %prior,
                        second = %hash,
                        "prevote quorums on two blocks at one height"
                    );
                }
            }
            found = Some((lockset, hash));
        }
        found.map(|(lockset, _)| lockset)
    }

    /// The precommit lockset that reached a quorum at this height, if any.
    ///
    /// # Panics
    ///
    /// Two distinct quorum targets at one height mean quorum intersection is
    /// broken and no continuation is safe: the process halts.
    pub fn last_quorum_precommit_lockset(&self) -> Option<PrecommitLockSet> {
        let mut found: Option<(PrecommitLockSet, Hash)> = None;
        for rm in self.rounds_asc() {
            let lockset = rm.precommit_lockset();
            if !lockset.is_valid() {
                continue;
            }
            let Some(hash) = lockset.has_quorum() else {
                continue;
            };
            if let Some((_, prior)) = &found {
                assert!(
                    *prior == hash,
                    "safety violation: precommit quorums for {prior} and {hash} at height {}",
                    self.height
                );
            }
            found = Some((lockset, hash));
        }
        found.map(|(lockset, _)| lockset)
    }

    /// The committed hash at this height, if a precommit quorum exists.
    pub fn has_quorum(&self) -> Option<Hash> {
        self.last_quorum_precommit_lockset()
            .and_then(|lockset| lockset.has_quorum())
    }

    /// Route a prevote to its round. The sender must already be known to be
    /// a validator; the node's own votes may replace earlier copies (restart
    /// re-admission).
    pub(crate) fn add_vote(&self, cm: &ConsensusManager, vote: Vote) -> bool {
        let force_replace = vote
            .sender()
            .map(|sender| sender == cm.coinbase())
            .unwrap_or(false);
        let rm = self.round_manager(vote.round);
        match rm.add_vote(vote, force_replace) {
            Ok(inserted) => inserted,
            Err(err) => {
                debug!(height = self.height, %err, "prevote rejected");
                false
            }
        }
    }

    /// Route a precommit to its round.
    pub(crate) fn add_precommit_vote(&self, cm: &ConsensusManager, vote: PrecommitVote) -> bool {
        let force_replace = vote
            .sender()
            .map(|sender| sender == cm.coinbase())
            .unwrap_or(false);
        let rm = self.round_manager(vote.round);
        match rm.add_precommit_vote(cm, vote, force_replace) {
            Ok(inserted) => inserted,
            Err(err) => {
                debug!(height = self.height, %err, "precommit rejected");
                false
            }
        }
    }

    /// Route a proposal to its round.
    pub(crate) fn add_proposal(&self, proposal: Proposal) -> bool {
        self.round_manager(proposal.round()).add_proposal(proposal)
    }

    /// Drive the active round one step.
    pub(crate) fn process(&self, cm: &ConsensusManager) {
        let rm = self.round_manager(self.active_round());
        rm.process(cm, self);
    }
}

impl std::fmt::Debug for HeightManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeightManager")
            .field("height", &self.height)
            .field("active_round", &self.active_round())
            .field("rounds", &self.rounds.read().expect("lock poisoned").len())
            .finish()
    }
}
