//! Per-round voting state machine.
//!
//! A round owns the two locksets for its `(height, round)`, the proposal it
//! accepted, the node's own vote locks, and the two polled deadlines.
//! `process()` applies the propose → prevote → precommit → advance rules in
//! order and is idempotent: on a stable state it emits nothing.

use std::sync::Mutex;
use std::time::Duration;

use lockstep_messages::Message;
use lockstep_types::{
    BlockProposal, Hash, Height, LockSet, LockSetError, PrecommitLockSet, PrecommitVote, Proposal,
    Round, Vote, VoteType, VotingInstruction,
};
use tracing::{debug, error, trace, warn};

use crate::consensus::ConsensusManager;
use crate::height::HeightManager;

#[derive(Default)]
struct RoundState {
    proposal: Option<Proposal>,
    vote_lock: Option<Vote>,
    precommit_vote_lock: Option<PrecommitVote>,
    timeout_prevote: Option<Duration>,
    timeout_precommit: Option<Duration>,
}

/// State machine for one `(height, round)`.
pub struct RoundManager {
    height: Height,
    round: Round,
    lockset: Mutex<LockSet>,
    precommit_lockset: Mutex<PrecommitLockSet>,
    state: Mutex<RoundState>,
    // Serializes process(); ingress never takes this.
    process_mu: Mutex<()>,
}

impl RoundManager {
    pub(crate) fn new(height: Height, round: Round, eligible_votes: u64) -> Self {
        Self {
            height,
            round,
            lockset: Mutex::new(LockSet::new(eligible_votes)),
            precommit_lockset: Mutex::new(PrecommitLockSet::new(eligible_votes)),
            state: Mutex::new(RoundState::default()),
            process_mu: Mutex::new(()),
        }
    }

    /// Height this round belongs to.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Round number.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Snapshot of the prevote lockset.
    pub fn lockset(&self) -> LockSet {
        self.lockset.lock().expect("lock poisoned").clone()
    }

    /// Snapshot of the precommit lockset.
    pub fn precommit_lockset(&self) -> PrecommitLockSet {
        self.precommit_lockset.lock().expect("lock poisoned").clone()
    }

    /// The prevote this node emitted in this round, if any.
    pub fn vote_lock(&self) -> Option<Vote> {
        self.state.lock().expect("lock poisoned").vote_lock.clone()
    }

    /// The block precommit this node emitted in this round, if any.
    pub fn precommit_vote_lock(&self) -> Option<PrecommitVote> {
        self.state
            .lock()
            .expect("lock poisoned")
            .precommit_vote_lock
            .clone()
    }

    /// The proposal recorded for this round, if any.
    pub fn proposal(&self) -> Option<Proposal> {
        self.state.lock().expect("lock poisoned").proposal.clone()
    }

    /// Add a prevote to this round's lockset.
    pub(crate) fn add_vote(&self, vote: Vote, force_replace: bool) -> Result<bool, LockSetError> {
        let mut lockset = self.lockset.lock().expect("lock poisoned");
        if lockset.contains(&vote) {
            return Ok(false);
        }
        lockset.add(vote, force_replace)
    }

    /// Add a precommit to this round's lockset. Completing a quorum hands the
    /// commit to the consensus manager.
    pub(crate) fn add_precommit_vote(
        &self,
        cm: &ConsensusManager,
        vote: PrecommitVote,
        force_replace: bool,
    ) -> Result<bool, LockSetError> {
        let (inserted, quorum, snapshot) = {
            let mut lockset = self.precommit_lockset.lock().expect("lock poisoned");
            if lockset.contains(&vote) {
                return Ok(false);
            }
            let inserted = lockset.add(vote, force_replace)?;
            (inserted, lockset.has_quorum(), lockset.clone())
        };
        if let Some(hash) = quorum {
            debug!(
                height = self.height,
                round = self.round,
                blockhash = %hash,
                "precommit quorum reached"
            );
            cm.commit_precommit_lockset(hash, snapshot);
        }
        Ok(inserted)
    }

    /// Record a proposal. A round accepts exactly one proposal; a second one
    /// for a different block is rejected.
    pub(crate) fn add_proposal(&self, proposal: Proposal) -> bool {
        let mut state = self.state.lock().expect("lock poisoned");
        match &state.proposal {
            None => {
                state.proposal = Some(proposal);
                true
            }
            Some(existing) if existing.blockhash() == proposal.blockhash() => true,
            Some(existing) => {
                debug!(
                    height = self.height,
                    round = self.round,
                    recorded = ?existing.blockhash(),
                    rejected = ?proposal.blockhash(),
                    "conflicting proposal for this round rejected"
                );
                false
            }
        }
    }

    /// Arm the prevote deadline if it is not armed yet.
    pub(crate) fn arm_timeout_prevote(&self, cm: &ConsensusManager) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.timeout_prevote.is_none() {
            let delay = cm.config().prevote_delay(self.round);
            state.timeout_prevote = Some(cm.now() + delay);
            trace!(
                height = self.height,
                round = self.round,
                delay_ms = delay.as_millis() as u64,
                "armed prevote deadline"
            );
        }
    }

    /// Drive this round one step. Invoked repeatedly by the driver; safe to
    /// call at any time.
    pub(crate) fn process(&self, cm: &ConsensusManager, hm: &HeightManager) {
        let _guard = self.process_mu.lock().expect("lock poisoned");
        if hm.active_round() != self.round || cm.height() != self.height {
            return;
        }

        #[cfg(any(test, feature = "byzantine-testing"))]
        let strategy = cm.strategy();
        #[cfg(any(test, feature = "byzantine-testing"))]
        if strategy.no_response {
            return;
        }

        if let Some(proposal) = self.propose(cm, hm) {
            cm.broadcast(Message::from(proposal));
        }

        #[cfg(any(test, feature = "byzantine-testing"))]
        if strategy.always_agree {
            self.blind_agree(cm);
        }

        if self.vote_lock().is_none() {
            if let Some(vote) = self.decide_prevote(cm, hm) {
                cm.broadcast(Message::Vote(vote));
            }
        }

        let (prevotes_valid, prevote_quorum) = {
            let lockset = self.lockset.lock().expect("lock poisoned");
            (lockset.is_valid(), lockset.has_quorum())
        };
        if prevotes_valid && self.precommit_vote_lock().is_none() {
            if let Some(vote) = self.decide_precommit(cm, prevote_quorum) {
                cm.broadcast(Message::PrecommitVote(vote));
            }
        } else if !prevotes_valid {
            trace!(
                height = self.height,
                round = self.round,
                "prevote lockset not valid yet"
            );
        }

        self.maybe_advance_round(cm, hm);
    }

    /// Emit this round's proposal if this node is the elected proposer and
    /// has not proposed yet.
    fn propose(&self, cm: &ConsensusManager, hm: &HeightManager) -> Option<Proposal> {
        if !cm.is_waiting_for_proposal() {
            return None;
        }
        if cm.contract().proposer(self.height, self.round) != cm.coinbase() {
            return None;
        }
        if self.proposal().is_some() {
            return None;
        }
        debug!(
            height = self.height,
            round = self.round,
            "elected proposer for this round"
        );

        let proposal = if self.round == 0 {
            Proposal::Block(self.make_block_proposal(cm, hm, None)?)
        } else {
            let Some(round_lockset) = cm.last_valid_lockset() else {
                warn!(
                    height = self.height,
                    round = self.round,
                    "no valid lockset to justify a proposal after round 0"
                );
                return None;
            };
            if round_lockset.has_quorum().is_some() {
                match VotingInstruction::new(self.height, self.round, round_lockset, cm.secret_key())
                {
                    Ok(instruction) => Proposal::Instruction(instruction),
                    Err(err) => {
                        error!(height = self.height, round = self.round, %err, "building voting instruction failed");
                        return None;
                    }
                }
            } else if round_lockset.no_quorum() {
                Proposal::Block(self.make_block_proposal(cm, hm, Some(round_lockset))?)
            } else {
                debug!(
                    height = self.height,
                    round = self.round,
                    "previous round still undecided, holding the proposal"
                );
                return None;
            }
        };

        #[cfg(any(test, feature = "byzantine-testing"))]
        if cm.strategy().different_proposal {
            if let Proposal::Block(original) = &proposal {
                self.equivocate(cm, original);
            }
        }

        {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.proposal.is_none() {
                state.proposal = Some(proposal.clone());
            }
        }
        if let Proposal::Block(bp) = &proposal {
            cm.add_block_candidate(bp.clone());
        }
        Some(proposal)
    }

    /// Build a fresh block proposal from the prepared candidate block.
    fn make_block_proposal(
        &self,
        cm: &ConsensusManager,
        hm: &HeightManager,
        round_lockset: Option<LockSet>,
    ) -> Option<BlockProposal> {
        let Some(signing_lockset) = cm.last_committing_lockset() else {
            debug!(height = self.height, "no committing lockset for the parent yet");
            return None;
        };
        if signing_lockset.has_quorum().is_none() {
            warn!(height = self.height, "parent lockset lost its quorum");
            return None;
        }
        // A held precommit lock binds this node to a specific block; a fresh
        // proposal would contradict it.
        if self.round > 0 && hm.last_precommit_vote_lock().is_some() {
            warn!(
                height = self.height,
                round = self.round,
                "holding a precommit lock, refusing to propose a fresh block"
            );
            return None;
        }
        let Some(block) = cm.current_candidate() else {
            debug!(height = self.height, "no candidate block prepared");
            return None;
        };
        if block.number() != self.height {
            debug!(
                height = self.height,
                candidate = block.number(),
                "candidate block is for a different height"
            );
            return None;
        }
        match BlockProposal::new(
            self.height,
            self.round,
            block,
            signing_lockset,
            round_lockset,
            cm.secret_key(),
        ) {
            Ok(proposal) => {
                debug!(
                    height = self.height,
                    round = self.round,
                    blockhash = %proposal.blockhash(),
                    "built block proposal"
                );
                Some(proposal)
            }
            Err(err) => {
                error!(height = self.height, round = self.round, %err, "building block proposal failed");
                None
            }
        }
    }

    /// The prevote rule. Returns the vote that was emitted, if any; the vote
    /// is already admitted locally and the precommit deadline armed.
    fn decide_prevote(&self, cm: &ConsensusManager, hm: &HeightManager) -> Option<Vote> {
        let lock = hm.last_precommit_vote_lock();
        let proposal = self.proposal();

        #[cfg(any(test, feature = "byzantine-testing"))]
        if cm.strategy().always_vote {
            if let Some(hash) = proposal.as_ref().and_then(Proposal::blockhash) {
                return self.emit_prevote(cm, hash, VoteType::Block);
            }
        }

        let (blockhash, vote_type) = match &proposal {
            Some(Proposal::Instruction(instruction)) => {
                // A quorum formed above our lock releases it; otherwise the
                // lock keeps binding us.
                let released = lock.as_ref().map_or(true, |l| {
                    instruction.round_lockset.round().map_or(false, |r| r > l.round)
                });
                match (instruction.blockhash(), &lock) {
                    (Some(hash), _) if released => (hash, VoteType::Block),
                    (_, Some(lock)) => (lock.blockhash, VoteType::Block),
                    (_, None) => (Hash::ZERO, VoteType::Nil),
                }
            }
            Some(Proposal::Block(bp)) => match &lock {
                Some(lock) => (lock.blockhash, VoteType::Block),
                None => (bp.blockhash(), VoteType::Block),
            },
            None => match &lock {
                Some(lock) => (lock.blockhash, VoteType::Block),
                None => {
                    let deadline = self
                        .state
                        .lock()
                        .expect("lock poisoned")
                        .timeout_prevote;
                    match deadline {
                        Some(deadline) if cm.now() >= deadline => (Hash::ZERO, VoteType::Nil),
                        _ => {
                            trace!(
                                height = self.height,
                                round = self.round,
                                "waiting for a proposal"
                            );
                            return None;
                        }
                    }
                }
            },
        };
        self.emit_prevote(cm, blockhash, vote_type)
    }

    fn emit_prevote(
        &self,
        cm: &ConsensusManager,
        blockhash: Hash,
        vote_type: VoteType,
    ) -> Option<Vote> {
        let vote = match Vote::new(self.height, self.round, blockhash, vote_type, cm.secret_key())
        {
            Ok(vote) => vote,
            Err(err) => {
                error!(height = self.height, round = self.round, %err, "signing prevote failed");
                return None;
            }
        };
        {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.vote_lock.is_some() {
                return None;
            }
            state.vote_lock = Some(vote.clone());
            // Arm the precommit deadline so the round can end even when the
            // precommit phase never resolves.
            if state.timeout_precommit.is_none() {
                state.timeout_precommit = Some(cm.now() + cm.config().precommit_delay(self.round));
            }
        }
        debug!(
            height = self.height,
            round = self.round,
            blockhash = %vote.blockhash,
            kind = ?vote.vote_type,
            "prevoting"
        );
        self.admit_own_prevote(vote.clone());
        Some(vote)
    }

    /// The precommit rule. Only invoked once the prevote lockset is valid.
    fn decide_precommit(
        &self,
        cm: &ConsensusManager,
        prevote_quorum: Option<Hash>,
    ) -> Option<PrecommitVote> {
        let vote = if let Some(hash) = prevote_quorum {
            debug!(
                height = self.height,
                round = self.round,
                blockhash = %hash,
                "prevote quorum, precommitting the block"
            );
            let vote = match PrecommitVote::block(self.height, self.round, hash, cm.secret_key()) {
                Ok(vote) => vote,
                Err(err) => {
                    error!(height = self.height, round = self.round, %err, "signing precommit failed");
                    return None;
                }
            };
            let mut state = self.state.lock().expect("lock poisoned");
            if state.precommit_vote_lock.is_some() {
                return None;
            }
            state.precommit_vote_lock = Some(vote.clone());
            vote
        } else {
            let deadline = self
                .state
                .lock()
                .expect("lock poisoned")
                .timeout_prevote;
            match deadline {
                Some(deadline) if cm.now() >= deadline => {
                    debug!(
                        height = self.height,
                        round = self.round,
                        "no prevote quorum before the deadline, precommitting nil"
                    );
                    // Nil precommits do not set the lock: later rounds stay
                    // free to prevote differently.
                    match PrecommitVote::nil(self.height, self.round, cm.secret_key()) {
                        Ok(vote) => vote,
                        Err(err) => {
                            error!(height = self.height, round = self.round, %err, "signing precommit failed");
                            return None;
                        }
                    }
                }
                _ => {
                    trace!(
                        height = self.height,
                        round = self.round,
                        "prevotes undecided, waiting before precommitting"
                    );
                    return None;
                }
            }
        };
        self.admit_own_precommit(cm, vote.clone());
        Some(vote)
    }

    fn maybe_advance_round(&self, cm: &ConsensusManager, hm: &HeightManager) {
        let deadline = self
            .state
            .lock()
            .expect("lock poisoned")
            .timeout_precommit;
        let Some(deadline) = deadline else { return };
        if cm.now() < deadline {
            return;
        }
        let (valid, quorum) = {
            let lockset = self.precommit_lockset.lock().expect("lock poisoned");
            (lockset.is_valid(), lockset.has_quorum())
        };
        if valid && quorum.is_none() {
            debug!(
                height = self.height,
                round = self.round,
                next_round = self.round + 1,
                "precommits resolved without a quorum, advancing the round"
            );
            hm.advance_round();
        }
    }

    fn admit_own_prevote(&self, vote: Vote) {
        match self.add_vote(vote, false) {
            Ok(_) => {}
            Err(LockSetError::DoubleVote(_)) => {
                // This node signed two different prevotes for one round: a
                // programming error that must not reach the network.
                panic!(
                    "double vote by own node at height {} round {}",
                    self.height, self.round
                );
            }
            Err(err) => error!(height = self.height, round = self.round, %err, "admitting own prevote failed"),
        }
    }

    fn admit_own_precommit(&self, cm: &ConsensusManager, vote: PrecommitVote) {
        match self.add_precommit_vote(cm, vote, false) {
            Ok(_) => {}
            Err(LockSetError::DoubleVote(_)) => {
                panic!(
                    "double precommit by own node at height {} round {}",
                    self.height, self.round
                );
            }
            Err(err) => error!(height = self.height, round = self.round, %err, "admitting own precommit failed"),
        }
    }

    /// Sign and gossip a second, conflicting proposal.
    #[cfg(any(test, feature = "byzantine-testing"))]
    fn equivocate(&self, cm: &ConsensusManager, original: &BlockProposal) {
        let mut block = original.block.clone();
        block.header.extra = b"equivocation".to_vec();
        match BlockProposal::new(
            self.height,
            self.round,
            block,
            original.signing_lockset.clone(),
            original.round_lockset.clone(),
            cm.secret_key(),
        ) {
            Ok(conflicting) => {
                warn!(
                    height = self.height,
                    round = self.round,
                    first = %original.blockhash(),
                    second = %conflicting.blockhash(),
                    "byzantine strategy: gossiping a conflicting proposal"
                );
                cm.broadcast(Message::BlockProposal(conflicting));
            }
            Err(err) => error!(%err, "building conflicting proposal failed"),
        }
    }

    /// Prevote and precommit whatever proposal is recorded, immediately.
    #[cfg(any(test, feature = "byzantine-testing"))]
    fn blind_agree(&self, cm: &ConsensusManager) {
        if self.vote_lock().is_some() {
            return;
        }
        let Some(hash) = self.proposal().and_then(|p| p.blockhash()) else {
            return;
        };
        if let Some(vote) = self.emit_prevote(cm, hash, VoteType::Block) {
            cm.broadcast(Message::Vote(vote));
        }
        let precommit = match PrecommitVote::block(self.height, self.round, hash, cm.secret_key()) {
            Ok(vote) => vote,
            Err(_) => return,
        };
        {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.precommit_vote_lock.is_some() {
                return;
            }
            state.precommit_vote_lock = Some(precommit.clone());
        }
        self.admit_own_precommit(cm, precommit.clone());
        cm.broadcast(Message::PrecommitVote(precommit));
    }
}

impl std::fmt::Debug for RoundManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundManager")
            .field("height", &self.height)
            .field("round", &self.round)
            .finish_non_exhaustive()
    }
}
