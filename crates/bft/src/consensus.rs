//! The consensus manager: ingress routing, commit path, and driver loop.
//!
//! Ingress methods are callable from transport threads at any moment; a
//! single driver thread repeatedly calls [`ConsensusManager::process`] on the
//! active height. The driver parks on a condition variable with a 100 ms
//! timeout and every ingress call wakes it, so reactions are edge-triggered
//! with a polling floor.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use lockstep_messages::Message;
use lockstep_types::{
    Address, Block, BlockHeader, BlockProposal, Hash, Height, LockSet, PrecommitLockSet,
    PrecommitVote, Proposal, Ready, SecretKey, Vote, VoteError,
};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{BftConfig, ConfigError};
use crate::height::HeightManager;
use crate::round::RoundManager;
use crate::store::{ConsensusStore, StoreError};
use crate::synchronizer::{SyncError, Synchronizer};
use crate::traits::{Chain, KvStore, PeerId, TransactionPool, Transport};
use crate::validators::ValidatorContract;

#[cfg(any(test, feature = "byzantine-testing"))]
use crate::byzantine::Strategy;

/// Fatal engine construction and recovery errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Persistent state could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Signing the genesis vote failed.
    #[error(transparent)]
    Vote(#[from] VoteError),
}

struct ReadyState {
    validators: HashSet<Address>,
    nonce: u64,
}

/// Top level of the consensus state machine.
///
/// Owns the height managers, the block-candidate map, the ready-validator
/// set and the collaborator handles; hands rounds a `&ConsensusManager`
/// instead of back-references.
pub struct ConsensusManager {
    config: BftConfig,
    contract: ValidatorContract,
    chain: Arc<dyn Chain>,
    pool: Arc<dyn TransactionPool>,
    transport: Arc<dyn Transport>,
    store: ConsensusStore,
    clock: Arc<dyn Clock>,
    synchronizer: Synchronizer,

    heights: RwLock<HashMap<Height, Arc<HeightManager>>>,
    candidates: Mutex<HashMap<Hash, BlockProposal>>,
    ready: Mutex<ReadyState>,
    current_block: Mutex<Option<Block>>,
    found: Mutex<Option<SyncSender<Block>>>,
    // A quorate commit whose handoff could not be delivered yet; retried on
    // every tick until the block-builder channel accepts it.
    deferred_commit: Mutex<Option<(Hash, PrecommitLockSet)>>,
    enabled: AtomicBool,
    wakeup: (Mutex<bool>, Condvar),
}

impl ConsensusManager {
    /// Build the engine and replay persisted lockset state.
    pub fn new(
        config: BftConfig,
        chain: Arc<dyn Chain>,
        pool: Arc<dyn TransactionPool>,
        transport: Arc<dyn Transport>,
        db: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let contract = ValidatorContract::new(config.validators.clone());
        let synchronizer = Synchronizer::new(config.sync_retry_interval);
        let cm = Self {
            contract,
            chain,
            pool,
            transport,
            store: ConsensusStore::new(db),
            clock,
            synchronizer,
            heights: RwLock::new(HashMap::new()),
            candidates: Mutex::new(HashMap::new()),
            ready: Mutex::new(ReadyState {
                validators: HashSet::new(),
                nonce: 0,
            }),
            current_block: Mutex::new(None),
            found: Mutex::new(None),
            deferred_commit: Mutex::new(None),
            enabled: AtomicBool::new(false),
            wakeup: (Mutex::new(false), Condvar::new()),
            config,
        };
        cm.initialize_locksets()?;
        // Votes replayed from disk do not prove anyone is online now.
        {
            let mut ready = cm.ready.lock().expect("lock poisoned");
            ready.validators.clear();
            ready.validators.insert(cm.config.coinbase);
        }
        Ok(cm)
    }

    /// Sign the genesis precommit and re-admit the persisted committing
    /// lockset, so restart resumes from the last committed block.
    fn initialize_locksets(&self) -> Result<(), EngineError> {
        debug!("initializing locksets");
        let genesis_hash = self.chain.genesis().hash();
        let vote = PrecommitVote::block(0, 0, genesis_hash, &self.config.secret_key)?;
        self.add_precommit_vote(vote);

        if let Some(lockset) = self.store.last_committing_lockset()? {
            match lockset.has_quorum() {
                Some(hash) if hash == self.chain.current_block().hash() => {
                    for vote in lockset.votes() {
                        self.add_precommit_vote(vote.clone());
                    }
                }
                _ => error!(
                    "persisted last committing lockset does not match the chain head, ignoring"
                ),
            }
        }
        Ok(())
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    /// The validator contract.
    pub fn contract(&self) -> &ValidatorContract {
        &self.contract
    }

    /// The engine configuration.
    pub fn config(&self) -> &BftConfig {
        &self.config
    }

    /// This node's validator address.
    pub fn coinbase(&self) -> Address {
        self.config.coinbase
    }

    /// The persistent lockset store.
    pub fn store(&self) -> &ConsensusStore {
        &self.store
    }

    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.config.secret_key
    }

    pub(crate) fn now(&self) -> Duration {
        self.clock.now()
    }

    #[cfg(any(test, feature = "byzantine-testing"))]
    pub(crate) fn strategy(&self) -> Strategy {
        self.config.byzantine_mode.strategy()
    }

    /// The height under agreement: one above the chain head.
    pub fn height(&self) -> Height {
        self.chain.current_block().number() + 1
    }

    /// The active round at the current height.
    pub fn round(&self) -> u64 {
        self.height_manager(self.height()).active_round()
    }

    /// The height manager for `height`, created lazily.
    pub fn height_manager(&self, height: Height) -> Arc<HeightManager> {
        if let Some(hm) = self.heights.read().expect("lock poisoned").get(&height) {
            return hm.clone();
        }
        let mut heights = self.heights.write().expect("lock poisoned");
        heights
            .entry(height)
            .or_insert_with(|| {
                Arc::new(HeightManager::new(
                    height,
                    self.contract.eligible_votes(height),
                ))
            })
            .clone()
    }

    /// The round manager the driver is currently working on.
    pub fn active_round_manager(&self) -> Arc<RoundManager> {
        let hm = self.height_manager(self.height());
        hm.round_manager(hm.active_round())
    }

    /// Empty-block policy: propose when empty blocks are allowed, when
    /// transactions are pending, or while the chain is in its initial run-up.
    pub(crate) fn is_waiting_for_proposal(&self) -> bool {
        self.config.allow_empty_blocks
            || !self.pool.pending().is_empty()
            || self.height() <= self.config.num_initial_blocks
    }

    pub(crate) fn broadcast(&self, message: Message) {
        self.transport.broadcast(message);
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    // ── Ready tracking ─────────────────────────────────────────────────────

    /// Whether more than two thirds of the validators have been heard from.
    pub fn is_ready(&self) -> bool {
        let heard = self.ready.lock().expect("lock poisoned").validators.len() as u64;
        3 * heard > 2 * self.contract.len() as u64
    }

    pub(crate) fn mark_ready(&self, validator: Address) {
        let mut ready = self.ready.lock().expect("lock poisoned");
        ready.validators.insert(validator);
    }

    /// Broadcast a signed Ready heartbeat. Non-forced sends are skipped once
    /// enough validators have been heard from.
    pub fn send_ready(&self, force: bool) {
        if self.is_ready() && !force {
            return;
        }
        let nonce = {
            let mut ready = self.ready.lock().expect("lock poisoned");
            let nonce = ready.nonce;
            ready.nonce += 1;
            nonce
        };
        let lockset = self.active_round_manager().lockset();
        match Ready::new(nonce, lockset, &self.config.secret_key) {
            Ok(ready) => self.broadcast(Message::Ready(ready)),
            Err(err) => error!(%err, "signing ready heartbeat failed"),
        }
    }

    // ── Ingress ────────────────────────────────────────────────────────────

    /// Route one decoded wire message.
    pub fn handle_message(&self, message: Message, from: PeerId) {
        match message {
            Message::Ready(ready) => self.add_ready(ready),
            Message::BlockProposal(proposal) => {
                self.add_proposal(Proposal::Block(proposal), Some(from));
            }
            Message::VotingInstruction(instruction) => {
                self.add_proposal(Proposal::Instruction(instruction), Some(from));
            }
            Message::Vote(vote) => {
                self.add_vote(vote);
            }
            Message::PrecommitVote(vote) => {
                self.add_precommit_vote(vote);
            }
            Message::PrecommitLockSets(locksets) => self.add_precommit_locksets(locksets),
            Message::GetPrecommitLockSets(heights) => {
                self.on_get_precommit_locksets(from, heights)
            }
        }
    }

    /// Record a Ready heartbeat. The first heartbeat from each validator is
    /// answered with our own, so mutual readiness converges without waiting
    /// for the next tick.
    pub fn add_ready(&self, ready: Ready) {
        let Ok(sender) = ready.sender() else {
            debug!("ready with unrecoverable signature dropped");
            return;
        };
        if !self.contract.is_validator(&sender) {
            debug!(%sender, "ready from a non-validator dropped");
            return;
        }
        let newly_heard = {
            let mut state = self.ready.lock().expect("lock poisoned");
            state.validators.insert(sender)
        };
        if newly_heard {
            self.send_ready(true);
        }
        self.wake();
    }

    /// Admit a prevote.
    pub fn add_vote(&self, vote: Vote) -> bool {
        let Ok(sender) = vote.sender() else {
            debug!("prevote with unrecoverable signature dropped");
            return false;
        };
        if !self.contract.is_validator(&sender) {
            debug!(%sender, "prevote from a non-validator dropped");
            return false;
        }
        self.mark_ready(sender);
        let added = self.height_manager(vote.height).add_vote(self, vote);
        self.wake();
        added
    }

    /// Admit a precommit. Completing a quorum commits the block.
    pub fn add_precommit_vote(&self, vote: PrecommitVote) -> bool {
        let Ok(sender) = vote.sender() else {
            debug!("precommit with unrecoverable signature dropped");
            return false;
        };
        if !self.contract.is_validator(&sender) {
            debug!(%sender, "precommit from a non-validator dropped");
            return false;
        }
        self.mark_ready(sender);
        let added = self
            .height_manager(vote.height)
            .add_precommit_vote(self, vote);
        self.wake();
        added
    }

    /// Admit a proposal after checking election and proof shape.
    pub fn add_proposal(&self, proposal: Proposal, peer: Option<PeerId>) -> bool {
        if proposal.height() < self.height() {
            debug!(
                height = proposal.height(),
                current = self.height(),
                "proposal from the past dropped"
            );
            return false;
        }
        let Ok(sender) = proposal.sender() else {
            debug!("proposal with unrecoverable signature dropped");
            return false;
        };
        if !self.contract.is_validator(&sender) || !self.contract.is_proposer(&proposal) {
            debug!(%sender, "proposal from a non-elected sender dropped");
            return false;
        }
        self.mark_ready(sender);

        match &proposal {
            Proposal::Block(bp) => {
                if !self.check_block_proposal(bp) {
                    return false;
                }
                // The embedded parent proof is evidence in its own right.
                let parent_hm = self.height_manager(bp.height - 1);
                for vote in bp.signing_lockset.votes() {
                    parent_hm.add_precommit_vote(self, vote.clone());
                }
                self.add_block_candidate(bp.clone());
                if let Some(peer) = peer {
                    self.synchronizer.on_proposal(&proposal, peer);
                }
            }
            Proposal::Instruction(instruction) => {
                if !check_voting_instruction(instruction) {
                    return false;
                }
            }
        }

        let added = self.height_manager(proposal.height()).add_proposal(proposal);
        self.wake();
        added
    }

    /// Receiver-side shape rules for a fresh block proposal.
    fn check_block_proposal(&self, bp: &BlockProposal) -> bool {
        if bp.block.number() != bp.height {
            debug!(height = bp.height, "proposal block number mismatch");
            return false;
        }
        match (&bp.round_lockset, bp.round) {
            (None, 0) => {}
            (Some(rl), round) if round > 0 => {
                // A fresh block after round 0 is only justified by a resolved
                // nil round right before it.
                if !rl.no_quorum() {
                    debug!(height = bp.height, round, "round lockset is not a nil quorum");
                    return false;
                }
                if rl.height() != Some(bp.height) || rl.round() != Some(round - 1) {
                    debug!(height = bp.height, round, "round lockset is for the wrong round");
                    return false;
                }
            }
            _ => {
                debug!(height = bp.height, round = bp.round, "proposal round lockset shape invalid");
                return false;
            }
        }
        if bp.signing_lockset.has_quorum().is_none()
            || bp.signing_lockset.height() != Some(bp.height - 1)
        {
            debug!(height = bp.height, "signing lockset is not a parent quorum");
            return false;
        }
        true
    }

    pub(crate) fn add_block_candidate(&self, proposal: BlockProposal) {
        let mut candidates = self.candidates.lock().expect("lock poisoned");
        candidates.insert(proposal.blockhash(), proposal);
    }

    pub(crate) fn current_candidate(&self) -> Option<Block> {
        self.current_block.lock().expect("lock poisoned").clone()
    }

    /// Persist catch-up locksets received in bulk.
    pub fn add_precommit_locksets(&self, locksets: Vec<PrecommitLockSet>) {
        for lockset in locksets {
            let Some(hash) = lockset.has_quorum() else {
                debug!("catch-up lockset without quorum dropped");
                continue;
            };
            let senders: Result<Vec<Address>, _> =
                lockset.votes().iter().map(|vote| vote.sender()).collect();
            let all_validators = match senders {
                Ok(senders) => senders.iter().all(|s| self.contract.is_validator(s)),
                Err(_) => false,
            };
            if !all_validators {
                debug!(blockhash = %hash, "catch-up lockset with non-validator votes dropped");
                continue;
            }
            if let Err(err) = self.store.store_precommit_lockset(&hash, &lockset) {
                error!(blockhash = %hash, %err, "persisting catch-up lockset failed");
                continue;
            }
            debug!(blockhash = %hash, "catch-up lockset persisted");
            if let Some(height) = lockset.height() {
                self.synchronizer.satisfied(height);
            }
        }
        self.wake();
    }

    /// Serve a catch-up request with every requested lockset we hold.
    pub fn on_get_precommit_locksets(&self, peer: PeerId, heights: Vec<Height>) {
        let mut found = Vec::new();
        for height in heights {
            match self.precommit_lockset_by_height(height) {
                Ok(Some(lockset)) => found.push(lockset),
                Ok(None) => debug!(height, %peer, "no stored lockset for requested height"),
                Err(err) => warn!(height, %err, "lockset lookup failed"),
            }
        }
        if !found.is_empty() {
            self.transport.send_precommit_locksets(peer, found);
        }
    }

    /// The stored committing lockset of an already-committed height.
    pub fn precommit_lockset_by_height(
        &self,
        height: Height,
    ) -> Result<Option<PrecommitLockSet>, StoreError> {
        if height >= self.height() {
            return Ok(None);
        }
        let Some(block) = self.chain.block_by_number(height) else {
            return Ok(None);
        };
        self.store.precommit_lockset(&block.hash())
    }

    // ── Lockset queries ────────────────────────────────────────────────────

    /// The quorum precommit lockset of the parent height: the proof a fresh
    /// proposal must embed.
    pub fn last_committing_lockset(&self) -> Option<PrecommitLockSet> {
        self.height_manager(self.height() - 1)
            .last_quorum_precommit_lockset()
    }

    /// The quorum precommit lockset of the highest height known; seeds
    /// catch-up replies.
    pub fn highest_committing_lockset(&self) -> Option<PrecommitLockSet> {
        let heights: Vec<Arc<HeightManager>> = {
            let map = self.heights.read().expect("lock poisoned");
            let mut heights: Vec<_> = map.values().cloned().collect();
            heights.sort_by_key(|hm| hm.height());
            heights
        };
        heights
            .into_iter()
            .rev()
            .find_map(|hm| hm.last_quorum_precommit_lockset())
    }

    /// The highest-round valid prevote lockset at the current height.
    pub fn last_valid_lockset(&self) -> Option<LockSet> {
        self.height_manager(self.height()).last_valid_lockset()
    }

    // ── Commit path ────────────────────────────────────────────────────────

    /// Commit the block a precommit quorum named, if its candidate extends
    /// the current head. The quorum check and the commit action share the
    /// candidate-map critical region so exactly one commit fires per
    /// `(height, blockhash)`.
    pub(crate) fn commit_precommit_lockset(&self, hash: Hash, lockset: PrecommitLockSet) {
        let candidates = self.candidates.lock().expect("lock poisoned");
        let Some(proposal) = candidates.get(&hash) else {
            // No local candidate (e.g. the proposal never arrived): keep the
            // proof for catch-up but there is nothing to import.
            if lockset.has_quorum() == Some(hash) {
                if let Err(err) = self.store.store_precommit_lockset(&hash, &lockset) {
                    error!(blockhash = %hash, %err, "persisting commit lockset failed");
                }
                if let Some(height) = lockset.height() {
                    self.synchronizer.satisfied(height);
                }
            }
            return;
        };
        if proposal.block.parent_hash() != self.chain.current_block().hash() {
            debug!(
                blockhash = %hash,
                parent = %proposal.block.parent_hash(),
                "quorum block does not extend the current head"
            );
            return;
        }
        if lockset.has_quorum() != Some(hash) {
            return;
        }

        // Persist before the hand-off: a commit lockset on disk without an
        // imported block is recoverable, the reverse is not.
        if let Err(err) = self.store.store_commit(&hash, &lockset) {
            error!(blockhash = %hash, %err, "persisting commit failed, not advancing");
            return;
        }

        let found = self.found.lock().expect("lock poisoned");
        let Some(channel) = found.as_ref() else {
            debug!(blockhash = %hash, "no block-builder channel, commit deferred");
            self.defer_commit(hash, lockset);
            return;
        };
        match channel.try_send(proposal.block.clone()) {
            Ok(()) => {
                info!(
                    height = proposal.height,
                    round = proposal.round,
                    blockhash = %hash,
                    "block committed"
                );
                if let Some(height) = lockset.height() {
                    self.synchronizer.satisfied(height);
                }
                let mut deferred = self.deferred_commit.lock().expect("lock poisoned");
                if deferred.as_ref().map(|(h, _)| *h) == Some(hash) {
                    *deferred = None;
                }
                self.disable();
                self.wake();
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                debug!(blockhash = %hash, "block-builder channel unavailable, commit deferred");
                self.defer_commit(hash, lockset);
            }
        }
    }

    fn defer_commit(&self, hash: Hash, lockset: PrecommitLockSet) {
        *self.deferred_commit.lock().expect("lock poisoned") = Some((hash, lockset));
    }

    /// Re-attempt a commit whose handoff was deferred. Ingress only drives
    /// the commit path on fresh precommits, so once every validator has
    /// voted this retry is what finishes a commit that found the channel
    /// busy.
    fn retry_deferred_commit(&self) {
        let deferred = self.deferred_commit.lock().expect("lock poisoned").take();
        if let Some((hash, lockset)) = deferred {
            debug!(blockhash = %hash, "retrying deferred commit");
            self.commit_precommit_lockset(hash, lockset);
        }
    }

    /// Drop candidates and height managers the chain head has passed.
    pub fn cleanup(&self) {
        let head = self.chain.current_block().number();
        self.candidates
            .lock()
            .expect("lock poisoned")
            .retain(|_, proposal| proposal.height > head);
        // The head's own manager stays: it holds the committing lockset the
        // next proposal embeds.
        self.heights
            .write()
            .expect("lock poisoned")
            .retain(|height, _| *height >= head);
    }

    // ── Driver ─────────────────────────────────────────────────────────────

    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether the driver is currently processing a height.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Start working on the next height with a prepared candidate block. The
    /// committed block is handed back over `found`.
    pub fn begin_height(&self, candidate: Block, found: SyncSender<Block>) -> bool {
        if !self.contract.is_validator(&self.coinbase()) {
            info!("node is not a validator");
            return false;
        }
        if let Some(lockset) = self.last_committing_lockset() {
            if let Err(err) = self.store.store_last_committing_lockset(&lockset) {
                error!(%err, "persisting last committing lockset failed");
            }
        }
        if self.height() != candidate.number() {
            debug!(
                height = self.height(),
                candidate = candidate.number(),
                "stale candidate block"
            );
            return false;
        }
        *self.current_block.lock().expect("lock poisoned") = Some(candidate);
        *self.found.lock().expect("lock poisoned") = Some(found);
        self.enable();
        true
    }

    /// One driver tick: advance the active round and prune stale state.
    pub fn process(&self) {
        if !self.is_enabled() {
            return;
        }
        self.retry_deferred_commit();
        if !self.is_enabled() {
            return;
        }
        if !self.is_ready() {
            debug!("not enough validators online yet");
            self.send_ready(false);
            return;
        }
        if self.is_waiting_for_proposal() {
            self.active_round_manager().arm_timeout_prevote(self);
        }
        self.height_manager(self.height()).process(self);
        self.cleanup();
    }

    /// Drive the current height to commitment: tick every 100 ms or whenever
    /// ingress signals work, until the block commits or `abort` is set.
    pub fn drive(&self, candidate: Block, found: SyncSender<Block>, abort: &AtomicBool) {
        if !self.begin_height(candidate, found) {
            return;
        }
        while self.is_enabled() && !abort.load(Ordering::SeqCst) {
            self.process();
            self.wait_for_work(Duration::from_millis(100));
        }
        if abort.load(Ordering::SeqCst) {
            *self.current_block.lock().expect("lock poisoned") = None;
        }
    }

    /// Block until a committing lockset with quorum for this header is
    /// persisted, fetching it from peers as needed.
    pub fn verify_votes(&self, header: &BlockHeader) -> Result<(), SyncError> {
        self.synchronizer.verify_votes(self, header)
    }

    pub(crate) fn wake(&self) {
        let (lock, condvar) = &self.wakeup;
        let mut pending = lock.lock().expect("lock poisoned");
        *pending = true;
        condvar.notify_one();
    }

    fn wait_for_work(&self, timeout: Duration) {
        let (lock, condvar) = &self.wakeup;
        let mut pending = lock.lock().expect("lock poisoned");
        if !*pending {
            let (guard, _) = condvar
                .wait_timeout(pending, timeout)
                .expect("lock poisoned");
            pending = guard;
        }
        *pending = false;
    }
}

impl std::fmt::Debug for ConsensusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusManager")
            .field("coinbase", &self.config.coinbase)
            .field("validators", &self.contract.len())
            .field("height", &self.height())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Receiver-side shape rules for a voting instruction.
fn check_voting_instruction(instruction: &lockstep_types::VotingInstruction) -> bool {
    if instruction.round == 0 {
        debug!(height = instruction.height, "voting instruction at round 0 dropped");
        return false;
    }
    let rl = &instruction.round_lockset;
    if rl.height() != Some(instruction.height) || rl.round() != Some(instruction.round - 1) {
        debug!(
            height = instruction.height,
            round = instruction.round,
            "voting instruction lockset is for the wrong round"
        );
        return false;
    }
    if rl.has_quorum().is_none() {
        debug!(
            height = instruction.height,
            round = instruction.round,
            "voting instruction lockset has no quorum"
        );
        return false;
    }
    true
}
