//! Safety-focused scenarios: vote locks, fault strategies, and the halt on
//! conflicting quorums.

use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::time::Duration;

use lockstep_types::{
    BlockProposal, Hash, PrecommitLockSet, PrecommitVote, Proposal, SecretKey, Vote,
};

use crate::byzantine::ByzantineMode;
use crate::clock::ManualClock;
use crate::config::BftConfig;
use crate::consensus::ConsensusManager;
use crate::traits::Chain;
use crate::testonly::{genesis_block, make_candidate, Hub, MemoryChain, MemoryPool, MemoryStore, TestNet};
use crate::traits::PeerId;

fn keys(n: usize) -> Vec<SecretKey> {
    (0..n).map(|_| SecretKey::generate()).collect()
}

fn reload(key: &SecretKey) -> SecretKey {
    SecretKey::from_bytes(&key.to_bytes()).expect("valid key bytes")
}

/// A single engine for `keys[0]` with in-memory collaborators and no peers.
fn standalone(keys: &[SecretKey]) -> (Arc<ConsensusManager>, Arc<MemoryChain>, Arc<ManualClock>) {
    let validators = keys.iter().map(|k| k.address()).collect();
    let chain = Arc::new(MemoryChain::new(genesis_block()));
    let clock = Arc::new(ManualClock::new());
    let cm = ConsensusManager::new(
        BftConfig::new(validators, reload(&keys[0])),
        chain.clone(),
        Arc::new(MemoryPool::new()),
        Hub::new().endpoint(PeerId(0)),
        Arc::new(MemoryStore::new()),
        clock.clone(),
    )
    .expect("engine construction");
    (Arc::new(cm), chain, clock)
}

#[test]
#[should_panic(expected = "safety violation")]
fn test_conflicting_precommit_quorums_halt_the_process() {
    let keys = keys(4);
    let (cm, _chain, _clock) = standalone(&keys);

    // Quorum bookkeeping that ever records two different targets at one
    // height means quorum intersection failed; continuing would fork.
    for key in &keys[..3] {
        cm.add_precommit_vote(PrecommitVote::block(1, 0, Hash::keccak(b"fork-a"), key).unwrap());
    }
    for key in &keys[..3] {
        cm.add_precommit_vote(PrecommitVote::block(1, 1, Hash::keccak(b"fork-b"), key).unwrap());
    }
    cm.height_manager(1).last_quorum_precommit_lockset();
}

#[test]
fn test_precommit_lock_binds_later_prevotes() {
    let keys = keys(4);
    let (cm, chain, clock) = standalone(&keys);

    // validators[1] is the proposer for (1, 0); inject its proposal.
    let mut signing = PrecommitLockSet::new(0);
    signing
        .add(
            PrecommitVote::block(0, 0, chain.genesis().hash(), &keys[1]).unwrap(),
            false,
        )
        .unwrap();
    let proposal = BlockProposal::new(
        1,
        0,
        make_candidate(&chain, keys[1].address()),
        signing,
        None,
        &keys[1],
    )
    .unwrap();
    let locked_hash = proposal.blockhash();
    assert!(cm.add_proposal(Proposal::Block(proposal), None));

    // Two external prevotes plus our own make a quorum on the block.
    cm.add_vote(Vote::block(1, 0, locked_hash, &keys[1]).unwrap());
    cm.add_vote(Vote::block(1, 0, locked_hash, &keys[2]).unwrap());

    let (found, _committed) = sync_channel(1);
    assert!(cm.begin_height(make_candidate(&chain, keys[0].address()), found));
    cm.process();

    let hm = cm.height_manager(1);
    let lock = hm.round_manager(0).precommit_vote_lock().expect("locked");
    assert_eq!(lock.blockhash, locked_hash);
    assert_eq!(
        hm.last_precommit_vote_lock().map(|l| l.blockhash),
        Some(locked_hash)
    );
    assert!(hm.last_quorum_lockset().is_some());

    // The round resolves without a precommit quorum and advances.
    cm.add_precommit_vote(PrecommitVote::nil(1, 0, &keys[1]).unwrap());
    cm.add_precommit_vote(PrecommitVote::nil(1, 0, &keys[2]).unwrap());
    assert!(hm.last_valid_precommit_lockset().is_some());
    clock.advance(Duration::from_secs(10));
    cm.process();
    assert_eq!(cm.round(), 1);

    // Every later prevote at this height repeats the locked hash.
    cm.process();
    let revote = hm.round_manager(1).vote_lock().expect("prevoted in round 1");
    assert_eq!(revote.blockhash, locked_hash);
}

#[test]
fn test_own_votes_are_set_at_most_once_per_round() {
    let keys = keys(4);
    let (cm, chain, _clock) = standalone(&keys);

    let mut signing = PrecommitLockSet::new(0);
    signing
        .add(
            PrecommitVote::block(0, 0, chain.genesis().hash(), &keys[1]).unwrap(),
            false,
        )
        .unwrap();
    let proposal = BlockProposal::new(
        1,
        0,
        make_candidate(&chain, keys[1].address()),
        signing,
        None,
        &keys[1],
    )
    .unwrap();
    assert!(cm.add_proposal(Proposal::Block(proposal), None));
    cm.add_vote(Vote::block(1, 0, Hash::keccak(b"other"), &keys[1]).unwrap());
    cm.add_vote(Vote::block(1, 0, Hash::keccak(b"other"), &keys[2]).unwrap());

    let (found, _committed) = sync_channel(1);
    assert!(cm.begin_height(make_candidate(&chain, keys[0].address()), found));
    let rm = cm.height_manager(1).round_manager(0);

    cm.process();
    let first = rm.vote_lock().expect("prevoted");
    for _ in 0..3 {
        cm.process();
    }
    assert_eq!(rm.vote_lock().expect("still prevoted"), first);
    assert_eq!(cm.height_manager(1).last_vote_lock(), Some(first));
}

#[test]
fn test_deferred_commit_handoff_retries_on_the_next_tick() {
    let keys = keys(4);
    let (cm, chain, _clock) = standalone(&keys);

    // validators[1] is the proposer for (1, 0); inject its proposal.
    let mut signing = PrecommitLockSet::new(0);
    signing
        .add(
            PrecommitVote::block(0, 0, chain.genesis().hash(), &keys[1]).unwrap(),
            false,
        )
        .unwrap();
    let proposal = BlockProposal::new(
        1,
        0,
        make_candidate(&chain, keys[1].address()),
        signing,
        None,
        &keys[1],
    )
    .unwrap();
    let blockhash = proposal.blockhash();
    assert!(cm.add_proposal(Proposal::Block(proposal), None));
    cm.add_vote(Vote::block(1, 0, blockhash, &keys[1]).unwrap());
    cm.add_vote(Vote::block(1, 0, blockhash, &keys[2]).unwrap());

    // Occupy the block-builder channel so the handoff cannot be delivered.
    let (found, committed) = sync_channel(1);
    found.try_send(genesis_block()).unwrap();
    assert!(cm.begin_height(make_candidate(&chain, keys[0].address()), found));

    // Prevote quorum, then the precommit quorum completes on ingress while
    // the channel is still full: the commit is deferred, not lost.
    cm.process();
    cm.add_precommit_vote(PrecommitVote::block(1, 0, blockhash, &keys[1]).unwrap());
    cm.add_precommit_vote(PrecommitVote::block(1, 0, blockhash, &keys[2]).unwrap());
    assert!(cm.is_enabled(), "the undelivered commit must not disable the driver");

    // The builder drains its channel; the next tick delivers the commit
    // without any further votes arriving.
    assert_eq!(committed.recv().unwrap().hash(), genesis_block().hash());
    cm.process();
    assert!(!cm.is_enabled());
    assert_eq!(committed.recv().unwrap().hash(), blockhash);
}

#[test]
fn test_highest_committing_lockset_tracks_the_newest_height() {
    let keys = keys(4);
    let (cm, chain, _clock) = standalone(&keys);

    // Right after construction the only committing lockset is the genesis
    // self-vote.
    let highest = cm.highest_committing_lockset().expect("genesis lockset");
    assert_eq!(highest.has_quorum(), Some(chain.genesis().hash()));

    let hash = Hash::keccak(b"first");
    for key in &keys[..3] {
        cm.add_precommit_vote(PrecommitVote::block(1, 0, hash, key).unwrap());
    }
    let highest = cm.highest_committing_lockset().expect("height 1 lockset");
    assert_eq!(highest.has_quorum(), Some(hash));
}

#[test]
fn test_always_vote_validator_does_not_break_consensus() {
    let net = TestNet::new_with(4, |i, config| {
        if i == 2 {
            config.byzantine_mode = ByzantineMode::AlwaysVote;
        }
    });
    let receivers = net.begin_all();

    let mut committed = vec![None; 4];
    let done = net.run_until(16, || {
        for (i, receiver) in receivers.iter().enumerate() {
            if committed[i].is_none() {
                committed[i] = receiver.try_recv().ok();
            }
        }
        committed.iter().all(|c| c.is_some())
    });
    assert!(done, "all validators should commit");

    let hashes: Vec<Hash> = committed.iter().flatten().map(|b: &lockstep_types::Block| b.hash()).collect();
    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_double_proposal_is_contained() {
    // validators[1] proposes two conflicting blocks for (1, 0).
    let net = TestNet::new_with(4, |i, config| {
        if i == 1 {
            config.byzantine_mode = ByzantineMode::DifferentProposal;
        }
    });
    let receivers = net.begin_all();

    let mut committed = vec![None; 4];
    let done = net.run_until(16, || {
        for (i, receiver) in receivers.iter().enumerate() {
            if committed[i].is_none() {
                committed[i] = receiver.try_recv().ok();
            }
        }
        committed.iter().filter(|c| c.is_some()).count() >= 3
    });
    assert!(done, "honest validators failed to commit");

    // Two distinct proposals were actually gossiped for the round.
    let proposed: Vec<Hash> = net
        .hub
        .messages()
        .into_iter()
        .filter_map(|(_, message)| match message {
            lockstep_messages::Message::BlockProposal(bp) if bp.height == 1 => {
                Some(bp.blockhash())
            }
            _ => None,
        })
        .collect();
    assert_eq!(proposed.len(), 2);
    assert_ne!(proposed[0], proposed[1]);

    // Safety: every commit is for the same block, and it is one of the two.
    let hashes: Vec<Hash> = committed
        .iter()
        .flatten()
        .map(|block: &lockstep_types::Block| block.hash())
        .collect();
    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    assert!(proposed.contains(&hashes[0]));

    // Honest nodes kept the proposal they saw first and rejected the other.
    let recorded = net.nodes[0]
        .cm
        .height_manager(1)
        .round_manager(0)
        .proposal()
        .expect("recorded a proposal");
    assert_eq!(recorded.blockhash(), Some(hashes[0]));
}

#[test]
fn test_silent_byzantine_validator_is_tolerated() {
    let net = TestNet::new_with(4, |i, config| {
        if i == 3 {
            config.byzantine_mode = ByzantineMode::NoResponse;
        }
    });
    let receivers = net.begin_all();

    let mut committed = vec![None; 4];
    let done = net.run_until(16, || {
        for (i, receiver) in receivers.iter().enumerate() {
            if committed[i].is_none() {
                committed[i] = receiver.try_recv().ok();
            }
        }
        committed.iter().take(3).all(|c| c.is_some())
    });
    assert!(done, "three honest validators must commit without the fourth");

    let hashes: Vec<Hash> = committed.iter().flatten().map(|b| b.hash()).collect();
    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_always_agree_validator_does_not_break_consensus() {
    let net = TestNet::new_with(4, |i, config| {
        if i == 2 {
            config.byzantine_mode = ByzantineMode::AlwaysAgree;
        }
    });
    let receivers = net.begin_all();

    let mut committed = vec![None; 4];
    let done = net.run_until(16, || {
        for (i, receiver) in receivers.iter().enumerate() {
            if committed[i].is_none() {
                committed[i] = receiver.try_recv().ok();
            }
        }
        committed.iter().all(|c| c.is_some())
    });
    assert!(done, "all validators should commit");

    let hashes: Vec<Hash> = committed.iter().flatten().map(|b| b.hash()).collect();
    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
}
